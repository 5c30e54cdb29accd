use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;

use rivulet::registry::{ModuleDescriptor, NodeSetDescriptor};
use rivulet::{
    DeployType, FlowPayload, FlowsManager, FlowsOptions, FlowsState, HookAction, HookManager,
    Message, NodeConstructor, NodeInstance, Payload, RawNode, RuntimeEvents, SettingsManager,
    Storage, StoredFlows, diff_configs, parse_config,
};
use rivulet::storage::InMemoryStorage;

type Captured = Arc<StdMutex<Vec<(String, Message)>>>;

struct TestRuntime {
    storage: Storage,
    registry: Arc<rivulet::NodeRegistry>,
    hooks: Arc<HookManager>,
    events: Arc<RuntimeEvents>,
    settings: Arc<SettingsManager>,
    manager: Arc<FlowsManager>,
    captured: Captured,
    constructed: Arc<AtomicUsize>,
}

fn capture_ctor(captured: Captured, constructed: Arc<AtomicUsize>) -> NodeConstructor {
    Arc::new(move |node: Arc<NodeInstance>, _record| {
        constructed.fetch_add(1, Ordering::SeqCst);
        let captured = captured.clone();
        node.on_input(Arc::new(move |msg, node| {
            let captured = captured.clone();
            Box::pin(async move {
                captured.lock().unwrap().push((node.id().to_string(), msg));
                Ok(())
            })
        }));
        Ok(())
    })
}

fn relay_ctor(constructed: Arc<AtomicUsize>) -> NodeConstructor {
    Arc::new(move |node: Arc<NodeInstance>, _record| {
        constructed.fetch_add(1, Ordering::SeqCst);
        node.on_input(Arc::new(|msg, node| {
            Box::pin(async move {
                node.send(msg).await;
                Ok(())
            })
        }));
        Ok(())
    })
}

async fn runtime() -> TestRuntime {
    let storage = Storage(InMemoryStorage::new());
    let events = RuntimeEvents::new();
    let hooks = HookManager::new();
    let settings = SettingsManager::init(storage.clone(), Default::default())
        .await
        .unwrap();
    let registry = rivulet::NodeRegistry::new(events.clone(), hooks.clone(), settings.clone());

    let captured: Captured = Arc::new(StdMutex::new(Vec::new()));
    let constructed = Arc::new(AtomicUsize::new(0));
    registry
        .add_module(
            ModuleDescriptor::new("test", "1.0.0")
                .with_set(NodeSetDescriptor::new("test", "nodes", vec!["relay", "capture"])),
        )
        .unwrap();
    registry
        .register_node_constructor(
            "test/nodes",
            "relay",
            relay_ctor(constructed.clone()),
        )
        .unwrap();
    registry
        .register_node_constructor(
            "test/nodes",
            "capture",
            capture_ctor(captured.clone(), constructed.clone()),
        )
        .unwrap();

    let manager = FlowsManager::with_options(
        storage.clone(),
        registry.clone(),
        hooks.clone(),
        events.clone(),
        settings.clone(),
        FlowsOptions {
            close_timeout: Duration::from_millis(200),
            ..FlowsOptions::default()
        },
    );

    TestRuntime {
        storage,
        registry,
        hooks,
        events,
        settings,
        manager,
        captured,
        constructed,
    }
}

fn positioned(node: RawNode) -> RawNode {
    node.with_prop("x", json!(10)).with_prop("y", json!(10))
}

fn wired_records() -> Vec<RawNode> {
    vec![
        RawNode::new("t1", "tab").with_prop("label", json!("Main")),
        positioned(RawNode::new("n1", "relay").with_z("t1")).with_wires(vec![vec!["n2"]]),
        positioned(RawNode::new("n2", "capture").with_z("t1")),
    ]
}

async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_load_and_start_from_storage() {
    let rt = runtime().await;
    rt.storage
        .save_flows(StoredFlows {
            flows: wired_records(),
            credentials: json!({}),
            rev: None,
        })
        .await
        .unwrap();

    let revision = rt.manager.load(true).await.unwrap();
    assert!(!revision.is_empty());
    assert_eq!(rt.manager.state(), FlowsState::Start);

    // messages route end to end through the managed flow
    let n1 = rt.manager.get_node("n1").unwrap();
    n1.receive(Message::new(Payload::Number(1.0)));
    settle().await;
    let captured = rt.captured.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].0, "n2");
    assert_eq!(captured[0].1.payload(), &Payload::Number(1.0));
}

#[tokio::test]
async fn test_unchanged_config_produces_empty_diff_and_no_restart() {
    let rt = runtime().await;
    let revision = rt
        .manager
        .set_flows(wired_records(), None, DeployType::Full)
        .await
        .unwrap();
    let constructed_after_first = rt.constructed.load(Ordering::SeqCst);

    // the diff of identical configs is empty
    let config_a = parse_config(wired_records(), |_| true).unwrap();
    let config_b = parse_config(wired_records(), |_| true).unwrap();
    assert!(diff_configs(&config_a, &config_b).is_empty());

    // and a flow-scoped redeploy of the same records restarts nothing
    let revision2 = rt
        .manager
        .set_flows(wired_records(), None, DeployType::Flows)
        .await
        .unwrap();
    assert_eq!(revision, revision2);
    assert_eq!(rt.constructed.load(Ordering::SeqCst), constructed_after_first);
    assert_eq!(rt.manager.state(), FlowsState::Start);
}

#[tokio::test]
async fn test_flow_scoped_deploy_leaves_other_flows_running() {
    let rt = runtime().await;
    let mut records = wired_records();
    records.push(RawNode::new("t2", "tab"));
    records.push(positioned(RawNode::new("m1", "capture").with_z("t2")));
    rt.manager
        .set_flows(records.clone(), None, DeployType::Full)
        .await
        .unwrap();

    // t1's nodes survive a redeploy that only touches t2
    let n1_before = rt.manager.get_node("n1").unwrap();
    let constructed_before = rt.constructed.load(Ordering::SeqCst);

    records.push(positioned(RawNode::new("m2", "capture").with_z("t2")));
    rt.manager
        .set_flows(records, None, DeployType::Flows)
        .await
        .unwrap();

    let n1_after = rt.manager.get_node("n1").unwrap();
    assert!(Arc::ptr_eq(&n1_before, &n1_after));
    // t2 restarted: its two nodes constructed, t1's were not
    assert_eq!(
        rt.constructed.load(Ordering::SeqCst),
        constructed_before + 2
    );
    assert!(rt.manager.get_node("m2").is_some());
}

#[tokio::test]
async fn test_node_scoped_deploy_restarts_only_touched_nodes() {
    let rt = runtime().await;
    rt.manager
        .set_flows(wired_records(), None, DeployType::Full)
        .await
        .unwrap();
    let n2_before = rt.manager.get_node("n2").unwrap();

    let mut records = wired_records();
    records[1] = positioned(
        RawNode::new("n1", "relay")
            .with_z("t1")
            .with_prop("note", json!("changed")),
    )
    .with_wires(vec![vec!["n2"]]);
    rt.manager
        .set_flows(records, None, DeployType::Nodes)
        .await
        .unwrap();

    // n1 was recreated, n2 kept its instance
    let n2_after = rt.manager.get_node("n2").unwrap();
    assert!(Arc::ptr_eq(&n2_before, &n2_after));

    // and routing still works through the new n1
    rt.manager
        .get_node("n1")
        .unwrap()
        .receive(Message::new(Payload::Bool(true)));
    settle().await;
    assert_eq!(rt.captured.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_type_defers_start_until_registered() {
    let rt = runtime().await;
    let records = vec![
        RawNode::new("t1", "tab"),
        positioned(RawNode::new("w1", "widget").with_z("t1")),
    ];
    rt.manager
        .set_flows(records, None, DeployType::Full)
        .await
        .unwrap();

    assert_eq!(rt.manager.state(), FlowsState::Stop);
    assert_eq!(rt.manager.missing_types(), vec!["widget".to_string()]);
    // the condition is retained for late subscribers
    let retained = rt.events.retained("runtime-state").unwrap();
    assert_eq!(retained.payload["error"], json!("missing-types"));

    // registering the type resumes start automatically
    rt.registry
        .add_module(
            ModuleDescriptor::new("widgets", "0.1.0")
                .with_set(NodeSetDescriptor::new("widgets", "main", vec!["widget"])),
        )
        .unwrap();
    rt.registry
        .register_node_constructor(
            "widgets/main",
            "widget",
            capture_ctor(rt.captured.clone(), rt.constructed.clone()),
        )
        .unwrap();

    for _ in 0..50 {
        if rt.manager.state() == FlowsState::Start {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rt.manager.state(), FlowsState::Start);
    assert!(rt.manager.missing_types().is_empty());
    assert!(rt.manager.get_node("w1").is_some());
}

#[tokio::test]
async fn test_safe_mode_blocks_instantiation_until_next_deploy() {
    let rt = runtime().await;
    rt.settings.set("safeMode", json!(true)).await.unwrap();
    rt.storage
        .save_flows(StoredFlows {
            flows: wired_records(),
            credentials: json!({}),
            rev: None,
        })
        .await
        .unwrap();

    rt.manager.load(true).await.unwrap();
    assert_eq!(rt.manager.state(), FlowsState::Safe);
    assert!(rt.manager.get_node("n1").is_none());
    assert_eq!(rt.constructed.load(Ordering::SeqCst), 0);

    // an explicit deploy leaves safe mode
    rt.manager
        .set_flows(wired_records(), None, DeployType::Full)
        .await
        .unwrap();
    assert_eq!(rt.manager.state(), FlowsState::Start);
    assert!(rt.manager.get_node("n1").is_some());
}

#[tokio::test]
async fn test_add_flow_and_get_flow_strips_credentials() {
    let rt = runtime().await;
    rt.manager
        .set_flows(wired_records(), None, DeployType::Full)
        .await
        .unwrap();

    let payload = FlowPayload {
        id: None,
        label: "Added".to_string(),
        nodes: vec![
            RawNode::new("x1", "capture")
                .with_prop("credentials", json!({"token": "secret"}))
                .with_prop("keep", json!("visible")),
        ],
        ..FlowPayload::default()
    };
    let id = rt.manager.add_flow(payload).await.unwrap();

    let fetched = rt.manager.get_flow(&id).unwrap();
    assert_eq!(fetched.label, "Added");
    assert_eq!(fetched.nodes.len(), 1);
    let node = &fetched.nodes[0];
    assert_eq!(node.id, "x1");
    assert!(node.prop("credentials").is_none());
    assert_eq!(node.prop("keep"), Some(&json!("visible")));

    // the new flow is live
    assert!(rt.manager.get_node("x1").is_some());
}

#[tokio::test]
async fn test_update_and_remove_flow() {
    let rt = runtime().await;
    rt.manager
        .set_flows(wired_records(), None, DeployType::Full)
        .await
        .unwrap();

    rt.manager
        .update_flow(
            "t1",
            FlowPayload {
                id: Some("t1".to_string()),
                label: "Renamed".to_string(),
                nodes: vec![RawNode::new("n9", "capture")],
                ..FlowPayload::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rt.manager.get_flow("t1").unwrap().label, "Renamed");
    assert!(rt.manager.get_node("n9").is_some());
    assert!(rt.manager.get_node("n1").is_none());

    rt.manager.remove_flow("t1").await.unwrap();
    assert!(rt.manager.get_flow("t1").is_none());
    assert!(rt.manager.get_node("n9").is_none());

    // the global flow is protected
    assert!(matches!(
        rt.manager.remove_flow("global").await,
        Err(rivulet::FlowError::Protected(_))
    ));
}

#[tokio::test]
async fn test_unknown_flow_operations_error() {
    let rt = runtime().await;
    rt.manager
        .set_flows(wired_records(), None, DeployType::Full)
        .await
        .unwrap();
    assert!(matches!(
        rt.manager.remove_flow("nope").await,
        Err(rivulet::FlowError::UnknownFlow(_))
    ));
    assert!(matches!(
        rt.manager
            .update_flow("nope", FlowPayload::default())
            .await,
        Err(rivulet::FlowError::UnknownFlow(_))
    ));
}

#[tokio::test]
async fn test_onsend_hook_can_halt_delivery() {
    let rt = runtime().await;
    rt.manager
        .set_flows(wired_records(), None, DeployType::Full)
        .await
        .unwrap();

    rt.hooks
        .add("onSend.firewall", Arc::new(|_| Ok(HookAction::Halt)))
        .unwrap();

    rt.manager
        .get_node("n1")
        .unwrap()
        .receive(Message::new(Payload::Null));
    settle().await;
    assert!(rt.captured.lock().unwrap().is_empty());

    // removing the hook restores delivery; registrations outlive deploys,
    // removal is explicit
    rt.hooks.remove("onSend.firewall").unwrap();
    rt.manager
        .get_node("n1")
        .unwrap()
        .receive(Message::new(Payload::Null));
    settle().await;
    assert_eq!(rt.captured.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_full_stop_then_restart() {
    let rt = runtime().await;
    rt.manager
        .set_flows(wired_records(), None, DeployType::Full)
        .await
        .unwrap();
    assert_eq!(rt.manager.state(), FlowsState::Start);

    rt.manager
        .stop(DeployType::Full, &rivulet::FlowDiff::default())
        .await;
    assert_eq!(rt.manager.state(), FlowsState::Stop);
    assert!(rt.manager.get_node("n1").is_none());

    rt.manager
        .start(DeployType::Full, &rivulet::FlowDiff::default())
        .await
        .unwrap();
    assert_eq!(rt.manager.state(), FlowsState::Start);
    assert!(rt.manager.get_node("n1").is_some());
}

#[tokio::test]
async fn test_deploy_persists_flows_and_revision() {
    let rt = runtime().await;
    let revision = rt
        .manager
        .set_flows(wired_records(), Some(json!({"n1": {"user": "u"}})), DeployType::Full)
        .await
        .unwrap();

    let stored = rt.storage.get_flows().await.unwrap();
    assert_eq!(stored.rev.as_deref(), Some(revision.as_str()));
    assert_eq!(stored.flows.len(), wired_records().len());
    assert_eq!(stored.credentials, json!({"n1": {"user": "u"}}));
}
