use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::ContextScope;
use crate::events::{RuntimeEvents, topic};
use crate::flow::config::{ConfigError, EnvEntry, FlowConfiguration, RawNode, parse_config};
use crate::flow::diff::{FlowDiff, diff_configs};
use crate::flow::flow::{DEFAULT_CLOSE_TIMEOUT, Flow, FlowServices, GLOBAL_FLOW_ID};
use crate::flow::node::{DeliveryMode, NodeInstance};
use crate::hooks::HookManager;
use crate::registry::NodeRegistry;
use crate::settings::SettingsManager;
use crate::storage::{Storage, StorageError, StoredFlows};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("unknown flow `{0}`")]
    UnknownFlow(String),
    #[error("flow `{0}` cannot be removed")]
    Protected(String),
}

/// Restart scope selected by a deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployType {
    /// Replace everything, restart every flow.
    Full,
    /// Restart only the nodes the diff names.
    Nodes,
    /// Restart only the flows owning diffed nodes.
    Flows,
    /// Re-pull the persisted configuration from storage.
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowsState {
    Stop,
    Start,
    /// Diagnostic state: configuration loaded, no node instantiated.
    Safe,
}

/// Tunables a host can set before handing the manager out.
#[derive(Debug, Clone)]
pub struct FlowsOptions {
    /// Synchronous delivery trades bounded stack depth for latency; cycles
    /// become the caller's problem.
    pub mode: DeliveryMode,
    pub close_timeout: Duration,
}

impl Default for FlowsOptions {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Queued,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// A tab plus its member records, as exchanged with deploy callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub label: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<RawNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<RawNode>,
}

/// Top-level orchestrator: owns the active configuration, the flow set, and
/// the Stop/Start/Safe state machine.
///
/// Lifecycle operations are not serialized against each other internally;
/// the deploy caller is expected to hold a single-writer discipline (one
/// deploy mutex). A partially failed stop-then-restart leaves the system in
/// the resulting partial state; there is no automatic rollback.
pub struct FlowsManager {
    storage: Storage,
    registry: Arc<NodeRegistry>,
    hooks: Arc<HookManager>,
    events: Arc<RuntimeEvents>,
    settings: Arc<SettingsManager>,
    mode: DeliveryMode,
    close_timeout: Duration,
    global_context: Arc<ContextScope>,
    state: Mutex<FlowsState>,
    started: AtomicBool,
    active: Mutex<Option<Arc<FlowConfiguration>>>,
    /// Snapshot replaced by the last deploy; diff scoping still needs it
    /// after the swap.
    previous: Mutex<Option<Arc<FlowConfiguration>>>,
    active_raw: Mutex<Vec<RawNode>>,
    credentials: Mutex<Value>,
    revision: Mutex<Option<String>>,
    flows: dashmap::DashMap<String, Arc<Flow>>,
    node_index: dashmap::DashMap<String, String>,
    resume_pending: AtomicBool,
}

impl FlowsManager {
    pub fn new(
        storage: Storage,
        registry: Arc<NodeRegistry>,
        hooks: Arc<HookManager>,
        events: Arc<RuntimeEvents>,
        settings: Arc<SettingsManager>,
    ) -> Arc<Self> {
        Self::with_options(storage, registry, hooks, events, settings, FlowsOptions::default())
    }

    pub fn with_options(
        storage: Storage,
        registry: Arc<NodeRegistry>,
        hooks: Arc<HookManager>,
        events: Arc<RuntimeEvents>,
        settings: Arc<SettingsManager>,
        options: FlowsOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            registry,
            hooks,
            events,
            settings,
            mode: options.mode,
            close_timeout: options.close_timeout,
            global_context: ContextScope::new(),
            state: Mutex::new(FlowsState::Stop),
            started: AtomicBool::new(false),
            active: Mutex::new(None),
            previous: Mutex::new(None),
            active_raw: Mutex::new(Vec::new()),
            credentials: Mutex::new(Value::Null),
            revision: Mutex::new(None),
            flows: dashmap::DashMap::new(),
            node_index: dashmap::DashMap::new(),
            resume_pending: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> FlowsState {
        *self.state.lock().unwrap()
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn revision(&self) -> Option<String> {
        self.revision.lock().unwrap().clone()
    }

    /// The current configuration snapshot. Replaced atomically on deploy;
    /// holders of a previous snapshot stay consistent.
    pub fn active_config(&self) -> Option<Arc<FlowConfiguration>> {
        self.active.lock().unwrap().clone()
    }

    pub fn missing_types(&self) -> Vec<String> {
        self.active_config()
            .map(|c| c.missing_types.clone())
            .unwrap_or_default()
    }

    fn services(&self) -> FlowServices {
        FlowServices {
            registry: self.registry.clone(),
            hooks: self.hooks.clone(),
            events: self.events.clone(),
            global_context: self.global_context.clone(),
            mode: self.mode,
            close_timeout: self.close_timeout,
        }
    }

    fn parse(&self, records: Vec<RawNode>) -> Result<FlowConfiguration, ConfigError> {
        let registry = self.registry.clone();
        parse_config(records, move |t| registry.has_type(t))
    }

    /// Fetch the persisted configuration and make it active.
    pub async fn load(self: &Arc<Self>, force_start: bool) -> Result<String, FlowError> {
        let stored = self.storage.get_flows().await?;
        let revision = stored
            .rev
            .clone()
            .unwrap_or_else(|| calculate_revision(&stored.flows));
        let config = Arc::new(self.parse(stored.flows.clone())?);

        *self.credentials.lock().unwrap() = stored.credentials;
        *self.active_raw.lock().unwrap() = stored.flows;
        {
            let mut active = self.active.lock().unwrap();
            *self.previous.lock().unwrap() = active.take();
            *active = Some(config);
        }
        *self.revision.lock().unwrap() = Some(revision.clone());
        info!(%revision, "flow configuration loaded");

        if force_start {
            self.start(DeployType::Load, &FlowDiff::default()).await?;
        }
        Ok(revision)
    }

    /// Deploy a configuration.
    ///
    /// `Full` replaces and restarts everything; `Nodes`/`Flows` compute a
    /// diff and restart only what it names, leaving the rest running;
    /// `Load` re-pulls from storage.
    pub async fn set_flows(
        self: &Arc<Self>,
        records: Vec<RawNode>,
        credentials: Option<Value>,
        deploy: DeployType,
    ) -> Result<String, FlowError> {
        let records = match deploy {
            DeployType::Load => self.storage.get_flows().await?.flows,
            _ => records,
        };
        let new_config = Arc::new(self.parse(records.clone())?);
        let old_config = self
            .active_config()
            .unwrap_or_else(|| Arc::new(FlowConfiguration::default()));

        let diff = match deploy {
            DeployType::Nodes | DeployType::Flows => diff_configs(&old_config, &new_config),
            _ => FlowDiff::default(),
        };

        if self.started() {
            self.stop_scoped(deploy, &diff, &old_config, &new_config).await;
        }

        if let Some(credentials) = credentials {
            *self.credentials.lock().unwrap() = credentials;
        }
        let revision = calculate_revision(&records);
        *self.previous.lock().unwrap() = Some(old_config);
        *self.active.lock().unwrap() = Some(new_config);
        *self.active_raw.lock().unwrap() = records.clone();
        *self.revision.lock().unwrap() = Some(revision.clone());

        let credentials = self.credentials.lock().unwrap().clone();
        self.storage
            .save_flows(StoredFlows {
                flows: records,
                credentials,
                rev: Some(revision.clone()),
            })
            .await?;

        self.start(deploy, &diff).await?;
        self.events.emit_retained(
            topic::RUNTIME_DEPLOY,
            json!({ "revision": revision, "type": deploy }),
        );
        Ok(revision)
    }

    /// Bring the active configuration up, as far as its gates allow.
    ///
    /// Missing types leave the state machine in `Stop` with a retained
    /// warning and an automatic retry armed on `type-registered`. The
    /// safe-mode setting sends an initial load to `Safe` instead; any
    /// explicit deploy afterwards starts normally.
    pub async fn start(self: &Arc<Self>, deploy: DeployType, diff: &FlowDiff) -> Result<(), FlowError> {
        let Some(config) = self.active_config() else {
            return Ok(());
        };

        if !config.missing_types.is_empty() {
            warn!(types = ?config.missing_types, "cannot start, types missing");
            *self.state.lock().unwrap() = FlowsState::Stop;
            self.events.emit_retained(
                topic::RUNTIME_STATE,
                json!({
                    "state": FlowsState::Stop,
                    "error": "missing-types",
                    "types": config.missing_types,
                }),
            );
            self.arm_missing_type_resume(deploy, config.missing_types.clone());
            return Ok(());
        }

        if matches!(deploy, DeployType::Load) {
            let safe_mode = self
                .settings
                .get("safeMode")
                .await
                .ok()
                .flatten()
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if safe_mode {
                warn!("safe mode: flows not started");
                *self.state.lock().unwrap() = FlowsState::Safe;
                self.events.emit_retained(
                    topic::RUNTIME_STATE,
                    json!({ "state": FlowsState::Safe, "error": "safe-mode" }),
                );
                return Ok(());
            }
        }

        self.events.emit(topic::FLOWS_STARTING, json!({ "type": deploy }));

        let full = matches!(deploy, DeployType::Full | DeployType::Load) || !self.started();
        if full {
            self.start_full(&config).await;
        } else {
            let old_config = self
                .previous
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| config.clone());
            match deploy {
                DeployType::Flows => self.start_affected_flows(&config, diff, &old_config).await,
                DeployType::Nodes => self.update_affected_flows(&config, diff, &old_config).await,
                _ => unreachable!(),
            }
        }

        self.rebuild_node_index();
        *self.state.lock().unwrap() = FlowsState::Start;
        self.started.store(true, Ordering::Release);
        self.events.emit(topic::FLOWS_STARTED, json!({ "type": deploy }));
        self.events
            .emit_retained(topic::RUNTIME_STATE, json!({ "state": FlowsState::Start }));
        Ok(())
    }

    async fn start_full(&self, config: &Arc<FlowConfiguration>) {
        self.flows.clear();
        let services = self.services();
        for def in config.flows.values() {
            if def.disabled {
                continue;
            }
            let flow = Flow::new(def.clone(), config.clone(), services.clone());
            self.flows.insert(flow.id(), flow);
        }
        let global = Flow::global(config.clone(), services);
        self.flows.insert(GLOBAL_FLOW_ID.to_string(), global);

        self.start_flow_set(self.flows.iter().map(|f| f.value().clone()).collect())
            .await;
    }

    async fn start_affected_flows(
        &self,
        config: &Arc<FlowConfiguration>,
        diff: &FlowDiff,
        old_config: &Arc<FlowConfiguration>,
    ) {
        let services = self.services();
        let mut starting = Vec::new();
        let mut affected = diff.affected_flows(old_config, config);
        if diff.global_config_changed {
            affected.insert(GLOBAL_FLOW_ID.to_string());
        }
        for id in affected {
            if id == GLOBAL_FLOW_ID {
                let flow = Flow::global(config.clone(), services.clone());
                self.flows.insert(GLOBAL_FLOW_ID.to_string(), flow.clone());
                starting.push(flow);
                continue;
            }
            let Some(def) = config.flows.get(&id) else {
                continue; // removed flow, already stopped
            };
            if def.disabled {
                continue;
            }
            let flow = Flow::new(def.clone(), config.clone(), services.clone());
            self.flows.insert(flow.id(), flow.clone());
            starting.push(flow);
        }
        self.start_flow_set(starting).await;
    }

    async fn update_affected_flows(
        &self,
        config: &Arc<FlowConfiguration>,
        diff: &FlowDiff,
        old_config: &Arc<FlowConfiguration>,
    ) {
        let touched = diff.touched();
        let services = self.services();
        let mut starting = Vec::new();
        for id in diff.affected_flows(old_config, config) {
            let Some(def) = config.flows.get(&id) else {
                continue;
            };
            if def.disabled {
                continue;
            }
            match self.flows.get(&id).map(|f| f.value().clone()) {
                Some(flow) => {
                    flow.update(def.clone(), config.clone(), &touched).await;
                }
                None => {
                    let flow = Flow::new(def.clone(), config.clone(), services.clone());
                    self.flows.insert(flow.id(), flow.clone());
                    starting.push(flow);
                }
            }
        }
        if diff.global_config_changed {
            let flow = Flow::global(config.clone(), services);
            self.flows.insert(GLOBAL_FLOW_ID.to_string(), flow.clone());
            starting.push(flow);
        }
        self.start_flow_set(starting).await;
    }

    /// Start flows in parallel; one flow's failure is logged and does not
    /// block the others.
    async fn start_flow_set(&self, flows: Vec<Arc<Flow>>) {
        let results = futures::future::join_all(flows.iter().map(|f| f.start())).await;
        for (flow, result) in flows.iter().zip(results) {
            if let Err(err) = result {
                error!(flow = %flow.id(), error = %err, "flow failed to start");
            }
        }
    }

    /// Stop flows according to the deploy scope.
    ///
    /// All flows stop in parallel except the global flow, which always goes
    /// last: closing nodes may still read global config nodes while tearing
    /// down.
    pub async fn stop(&self, deploy: DeployType, diff: &FlowDiff) {
        let config = self
            .active_config()
            .unwrap_or_else(|| Arc::new(FlowConfiguration::default()));
        self.stop_scoped(deploy, diff, &config, &config).await;
    }

    async fn stop_scoped(
        &self,
        deploy: DeployType,
        diff: &FlowDiff,
        old_config: &Arc<FlowConfiguration>,
        new_config: &Arc<FlowConfiguration>,
    ) {
        self.events.emit(topic::FLOWS_STOPPING, json!({ "type": deploy }));
        let full = matches!(deploy, DeployType::Full | DeployType::Load);

        let stopping: Vec<Arc<Flow>> = if full {
            let all: Vec<Arc<Flow>> = self.flows.iter().map(|f| f.value().clone()).collect();
            self.flows.clear();
            all
        } else {
            let mut affected = match deploy {
                // node-scoped deploys restart members in place via update();
                // only flows removed outright stop here
                DeployType::Nodes => diff
                    .removed
                    .iter()
                    .filter(|id| old_config.flows.contains_key(*id))
                    .cloned()
                    .collect(),
                _ => diff.affected_flows(old_config, new_config),
            };
            if diff.global_config_changed {
                affected.insert(GLOBAL_FLOW_ID.to_string());
            }
            affected
                .iter()
                .filter_map(|id| self.flows.remove(id).map(|(_, f)| f))
                .collect()
        };

        let (global, rest): (Vec<Arc<Flow>>, Vec<Arc<Flow>>) =
            stopping.into_iter().partition(|f| f.is_global());
        futures::future::join_all(rest.iter().map(|f| f.stop())).await;
        for flow in global {
            flow.stop().await;
        }

        if full {
            self.node_index.clear();
            *self.state.lock().unwrap() = FlowsState::Stop;
            self.started.store(false, Ordering::Release);
            self.events
                .emit_retained(topic::RUNTIME_STATE, json!({ "state": FlowsState::Stop }));
        }
        self.events.emit(topic::FLOWS_STOPPED, json!({ "type": deploy }));
    }

    /// Arm a one-shot subscription that re-attempts `start` once every
    /// missing type has been registered.
    fn arm_missing_type_resume(self: &Arc<Self>, deploy: DeployType, missing: Vec<String>) {
        if self.resume_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = self.clone();
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            let mut missing: HashSet<String> = missing.into_iter().collect();
            missing.retain(|t| !manager.registry.has_type(t));
            while !missing.is_empty() {
                match rx.recv().await {
                    Ok(event) if event.id == topic::TYPE_REGISTERED => {
                        if let Some(t) = event.payload.get("type").and_then(Value::as_str) {
                            missing.remove(t);
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        missing.retain(|t| !manager.registry.has_type(t));
                    }
                    Err(_) => return,
                }
            }
            manager.resume_pending.store(false, Ordering::Release);
            info!("all missing types registered, retrying start");

            // re-parse so the fresh configuration drops its missing list
            let records = manager.active_raw.lock().unwrap().clone();
            match manager.parse(records) {
                Ok(config) => {
                    *manager.active.lock().unwrap() = Some(Arc::new(config));
                }
                Err(err) => {
                    error!(error = %err, "re-parse after type registration failed");
                    return;
                }
            }
            if let Err(err) = manager.start(deploy, &FlowDiff::default()).await {
                error!(error = %err, "deferred start failed");
            }
        });
    }

    /// Look a node up through the node->flow index, falling back to a full
    /// scan if the index is stale.
    pub fn get_node(&self, id: &str) -> Option<Arc<NodeInstance>> {
        if let Some(flow_id) = self.node_index.get(id).map(|f| f.value().clone()) {
            if let Some(flow) = self.flows.get(&flow_id) {
                if let Some(node) = flow.get_node(id) {
                    return Some(node);
                }
            }
        }
        for flow in self.flows.iter() {
            if let Some(node) = flow.get_node(id) {
                return Some(node);
            }
        }
        None
    }

    pub fn get_flow_instance(&self, id: &str) -> Option<Arc<Flow>> {
        self.flows.get(id).map(|f| f.value().clone())
    }

    fn rebuild_node_index(&self) {
        self.node_index.clear();
        for flow in self.flows.iter() {
            for node_id in flow.active_node_ids() {
                self.node_index.insert(node_id, flow.id());
            }
        }
    }

    /// One tab's definition, with credentials stripped.
    pub fn get_flow(&self, id: &str) -> Option<FlowPayload> {
        let config = self.active_config()?;
        let def = config.flows.get(id)?;
        let strip = |record: &RawNode| {
            let mut record = record.clone();
            record.rest.remove("credentials");
            record
        };
        Some(FlowPayload {
            id: Some(def.id.clone()),
            label: def.label.clone(),
            disabled: def.disabled,
            env: def.env.clone(),
            nodes: def.nodes.values().map(strip).collect(),
            configs: def.configs.values().map(strip).collect(),
        })
    }

    /// Add a tab and deploy it with flow scope. Returns the tab id.
    pub async fn add_flow(self: &Arc<Self>, payload: FlowPayload) -> Result<String, FlowError> {
        let id = payload
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        // never mutate the active raw config in place
        let mut records = self.active_raw.lock().unwrap().clone();
        records.extend(flow_records(&id, &payload));
        self.set_flows(records, None, DeployType::Flows).await?;
        Ok(id)
    }

    /// Replace one tab's definition and redeploy it.
    pub async fn update_flow(self: &Arc<Self>, id: &str, payload: FlowPayload) -> Result<(), FlowError> {
        let records = self.active_raw.lock().unwrap().clone();
        if !records.iter().any(|r| r.id == id && r.is_tab()) {
            return Err(FlowError::UnknownFlow(id.to_string()));
        }
        let mut records: Vec<RawNode> = records
            .into_iter()
            .filter(|r| r.id != id && r.z.as_deref() != Some(id))
            .collect();
        records.extend(flow_records(id, &payload));
        self.set_flows(records, None, DeployType::Flows).await?;
        Ok(())
    }

    /// Remove one tab and everything it owns. The global flow is protected.
    pub async fn remove_flow(self: &Arc<Self>, id: &str) -> Result<(), FlowError> {
        if id == GLOBAL_FLOW_ID {
            return Err(FlowError::Protected(id.to_string()));
        }
        let records = self.active_raw.lock().unwrap().clone();
        if !records.iter().any(|r| r.id == id && r.is_tab()) {
            return Err(FlowError::UnknownFlow(id.to_string()));
        }
        let records: Vec<RawNode> = records
            .into_iter()
            .filter(|r| r.id != id && r.z.as_deref() != Some(id))
            .collect();
        self.set_flows(records, None, DeployType::Flows).await?;
        Ok(())
    }
}

fn flow_records(id: &str, payload: &FlowPayload) -> Vec<RawNode> {
    let mut tab = RawNode::new(id, "tab").with_prop("label", json!(payload.label));
    tab.disabled = payload.disabled;
    if !payload.env.is_empty() {
        tab = tab.with_prop("env", serde_json::to_value(&payload.env).unwrap_or_default());
    }
    let mut records = vec![tab];
    for node in &payload.nodes {
        let mut node = node.clone();
        node.z = Some(id.to_string());
        // deploy callers may omit coordinates; nodes need them to stay nodes
        node.rest.entry("x".to_string()).or_insert(json!(0));
        node.rest.entry("y".to_string()).or_insert(json!(0));
        records.push(node);
    }
    for config in &payload.configs {
        let mut config = config.clone();
        config.z = Some(id.to_string());
        config.rest.remove("x");
        config.rest.remove("y");
        records.push(config);
    }
    records
}

/// Stable content hash of the serialized flow array; advisory concurrency
/// token for deploy callers, not enforced here.
pub fn calculate_revision(records: &[RawNode]) -> String {
    let serialized = serde_json::to_string(records).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_is_stable_and_content_sensitive() {
        let records = vec![RawNode::new("t1", "tab")];
        assert_eq!(calculate_revision(&records), calculate_revision(&records));

        let other = vec![RawNode::new("t2", "tab")];
        assert_ne!(calculate_revision(&records), calculate_revision(&other));
    }

    #[test]
    fn test_deploy_type_serializes_lowercase() {
        assert_eq!(serde_json::to_value(DeployType::Full).unwrap(), json!("full"));
        assert_eq!(serde_json::to_value(FlowsState::Safe).unwrap(), json!("safe"));
    }
}
