use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tracing::{error, info, warn};

use crate::context::ContextScope;
use crate::events::{RuntimeEvents, topic};
use crate::flow::config::{FlowConfiguration, FlowDefinition, RawNode};
use crate::flow::node::{DeliveryMode, NodeError, NodeInstance, NodeStatus};
use crate::hooks::HookManager;
use crate::message::Message;
use crate::registry::NodeRegistry;
use crate::value::Payload;

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything a flow needs from the runtime around it.
#[derive(Clone)]
pub struct FlowServices {
    pub registry: Arc<NodeRegistry>,
    pub hooks: Arc<HookManager>,
    pub events: Arc<RuntimeEvents>,
    pub global_context: Arc<ContextScope>,
    pub mode: DeliveryMode,
    pub close_timeout: Duration,
}

/// The per-flow state shared by all of its node instances: the live node
/// map wires resolve against, the hook engine, and the error path.
pub struct FlowCore {
    flow_id: String,
    nodes: DashMap<String, Arc<NodeInstance>>,
    hooks: Arc<HookManager>,
    events: Arc<RuntimeEvents>,
    mode: DeliveryMode,
    close_timeout: Duration,
    flow_context: Arc<ContextScope>,
    global_context: Arc<ContextScope>,
}

impl FlowCore {
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    pub fn node(&self, id: &str) -> Option<Arc<NodeInstance>> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    pub fn flow_context(&self) -> Arc<ContextScope> {
        self.flow_context.clone()
    }

    pub fn global_context(&self) -> Arc<ContextScope> {
        self.global_context.clone()
    }

    pub(crate) fn report_status(&self, node_id: &str, status: &NodeStatus) {
        self.events.emit(
            topic::NODE_STATUS,
            json!({ "flow": self.flow_id, "node": node_id, "status": status }),
        );
    }

    /// A node raised an error. Log it and route an error message to every
    /// catch node in this flow; never let it escape the flow boundary.
    pub(crate) fn handle_node_error(
        &self,
        source_id: &str,
        source_type: &str,
        err: &NodeError,
        msg: Option<&Message>,
    ) {
        error!(flow = %self.flow_id, node = %source_id, error = %err, "node error");

        let catches: Vec<Arc<NodeInstance>> = self
            .nodes
            .iter()
            .filter(|n| n.node_type() == "catch")
            .map(|n| n.value().clone())
            .collect();
        if catches.is_empty() {
            return;
        }

        let mut error_msg = msg
            .map(Message::duplicate)
            .unwrap_or_else(|| Message::new(Payload::Null));
        error_msg.set(
            "error",
            Payload::Map(BTreeMap::from([
                ("message".to_string(), Payload::String(err.to_string())),
                (
                    "source".to_string(),
                    Payload::Map(BTreeMap::from([
                        ("id".to_string(), Payload::String(source_id.to_string())),
                        ("type".to_string(), Payload::String(source_type.to_string())),
                    ])),
                ),
            ])),
        );
        for catch in catches {
            catch.receive(error_msg.duplicate());
        }
    }
}

/// A live, independently startable/stoppable scope of node instances.
///
/// One per enabled tab, plus a singleton global flow for config nodes owned
/// by no tab.
pub struct Flow {
    core: Arc<FlowCore>,
    def: Mutex<FlowDefinition>,
    config: Mutex<Arc<FlowConfiguration>>,
    services: FlowServices,
    is_global: bool,
}

/// Id of the singleton flow holding tab-less config nodes.
pub const GLOBAL_FLOW_ID: &str = "global";

impl Flow {
    pub fn new(
        def: FlowDefinition,
        config: Arc<FlowConfiguration>,
        services: FlowServices,
    ) -> Arc<Self> {
        let core = Arc::new(FlowCore {
            flow_id: def.id.clone(),
            nodes: DashMap::new(),
            hooks: services.hooks.clone(),
            events: services.events.clone(),
            mode: services.mode,
            close_timeout: services.close_timeout,
            flow_context: ContextScope::new(),
            global_context: services.global_context.clone(),
        });
        Arc::new(Self {
            core,
            def: Mutex::new(def),
            config: Mutex::new(config),
            services,
            is_global: false,
        })
    }

    /// The global flow owns the configuration's tab-less config nodes.
    pub fn global(config: Arc<FlowConfiguration>, services: FlowServices) -> Arc<Self> {
        let def = FlowDefinition {
            id: GLOBAL_FLOW_ID.to_string(),
            label: GLOBAL_FLOW_ID.to_string(),
            configs: config.configs.clone(),
            ..FlowDefinition::default()
        };
        let core = Arc::new(FlowCore {
            flow_id: GLOBAL_FLOW_ID.to_string(),
            nodes: DashMap::new(),
            hooks: services.hooks.clone(),
            events: services.events.clone(),
            mode: services.mode,
            close_timeout: services.close_timeout,
            flow_context: ContextScope::new(),
            global_context: services.global_context.clone(),
        });
        Arc::new(Self {
            core,
            def: Mutex::new(def),
            config: Mutex::new(config),
            services,
            is_global: true,
        })
    }

    pub fn id(&self) -> String {
        self.core.flow_id.clone()
    }

    pub fn label(&self) -> String {
        self.def.lock().unwrap().label.clone()
    }

    pub fn is_global(&self) -> bool {
        self.is_global
    }

    pub fn get_node(&self, id: &str) -> Option<Arc<NodeInstance>> {
        self.core.node(id)
    }

    pub fn active_node_ids(&self) -> Vec<String> {
        self.core.nodes.iter().map(|n| n.key().clone()).collect()
    }

    /// Instantiate and start every member node.
    ///
    /// One node's constructor failing is logged and skipped; it never stops
    /// the rest of the flow from starting.
    pub async fn start(&self) -> anyhow::Result<()> {
        let def = self.def.lock().unwrap().clone();
        info!(flow = %self.core.flow_id, label = %def.label, "starting flow");

        let records: Vec<RawNode> = def
            .configs
            .values()
            .chain(def.nodes.values())
            .cloned()
            .collect();
        for record in records {
            self.start_record(&record);
        }
        Ok(())
    }

    /// Stop every member node, closing each within the close timeout, then
    /// drop the instances.
    pub async fn stop(&self) {
        info!(flow = %self.core.flow_id, "stopping flow");
        let nodes: Vec<Arc<NodeInstance>> = self
            .core
            .nodes
            .iter()
            .map(|n| n.value().clone())
            .collect();
        futures::future::join_all(nodes.iter().map(|n| n.close())).await;
        // dropping the map breaks the node<->core reference cycle
        self.core.nodes.clear();
    }

    /// Node-scoped redeploy: restart only `touched` members against the new
    /// definition, leaving everything else running.
    pub async fn update(
        &self,
        new_def: FlowDefinition,
        new_config: Arc<FlowConfiguration>,
        touched: &BTreeSet<String>,
    ) {
        // stop the touched instances (and any subflow expansion they own)
        let mut closing = Vec::new();
        for id in touched {
            let prefix = format!("{id}:");
            let members: Vec<String> = self
                .core
                .nodes
                .iter()
                .map(|n| n.key().clone())
                .filter(|k| k == id || k.starts_with(&prefix))
                .collect();
            for member in members {
                if let Some((_, node)) = self.core.nodes.remove(&member) {
                    closing.push(node);
                }
            }
        }
        futures::future::join_all(closing.iter().map(|n| n.close())).await;

        *self.config.lock().unwrap() = new_config;
        *self.def.lock().unwrap() = new_def.clone();

        // start whichever touched members still exist in the new definition
        for id in touched {
            let record = new_def
                .nodes
                .get(id)
                .or_else(|| new_def.configs.get(id))
                .cloned();
            if let Some(record) = record {
                self.start_record(&record);
            }
        }
    }

    fn start_record(&self, record: &RawNode) {
        if record.disabled {
            return;
        }
        if let Some(def_id) = record.subflow_instance_of() {
            let subflow = {
                let config = self.config.lock().unwrap();
                config.subflows.get(def_id).cloned()
            };
            match subflow {
                Some(subflow) => self.start_subflow_instance(record, &subflow),
                None => warn!(
                    flow = %self.core.flow_id,
                    node = %record.id,
                    subflow = def_id,
                    "subflow definition missing"
                ),
            }
            return;
        }
        self.construct(record, record.wires.clone());
    }

    /// Create the instance shell, run its type constructor, start its pump.
    fn construct(&self, record: &RawNode, wires: Vec<Vec<String>>) -> Option<Arc<NodeInstance>> {
        let Some(constructor) = self.services.registry.get_constructor(&record.node_type) else {
            warn!(
                flow = %self.core.flow_id,
                node = %record.id,
                r#type = %record.node_type,
                "no constructor for type, node not started"
            );
            return None;
        };
        let node = NodeInstance::with_wires(record, wires, self.core.clone());
        if let Err(err) = constructor(node.clone(), record) {
            error!(
                flow = %self.core.flow_id,
                node = %record.id,
                r#type = %record.node_type,
                error = %err,
                "node constructor failed"
            );
            return None;
        }
        self.core.nodes.insert(record.id.clone(), node.clone());
        node.start_pump();
        Some(node)
    }

    /// Expand a subflow instance: inner nodes run under namespaced ids, the
    /// instance itself becomes a relay from its input to the subflow's
    /// input-port wires, and inner outputs are wired to the instance's real
    /// downstream destinations.
    fn start_subflow_instance(&self, record: &RawNode, def: &FlowDefinition) {
        let prefix = &record.id;

        for inner in def.configs.values().chain(def.nodes.values()) {
            if inner.disabled {
                continue;
            }
            let mut expanded = inner.clone();
            expanded.id = format!("{prefix}:{}", inner.id);
            expanded.z = Some(self.core.flow_id.clone());
            expanded.wires = inner
                .wires
                .iter()
                .map(|port| port.iter().map(|t| format!("{prefix}:{t}")).collect())
                .collect();

            // inner nodes feeding an output port inherit the instance's
            // downstream wires for that port
            for (port_ix, targets) in def.out_ports.iter().enumerate() {
                for target in targets {
                    if target.id != inner.id {
                        continue;
                    }
                    let downstream = record.wires.get(port_ix).cloned().unwrap_or_default();
                    if expanded.wires.len() <= target.port {
                        expanded.wires.resize(target.port + 1, Vec::new());
                    }
                    expanded.wires[target.port].extend(downstream);
                }
            }
            self.construct(&expanded, expanded.wires.clone());
        }

        // the relay: receives on behalf of the instance, forwards to the
        // subflow's first input port
        let in_wires: Vec<Vec<String>> = def
            .in_ports
            .first()
            .map(|ids| vec![ids.iter().map(|t| format!("{prefix}:{t}")).collect()])
            .unwrap_or_default();
        let relay = NodeInstance::with_wires(record, in_wires, self.core.clone());
        relay.on_input(Arc::new(|msg, node| {
            Box::pin(async move {
                node.send(msg).await;
                Ok(())
            })
        }));
        self.core.nodes.insert(record.id.clone(), relay.clone());
        relay.start_pump();
    }
}
