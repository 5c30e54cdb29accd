use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("duplicate node id `{0}`")]
    DuplicateNode(String),
    #[error("node record with empty id")]
    MissingId,
    #[error("node record `{0}` with empty type")]
    MissingType(String),
}

/// One raw node record as persisted/deployed.
///
/// The typed fields are what the runtime itself routes on; everything else a
/// node type cares about stays in `rest` and is decoded lazily by its
/// constructor against its own schema.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RawNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Owning flow (tab or subflow) id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<String>,
    /// Owning group id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g: Option<String>,
    /// Output ports, each an ordered list of destination node ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wires: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl RawNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            z: None,
            g: None,
            wires: Vec::new(),
            disabled: false,
            rest: serde_json::Map::new(),
        }
    }

    pub fn with_z(mut self, z: impl Into<String>) -> Self {
        self.z = Some(z.into());
        self
    }

    pub fn with_wires(mut self, wires: Vec<Vec<&str>>) -> Self {
        self.wires = wires
            .into_iter()
            .map(|port| port.into_iter().map(str::to_string).collect())
            .collect();
        self
    }

    pub fn with_prop(mut self, key: &str, value: Value) -> Self {
        self.rest.insert(key.to_string(), value);
        self
    }

    pub fn is_tab(&self) -> bool {
        self.node_type == "tab"
    }

    pub fn is_subflow_def(&self) -> bool {
        self.node_type == "subflow"
    }

    pub fn is_group(&self) -> bool {
        self.node_type == "group"
    }

    /// Subflow instance nodes carry their definition id in the type.
    pub fn subflow_instance_of(&self) -> Option<&str> {
        self.node_type.strip_prefix("subflow:")
    }

    /// Records with editor coordinates are wired nodes; records without are
    /// config nodes referenced by id.
    pub fn has_position(&self) -> bool {
        self.rest.contains_key("x") && self.rest.contains_key("y")
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.rest.get(key)
    }

    fn label(&self) -> String {
        self.prop("label")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// An environment entry declared on a tab or subflow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EnvEntry {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

/// A wire target inside a subflow definition's output port.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PortTarget {
    pub id: String,
    #[serde(default)]
    pub port: usize,
}

/// One tab or subflow with the records it owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FlowDefinition {
    pub id: String,
    pub label: String,
    pub disabled: bool,
    pub env: Vec<EnvEntry>,
    pub nodes: IndexMap<String, RawNode>,
    pub configs: IndexMap<String, RawNode>,
    pub groups: IndexMap<String, RawNode>,
    /// Subflow input ports: per port, the inner node ids fed by it.
    pub in_ports: Vec<Vec<String>>,
    /// Subflow output ports: per port, the inner (node, port) pairs feeding it.
    pub out_ports: Vec<Vec<PortTarget>>,
}

impl FlowDefinition {
    fn from_record(record: &RawNode) -> Self {
        let env = record
            .prop("env")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| serde_json::from_value(e.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        let in_ports = record
            .prop("in")
            .and_then(Value::as_array)
            .map(|ports| ports.iter().map(port_wire_ids).collect())
            .unwrap_or_default();
        let out_ports = record
            .prop("out")
            .and_then(Value::as_array)
            .map(|ports| ports.iter().map(port_wire_targets).collect())
            .unwrap_or_default();
        Self {
            id: record.id.clone(),
            label: record.label(),
            disabled: record.disabled,
            env,
            nodes: IndexMap::new(),
            configs: IndexMap::new(),
            groups: IndexMap::new(),
            in_ports,
            out_ports,
        }
    }
}

fn port_wire_ids(port: &Value) -> Vec<String> {
    port.get("wires")
        .and_then(Value::as_array)
        .map(|wires| {
            wires
                .iter()
                .filter_map(|w| w.get("id").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn port_wire_targets(port: &Value) -> Vec<PortTarget> {
    port.get("wires")
        .and_then(Value::as_array)
        .map(|wires| {
            wires
                .iter()
                .filter_map(|w| serde_json::from_value(w.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// The normalized shape of one deployed configuration.
///
/// Replaced atomically (behind an `Arc`) on every deploy; in-flight readers
/// of the previous snapshot stay consistent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FlowConfiguration {
    /// Every record by id, in deploy order.
    pub all_nodes: IndexMap<String, RawNode>,
    pub flows: IndexMap<String, FlowDefinition>,
    pub subflows: IndexMap<String, FlowDefinition>,
    /// Config nodes owned by no tab.
    pub configs: IndexMap<String, RawNode>,
    /// Types referenced by the config with no resolvable constructor.
    pub missing_types: Vec<String>,
}

impl FlowConfiguration {
    pub fn node_count(&self) -> usize {
        self.all_nodes.len()
    }

    /// The flow owning a node id, if any.
    pub fn owner_of(&self, node_id: &str) -> Option<&str> {
        self.all_nodes.get(node_id).and_then(|n| n.z.as_deref())
    }
}

/// Normalize a flat ordered record list into a `FlowConfiguration`.
///
/// Two passes: containers (tabs, subflows) first, then ownership assignment
/// for every remaining record. `type_known` reports whether the registry can
/// currently resolve a constructor for a type; unresolvable types accumulate
/// in `missing_types`.
pub fn parse_config(
    records: Vec<RawNode>,
    type_known: impl Fn(&str) -> bool,
) -> Result<FlowConfiguration, ConfigError> {
    let mut config = FlowConfiguration::default();

    for record in records {
        if record.id.is_empty() {
            return Err(ConfigError::MissingId);
        }
        if record.node_type.is_empty() {
            return Err(ConfigError::MissingType(record.id.clone()));
        }
        let id = record.id.clone();
        if config.all_nodes.insert(id.clone(), record).is_some() {
            return Err(ConfigError::DuplicateNode(id));
        }
    }

    // pass 1: containers
    for record in config.all_nodes.values() {
        if record.is_tab() {
            config
                .flows
                .insert(record.id.clone(), FlowDefinition::from_record(record));
        } else if record.is_subflow_def() {
            config
                .subflows
                .insert(record.id.clone(), FlowDefinition::from_record(record));
        }
    }

    // pass 2: ownership
    let mut missing = Vec::new();
    let records: Vec<RawNode> = config.all_nodes.values().cloned().collect();
    for record in &records {
        if record.is_tab() || record.is_subflow_def() {
            continue;
        }

        if let Some(def_id) = record.subflow_instance_of() {
            if !config.subflows.contains_key(def_id) {
                missing.push(record.node_type.clone());
            }
        } else if !record.is_group() && !type_known(&record.node_type) {
            missing.push(record.node_type.clone());
        }

        // an unknown owner falls through to the global config set
        let owner_id = record.z.as_deref().filter(|z| {
            config.flows.contains_key(*z) || config.subflows.contains_key(*z)
        });

        match owner_id {
            Some(z) => {
                let def = config
                    .flows
                    .get_mut(z)
                    .or_else(|| config.subflows.get_mut(z))
                    .unwrap();
                if record.is_group() {
                    def.groups.insert(record.id.clone(), record.clone());
                } else if record.has_position() {
                    def.nodes.insert(record.id.clone(), record.clone());
                } else {
                    def.configs.insert(record.id.clone(), record.clone());
                }
            }
            None => {
                config.configs.insert(record.id.clone(), record.clone());
            }
        }
    }

    missing.sort();
    missing.dedup();
    config.missing_types = missing;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn positioned(node: RawNode) -> RawNode {
        node.with_prop("x", json!(100)).with_prop("y", json!(100))
    }

    fn sample_records() -> Vec<RawNode> {
        vec![
            RawNode::new("t1", "tab").with_prop("label", json!("Flow 1")),
            positioned(RawNode::new("n1", "inject").with_z("t1")).with_wires(vec![vec!["n2"]]),
            positioned(RawNode::new("n2", "debug").with_z("t1")),
            RawNode::new("c1", "mqtt-broker").with_z("t1"),
            RawNode::new("g1", "group").with_z("t1"),
            RawNode::new("global-c", "mqtt-broker"),
        ]
    }

    #[test]
    fn test_every_owned_record_lands_in_its_flow() {
        let records = sample_records();
        let count = records.len();
        let config = parse_config(records, |_| true).unwrap();

        assert_eq!(config.node_count(), count);
        let flow = &config.flows["t1"];
        assert!(flow.nodes.contains_key("n1"));
        assert!(flow.nodes.contains_key("n2"));
        assert!(flow.configs.contains_key("c1"));
        assert!(flow.groups.contains_key("g1"));
        assert!(config.configs.contains_key("global-c"));
        assert_eq!(flow.label, "Flow 1");
    }

    #[test]
    fn test_duplicate_id_is_an_error() {
        let records = vec![
            RawNode::new("t1", "tab"),
            positioned(RawNode::new("n1", "inject").with_z("t1")),
            positioned(RawNode::new("n1", "debug").with_z("t1")),
        ];
        assert_eq!(
            parse_config(records, |_| true),
            Err(ConfigError::DuplicateNode("n1".into()))
        );
    }

    #[test]
    fn test_orphan_owner_falls_back_to_global_config() {
        let records = vec![positioned(RawNode::new("n1", "inject").with_z("ghost"))];
        let config = parse_config(records, |_| true).unwrap();
        assert!(config.configs.contains_key("n1"));
        assert!(config.flows.is_empty());
    }

    #[test]
    fn test_missing_types_are_sorted_and_deduped() {
        let records = vec![
            RawNode::new("t1", "tab"),
            positioned(RawNode::new("n1", "zeta").with_z("t1")),
            positioned(RawNode::new("n2", "alpha").with_z("t1")),
            positioned(RawNode::new("n3", "zeta").with_z("t1")),
            positioned(RawNode::new("n4", "known").with_z("t1")),
        ];
        let config = parse_config(records, |t| t == "known").unwrap();
        assert_eq!(config.missing_types, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_subflow_ports_and_instances() {
        let records = vec![
            RawNode::new("sf1", "subflow")
                .with_prop("in", json!([{"wires": [{"id": "inner1"}]}]))
                .with_prop("out", json!([{"wires": [{"id": "inner1", "port": 0}]}])),
            positioned(RawNode::new("inner1", "change").with_z("sf1")),
            RawNode::new("t1", "tab"),
            positioned(RawNode::new("use1", "subflow:sf1").with_z("t1")),
            positioned(RawNode::new("use2", "subflow:nope").with_z("t1")),
        ];
        let config = parse_config(records, |_| true).unwrap();

        let sf = &config.subflows["sf1"];
        assert_eq!(sf.in_ports, vec![vec!["inner1".to_string()]]);
        assert_eq!(sf.out_ports[0][0], PortTarget { id: "inner1".into(), port: 0 });
        assert!(sf.nodes.contains_key("inner1"));

        // an instance of an unknown subflow definition is a missing type
        assert_eq!(config.missing_types, vec!["subflow:nope"]);
    }

    #[test]
    fn test_ordering_is_preserved() {
        let records = vec![
            RawNode::new("t1", "tab"),
            positioned(RawNode::new("b", "inject").with_z("t1")),
            positioned(RawNode::new("a", "inject").with_z("t1")),
        ];
        let config = parse_config(records, |_| true).unwrap();
        let ids: Vec<&String> = config.all_nodes.keys().collect();
        assert_eq!(ids, ["t1", "b", "a"]);
    }
}
