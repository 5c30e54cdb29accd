use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::flow::config::{FlowConfiguration, RawNode};

/// The node-level result of comparing two configurations.
///
/// Drives hot redeploys: only nodes named here (and the flows owning them)
/// are restarted; everything else keeps running uninterrupted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDiff {
    pub added: BTreeSet<String>,
    pub changed: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    /// Same configuration, different wires.
    pub rewired: BTreeSet<String>,
    /// Unchanged nodes wired to a node in one of the other sets.
    pub linked: BTreeSet<String>,
    pub global_config_changed: bool,
}

impl FlowDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.rewired.is_empty()
            && !self.global_config_changed
    }

    /// Ids of nodes whose instances must be restarted.
    pub fn touched(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        out.extend(self.added.iter().cloned());
        out.extend(self.changed.iter().cloned());
        out.extend(self.removed.iter().cloned());
        out.extend(self.rewired.iter().cloned());
        out
    }

    /// Flow ids affected by this diff under a flow-scoped deploy.
    pub fn affected_flows(&self, old: &FlowConfiguration, new: &FlowConfiguration) -> BTreeSet<String> {
        let mut flows = BTreeSet::new();
        for id in self.touched().iter().chain(self.linked.iter()) {
            // a changed tab record is itself an affected flow
            if old.flows.contains_key(id) || new.flows.contains_key(id) {
                flows.insert(id.clone());
                continue;
            }
            if let Some(z) = new.owner_of(id).or_else(|| old.owner_of(id)) {
                flows.insert(z.to_string());
            }
        }
        flows
    }
}

fn config_equal_ignoring_wires(a: &RawNode, b: &RawNode) -> bool {
    a.node_type == b.node_type
        && a.name == b.name
        && a.z == b.z
        && a.g == b.g
        && a.disabled == b.disabled
        && a.rest == b.rest
}

/// Compare two configurations node by node.
pub fn diff_configs(old: &FlowConfiguration, new: &FlowConfiguration) -> FlowDiff {
    let mut diff = FlowDiff::default();

    for (id, new_node) in &new.all_nodes {
        match old.all_nodes.get(id) {
            None => {
                diff.added.insert(id.clone());
            }
            Some(old_node) => {
                if !config_equal_ignoring_wires(old_node, new_node) {
                    diff.changed.insert(id.clone());
                } else if old_node.wires != new_node.wires {
                    diff.rewired.insert(id.clone());
                }
            }
        }
    }
    for id in old.all_nodes.keys() {
        if !new.all_nodes.contains_key(id) {
            diff.removed.insert(id.clone());
        }
    }

    // neighbours of touched nodes restart with them
    let touched = diff.touched();
    for config in [old, new] {
        for (id, node) in &config.all_nodes {
            if touched.contains(id) {
                for port in &node.wires {
                    for dest in port {
                        if !touched.contains(dest) {
                            diff.linked.insert(dest.clone());
                        }
                    }
                }
            } else if node
                .wires
                .iter()
                .flatten()
                .any(|dest| touched.contains(dest))
            {
                diff.linked.insert(id.clone());
            }
        }
    }

    diff.global_config_changed = diff
        .touched()
        .iter()
        .any(|id| old.configs.contains_key(id) || new.configs.contains_key(id));

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::config::parse_config;
    use serde_json::json;

    fn positioned(node: RawNode) -> RawNode {
        node.with_prop("x", json!(10)).with_prop("y", json!(10))
    }

    fn base_records() -> Vec<RawNode> {
        vec![
            RawNode::new("t1", "tab"),
            positioned(RawNode::new("n1", "inject").with_z("t1")).with_wires(vec![vec!["n2"]]),
            positioned(RawNode::new("n2", "debug").with_z("t1")),
            RawNode::new("gc", "mqtt-broker"),
        ]
    }

    fn parse(records: Vec<RawNode>) -> FlowConfiguration {
        parse_config(records, |_| true).unwrap()
    }

    #[test]
    fn test_identical_configs_produce_empty_diff() {
        let old = parse(base_records());
        let new = parse(base_records());
        let diff = diff_configs(&old, &new);
        assert!(diff.is_empty());
        assert!(diff.linked.is_empty());
    }

    #[test]
    fn test_added_removed_changed() {
        let old = parse(base_records());

        let mut records = base_records();
        records.retain(|r| r.id != "n2"); // remove n2
        records.push(positioned(RawNode::new("n3", "change").with_z("t1"))); // add n3
        records[1] = positioned(
            RawNode::new("n1", "inject")
                .with_z("t1")
                .with_prop("repeat", json!(5)),
        )
        .with_wires(vec![vec!["n2"]]); // change n1
        let new = parse(records);

        let diff = diff_configs(&old, &new);
        assert!(diff.added.contains("n3"));
        assert!(diff.removed.contains("n2"));
        assert!(diff.changed.contains("n1"));
        assert!(!diff.global_config_changed);
    }

    #[test]
    fn test_wire_only_change_is_rewired_and_links_neighbours() {
        let old = parse(base_records());

        let mut records = base_records();
        records[1] = positioned(RawNode::new("n1", "inject").with_z("t1")); // wires dropped
        let new = parse(records);

        let diff = diff_configs(&old, &new);
        assert!(diff.rewired.contains("n1"));
        assert!(diff.changed.is_empty());
        assert!(diff.linked.contains("n2"));
    }

    #[test]
    fn test_global_config_change_is_flagged() {
        let old = parse(base_records());
        let mut records = base_records();
        records[3] = RawNode::new("gc", "mqtt-broker").with_prop("url", json!("mqtt://x"));
        let new = parse(records);

        let diff = diff_configs(&old, &new);
        assert!(diff.changed.contains("gc"));
        assert!(diff.global_config_changed);
    }

    #[test]
    fn test_affected_flows() {
        let old = parse(base_records());
        let mut records = base_records();
        records.push(RawNode::new("t2", "tab"));
        records.push(positioned(RawNode::new("m1", "inject").with_z("t2")));
        let new = parse(records);

        let diff = diff_configs(&old, &new);
        let affected = diff.affected_flows(&old, &new);
        assert!(affected.contains("t2"));
        assert!(!affected.contains("t1"));
    }
}
