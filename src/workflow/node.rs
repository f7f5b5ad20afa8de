//! Workflow nodes
//!
//! A node is one planned tool invocation. Its `parameter_origins` record
//! where each argument comes from; the origin graph over all nodes is the
//! data-flow DAG.

use crate::tools::JsonMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Init,
    Connected,
    Executed,
    Failed,
}

/// Where one node input comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ParameterOrigin {
    UserInput,
    Default,
    NodeOutput { node_id: String, output_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolNode {
    pub node_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub parameter_origins: BTreeMap<String, ParameterOrigin>,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub tool_args: JsonMap,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub results: JsonMap,
}

pub fn step_id(index: usize) -> String {
    format!("step_{}", index)
}

/// Numeric part of a `step_k` id, if well-formed
pub fn step_index(node_id: &str) -> Option<usize> {
    node_id.strip_prefix("step_")?.parse().ok()
}

impl ToolNode {
    pub fn new(index: usize, tool_name: &str) -> Self {
        Self {
            node_id: step_id(index),
            tool_name: tool_name.to_string(),
            parameter_origins: BTreeMap::new(),
            status: NodeStatus::Init,
            tool_args: JsonMap::new(),
            results: JsonMap::new(),
        }
    }

    pub fn is_executed(&self) -> bool {
        self.status == NodeStatus::Executed
    }

    /// Upstream node ids this node's origins refer to
    pub fn upstream_ids(&self) -> impl Iterator<Item = &str> {
        self.parameter_origins.values().filter_map(|o| match o {
            ParameterOrigin::NodeOutput { node_id, .. } => Some(node_id.as_str()),
            _ => None,
        })
    }

    /// Rewrite `node_output` references according to an id mapping. Origins
    /// pointing at ids absent from the mapping are left alone.
    pub fn remap_origins(&mut self, mapping: &HashMap<String, String>) {
        for origin in self.parameter_origins.values_mut() {
            if let ParameterOrigin::NodeOutput { node_id, .. } = origin {
                if let Some(new_id) = mapping.get(node_id) {
                    *node_id = new_id.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_id_round_trip() {
        assert_eq!(step_id(3), "step_3");
        assert_eq!(step_index("step_3"), Some(3));
        assert_eq!(step_index("stepx"), None);
        assert_eq!(step_index("step_"), None);
    }

    #[test]
    fn test_remap_origins() {
        let mut node = ToolNode::new(2, "esmfold");
        node.parameter_origins.insert(
            "protein_sequence".to_string(),
            ParameterOrigin::NodeOutput {
                node_id: "step_1".to_string(),
                output_name: "sequence".to_string(),
            },
        );
        node.parameter_origins
            .insert("num_recycles".to_string(), ParameterOrigin::Default);

        let mapping = HashMap::from([("step_1".to_string(), "step_2".to_string())]);
        node.remap_origins(&mapping);

        assert_eq!(
            node.parameter_origins["protein_sequence"],
            ParameterOrigin::NodeOutput {
                node_id: "step_2".to_string(),
                output_name: "sequence".to_string(),
            }
        );
        assert_eq!(node.parameter_origins["num_recycles"], ParameterOrigin::Default);
    }

    #[test]
    fn test_origin_serde_shape() {
        let origin = ParameterOrigin::NodeOutput {
            node_id: "step_1".to_string(),
            output_name: "save_path".to_string(),
        };
        let json = serde_json::to_value(&origin).unwrap();
        assert_eq!(json["source"], "node_output");
        assert_eq!(json["node_id"], "step_1");

        let user: ParameterOrigin =
            serde_json::from_value(serde_json::json!({"source": "user_input"})).unwrap();
        assert_eq!(user, ParameterOrigin::UserInput);
    }
}
