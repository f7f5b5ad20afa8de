//! The workflow graph
//!
//! An ordered list of tool nodes with contiguous `step_k` ids. Edges are
//! implicit in the nodes' parameter origins. The persisted JSON form is a
//! map keyed by step id plus a `valid_workflow` flag, so the serde
//! implementations are written by hand.

use crate::tools::JsonMap;
use crate::types::{AppError, AppResult};
use crate::workflow::node::{step_id, step_index, NodeStatus, ParameterOrigin, ToolNode};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub nodes: Vec<ToolNode>,
    pub valid: bool,
}

/// User-facing inputs and unconsumed outputs of a workflow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalIo {
    /// node id -> parameters sourced from user input
    pub inputs: BTreeMap<String, Vec<String>>,
    /// (node id, return value) pairs not wired into any downstream node
    pub outputs: Vec<(String, String)>,
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            valid: true,
        }
    }

    /// Build init-state nodes, one per plan step, in step order.
    pub fn from_plan(tool_names: &[String]) -> Self {
        Self {
            nodes: tool_names
                .iter()
                .enumerate()
                .map(|(i, tool)| ToolNode::new(i + 1, tool))
                .collect(),
            valid: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn index_of(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.node_id == node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&ToolNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut ToolNode> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    /// Wire `upstream.output_name` into `downstream.input_name`. An existing
    /// `node_output` origin on that input is silently overwritten; the
    /// latest connect wins.
    pub fn connect(
        &mut self,
        upstream: &str,
        output_name: &str,
        downstream: &str,
        input_name: &str,
    ) -> AppResult<()> {
        let up = self
            .index_of(upstream)
            .ok_or_else(|| AppError::Workflow(format!("unknown upstream node '{}'", upstream)))?;
        let down = self
            .index_of(downstream)
            .ok_or_else(|| AppError::Workflow(format!("unknown downstream node '{}'", downstream)))?;
        if up >= down {
            return Err(AppError::Workflow(format!(
                "'{}' cannot feed '{}': outputs only flow forward",
                upstream, downstream
            )));
        }

        self.nodes[down].parameter_origins.insert(
            input_name.to_string(),
            ParameterOrigin::NodeOutput {
                node_id: upstream.to_string(),
                output_name: output_name.to_string(),
            },
        );
        Ok(())
    }

    pub fn set_origin(
        &mut self,
        node_id: &str,
        parameter: &str,
        origin: ParameterOrigin,
    ) -> AppResult<()> {
        let node = self
            .node_mut(node_id)
            .ok_or_else(|| AppError::Workflow(format!("unknown node '{}'", node_id)))?;
        node.parameter_origins.insert(parameter.to_string(), origin);
        Ok(())
    }

    /// Insert a chain of fresh nodes immediately before `node_id` and
    /// renumber. Renumbering is order-preserving, so every existing origin
    /// still refers to the same semantic node afterwards. Returns the ids
    /// of the inserted nodes.
    pub fn insert_before(
        &mut self,
        tool_chain: &[String],
        node_id: &str,
    ) -> AppResult<Vec<String>> {
        let pos = self
            .index_of(node_id)
            .ok_or_else(|| AppError::Workflow(format!("unknown node '{}'", node_id)))?;
        let shift = tool_chain.len();
        if shift == 0 {
            return Ok(Vec::new());
        }

        let mapping: HashMap<String, String> = (pos..self.nodes.len())
            .map(|i| (step_id(i + 1), step_id(i + 1 + shift)))
            .collect();

        let inserted: Vec<ToolNode> = tool_chain
            .iter()
            .enumerate()
            .map(|(j, tool)| ToolNode::new(pos + 1 + j, tool))
            .collect();
        let inserted_ids: Vec<String> = inserted.iter().map(|n| n.node_id.clone()).collect();
        self.nodes.splice(pos..pos, inserted);

        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.node_id = step_id(i + 1);
            node.remap_origins(&mapping);
        }
        Ok(inserted_ids)
    }

    /// Derive global inputs and outputs. `return_names` maps a tool name to
    /// its declared return value names.
    pub fn global_io<F>(&self, return_names: F) -> GlobalIo
    where
        F: Fn(&str) -> Vec<String>,
    {
        let mut inputs = BTreeMap::new();
        for node in &self.nodes {
            let user_params: Vec<String> = node
                .parameter_origins
                .iter()
                .filter(|(_, o)| matches!(o, ParameterOrigin::UserInput))
                .map(|(name, _)| name.clone())
                .collect();
            if !user_params.is_empty() {
                inputs.insert(node.node_id.clone(), user_params);
            }
        }

        let consumed: HashSet<(String, String)> = self
            .nodes
            .iter()
            .flat_map(|n| n.parameter_origins.values())
            .filter_map(|o| match o {
                ParameterOrigin::NodeOutput {
                    node_id,
                    output_name,
                } => Some((node_id.clone(), output_name.clone())),
                _ => None,
            })
            .collect();

        let mut outputs = Vec::new();
        for node in &self.nodes {
            for name in return_names(&node.tool_name) {
                let key = (node.node_id.clone(), name);
                if !consumed.contains(&key) {
                    outputs.push(key);
                }
            }
        }

        GlobalIo { inputs, outputs }
    }

    /// DOT rendering, nodes labelled `(step_k, tool)`, edges labelled by
    /// the upstream output name.
    pub fn visualize(&self) -> String {
        let mut out = String::from("digraph workflow {\n  rankdir=LR;\n");
        for node in &self.nodes {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}\"];\n",
                node.node_id, node.node_id, node.tool_name
            ));
        }
        for node in &self.nodes {
            for (input, origin) in &node.parameter_origins {
                if let ParameterOrigin::NodeOutput {
                    node_id,
                    output_name,
                } = origin
                {
                    out.push_str(&format!(
                        "  \"{}\" -> \"{}\" [label=\"{} -> {}\"];\n",
                        node_id, node.node_id, output_name, input
                    ));
                }
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Node body in the persisted, step-keyed form
#[derive(Serialize, Deserialize)]
struct NodeRecord {
    tool: String,
    status: NodeStatus,
    #[serde(default)]
    parameter_origins: BTreeMap<String, ParameterOrigin>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    tool_args: JsonMap,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    results: JsonMap,
}

impl Serialize for Workflow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.nodes.len() + 1))?;
        for node in &self.nodes {
            let record = NodeRecord {
                tool: node.tool_name.clone(),
                status: node.status,
                parameter_origins: node.parameter_origins.clone(),
                tool_args: node.tool_args.clone(),
                results: node.results.clone(),
            };
            map.serialize_entry(&node.node_id, &record)?;
        }
        map.serialize_entry("valid_workflow", &self.valid)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Workflow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Map::deserialize(deserializer)?;
        let mut valid = true;
        let mut indexed: Vec<(usize, ToolNode)> = Vec::new();

        for (key, value) in raw {
            if key == "valid_workflow" {
                valid = value.as_bool().unwrap_or(true);
                continue;
            }
            let index = step_index(&key)
                .ok_or_else(|| D::Error::custom(format!("invalid step id '{}'", key)))?;
            let record: NodeRecord =
                serde_json::from_value(value).map_err(D::Error::custom)?;
            indexed.push((
                index,
                ToolNode {
                    node_id: key,
                    tool_name: record.tool,
                    parameter_origins: record.parameter_origins,
                    status: record.status,
                    tool_args: record.tool_args,
                    results: record.results,
                },
            ));
        }

        indexed.sort_by_key(|(i, _)| *i);
        Ok(Workflow {
            nodes: indexed.into_iter().map(|(_, n)| n).collect(),
            valid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(tools: &[&str]) -> Workflow {
        Workflow::from_plan(&tools.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    fn returns(tool: &str) -> Vec<String> {
        match tool {
            "uniprot_fetch" => vec!["sequence".to_string()],
            "esmfold" => vec!["save_path".to_string(), "avg_plddt".to_string()],
            _ => vec![],
        }
    }

    #[test]
    fn test_from_plan_assigns_contiguous_ids() {
        let wf = plan(&["uniprot_fetch", "esmfold"]);
        assert_eq!(wf.nodes[0].node_id, "step_1");
        assert_eq!(wf.nodes[1].node_id, "step_2");
        assert!(wf.nodes.iter().all(|n| n.status == NodeStatus::Init));
    }

    #[test]
    fn test_connect_sets_origin_and_latest_wins() {
        let mut wf = plan(&["uniprot_fetch", "uniprot_fetch", "esmfold"]);
        wf.connect("step_1", "sequence", "step_3", "protein_sequence")
            .unwrap();
        wf.connect("step_2", "sequence", "step_3", "protein_sequence")
            .unwrap();

        assert_eq!(
            wf.node("step_3").unwrap().parameter_origins["protein_sequence"],
            ParameterOrigin::NodeOutput {
                node_id: "step_2".to_string(),
                output_name: "sequence".to_string(),
            }
        );
    }

    #[test]
    fn test_connect_rejects_backward_and_unknown() {
        let mut wf = plan(&["uniprot_fetch", "esmfold"]);
        assert!(wf.connect("step_2", "save_path", "step_1", "x").is_err());
        assert!(wf.connect("step_9", "y", "step_2", "x").is_err());
    }

    #[test]
    fn test_insert_before_renumbers_and_preserves_references() {
        let mut wf = plan(&["uniprot_fetch", "esmfold"]);
        wf.connect("step_1", "sequence", "step_2", "protein_sequence")
            .unwrap();
        wf.set_origin("step_1", "uniprot_id", ParameterOrigin::UserInput)
            .unwrap();

        let before = wf.global_io(returns);

        // Insert a converter in front of the fetch step
        let inserted = wf
            .insert_before(&["id_mapper".to_string()], "step_1")
            .unwrap();
        assert_eq!(inserted, vec!["step_1".to_string()]);
        assert_eq!(wf.nodes[0].tool_name, "id_mapper");
        assert_eq!(wf.nodes[1].tool_name, "uniprot_fetch");
        assert_eq!(wf.nodes[1].node_id, "step_2");
        assert_eq!(wf.nodes[2].node_id, "step_3");

        // The esmfold input still points at the fetch node, now step_2
        assert_eq!(
            wf.node("step_3").unwrap().parameter_origins["protein_sequence"],
            ParameterOrigin::NodeOutput {
                node_id: "step_2".to_string(),
                output_name: "sequence".to_string(),
            }
        );

        // Global io is unchanged modulo the inserted node's contribution
        let after = wf.global_io(returns);
        assert_eq!(
            before.inputs.values().flatten().collect::<Vec<_>>(),
            after.inputs.values().flatten().collect::<Vec<_>>()
        );
        assert_eq!(
            before.outputs.iter().map(|(_, o)| o).collect::<Vec<_>>(),
            after.outputs.iter().map(|(_, o)| o).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_global_io() {
        let mut wf = plan(&["uniprot_fetch", "esmfold"]);
        wf.set_origin("step_1", "uniprot_id", ParameterOrigin::UserInput)
            .unwrap();
        wf.connect("step_1", "sequence", "step_2", "protein_sequence")
            .unwrap();

        let io = wf.global_io(returns);
        assert_eq!(io.inputs["step_1"], vec!["uniprot_id".to_string()]);
        // The fetched sequence is consumed; esmfold's outputs are global
        assert_eq!(
            io.outputs,
            vec![
                ("step_2".to_string(), "save_path".to_string()),
                ("step_2".to_string(), "avg_plddt".to_string()),
            ]
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let mut wf = plan(&["uniprot_fetch", "esmfold"]);
        wf.set_origin("step_1", "uniprot_id", ParameterOrigin::UserInput)
            .unwrap();
        wf.connect("step_1", "sequence", "step_2", "protein_sequence")
            .unwrap();
        wf.node_mut("step_1").unwrap().status = NodeStatus::Executed;
        wf.node_mut("step_1")
            .unwrap()
            .results
            .insert("sequence".to_string(), json!("MKTAYIAK"));

        let json = serde_json::to_value(&wf).unwrap();
        assert_eq!(json["valid_workflow"], json!(true));
        assert_eq!(json["step_1"]["tool"], json!("uniprot_fetch"));

        let restored: Workflow = serde_json::from_value(json).unwrap();
        assert_eq!(restored, wf);
    }

    #[test]
    fn test_deserialize_orders_steps_numerically() {
        // A map form with >9 steps must not fall into lexicographic order
        let mut value = serde_json::Map::new();
        for i in (1..=11).rev() {
            value.insert(
                format!("step_{}", i),
                json!({"tool": format!("t{}", i), "status": "init"}),
            );
        }
        let wf: Workflow = serde_json::from_value(serde_json::Value::Object(value)).unwrap();
        assert_eq!(wf.nodes[1].node_id, "step_2");
        assert_eq!(wf.nodes[10].node_id, "step_11");
    }

    #[test]
    fn test_visualize_labels() {
        let mut wf = plan(&["uniprot_fetch", "esmfold"]);
        wf.connect("step_1", "sequence", "step_2", "protein_sequence")
            .unwrap();
        let dot = wf.visualize();
        assert!(dot.contains("\"step_1\" [label=\"step_1\\nuniprot_fetch\"]"));
        assert!(dot.contains("\"step_1\" -> \"step_2\""));
        assert!(dot.contains("sequence -> protein_sequence"));
    }
}
