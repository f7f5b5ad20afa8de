//! Workflow construction and repair
//!
//! The manager turns sub-agent messages into workflow mutations: plans
//! become node lists, connector reports become parameter origins, executor
//! reports become results. It also owns the transfer matrix used to insert
//! converter chains when a step's required input types cannot be sourced.
//!
//! Plan step ids and workflow node ids can differ because `chat` steps
//! never become nodes; `step_map` translates between the two.

use crate::protocol::{
    ConnectionFailure, ConnectionReport, ConnectorContent, ExecutorContent, MessagePool,
    PlanContent, Sender,
};
use crate::tools::{ToolManager, CHAT_TOOL_NAME};
use crate::types::{AppError, AppResult};
use crate::workflow::graph::{GlobalIo, Workflow};
use crate::workflow::node::{NodeStatus, ParameterOrigin};
use crate::workflow::transfer::TransferMatrix;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct WorkflowManager {
    tools: Arc<ToolManager>,
    matrix: TransferMatrix,
    workflow: Workflow,
    step_map: HashMap<String, String>,
}

impl WorkflowManager {
    pub fn new(tools: Arc<ToolManager>) -> Self {
        let matrix = TransferMatrix::build(tools.documents().into_iter());
        Self {
            tools,
            matrix,
            workflow: Workflow::new(),
            step_map: HashMap::new(),
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn matrix(&self) -> &TransferMatrix {
        &self.matrix
    }

    /// Workflow node id for a plan step id, if the step became a node
    pub fn node_for(&self, plan_step: &str) -> Option<&str> {
        self.step_map.get(plan_step).map(|s| s.as_str())
    }

    /// Replace the current workflow with one built from a plan. Chat steps
    /// are conversational and produce no node. Steps marked executed import
    /// their recorded arguments and results.
    pub fn set_workflow(&mut self, plan: &PlanContent) -> AppResult<()> {
        let ordered = crate::protocol::ordered_steps(plan);

        let mut tool_names = Vec::new();
        let mut step_map = HashMap::new();
        for (plan_id, step) in &ordered {
            if step.tool == CHAT_TOOL_NAME {
                continue;
            }
            if !self.tools.contains(&step.tool) {
                return Err(AppError::Workflow(format!(
                    "plan step {} names unknown tool '{}'",
                    plan_id, step.tool
                )));
            }
            tool_names.push(step.tool.clone());
            step_map.insert(
                plan_id.clone(),
                crate::workflow::node::step_id(tool_names.len()),
            );
        }

        let mut workflow = Workflow::from_plan(&tool_names);
        for (plan_id, step) in &ordered {
            if !step.executed {
                continue;
            }
            let Some(node_id) = step_map.get(plan_id) else {
                continue;
            };
            if let Some(node) = workflow.node_mut(node_id) {
                node.status = NodeStatus::Executed;
                node.tool_args = step.tool_args.clone();
                node.results = step.results.clone();
            }
        }

        self.workflow = workflow;
        self.step_map = step_map;
        Ok(())
    }

    /// Apply one successful connector report. Bad references mark the
    /// workflow invalid instead of aborting; later executions still land.
    pub fn connect_tool_node(&mut self, report: &ConnectionReport) {
        let Some(node_id) = self.step_map.get(&report.current_step).cloned() else {
            warn!(step = %report.current_step, "Connector report for a step with no node");
            self.workflow.valid = false;
            return;
        };
        let document = match self
            .workflow
            .node(&node_id)
            .and_then(|n| self.tools.get(&n.tool_name).ok())
        {
            Some(tool) => tool.document().clone(),
            None => {
                warn!(step = %node_id, "Connector report for an unresolvable tool");
                self.workflow.valid = false;
                return;
            }
        };

        for (param, source) in &report.connection {
            if document.parameter(param).is_none() {
                warn!(step = %node_id, parameter = %param, tool = %document.tool_name,
                    "Connection for an undeclared parameter rejected");
                self.workflow.valid = false;
                continue;
            }
            let bound = match source.source.as_str() {
                "user_input" => {
                    self.workflow
                        .set_origin(&node_id, param, ParameterOrigin::UserInput)
                }
                "default" => self
                    .workflow
                    .set_origin(&node_id, param, ParameterOrigin::Default),
                "node_output" => self.bind_node_output(&node_id, param, source),
                other => Err(AppError::Workflow(format!(
                    "unknown origin source '{}'",
                    other
                ))),
            };
            if let Err(e) = bound {
                warn!(step = %node_id, parameter = %param, error = %e, "Connection rejected");
                self.workflow.valid = false;
            }
        }

        if let Some(node) = self.workflow.node_mut(&node_id) {
            if node.status == NodeStatus::Init {
                node.status = NodeStatus::Connected;
            }
        }
    }

    fn bind_node_output(
        &mut self,
        node_id: &str,
        param: &str,
        source: &crate::protocol::ConnectionSource,
    ) -> AppResult<()> {
        let (Some(source_id), Some(output_name)) = (&source.source_id, &source.source_parameter)
        else {
            return Err(AppError::Workflow(format!(
                "node_output origin for '{}' is missing source_id or source_parameter",
                param
            )));
        };
        let upstream = self
            .step_map
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| source_id.clone());

        let upstream_tool = self
            .workflow
            .node(&upstream)
            .map(|n| n.tool_name.clone())
            .ok_or_else(|| AppError::Workflow(format!("unknown upstream node '{}'", upstream)))?;
        let declared = self
            .tools
            .get(&upstream_tool)?
            .document()
            .return_value(output_name)
            .is_some();
        if !declared {
            return Err(AppError::Workflow(format!(
                "'{}' declares no return value '{}'",
                upstream_tool, output_name
            )));
        }

        self.workflow.connect(&upstream, output_name, node_id, param)
    }

    /// Apply one executor report: materialized arguments, results, status.
    pub fn execute_toolnode(&mut self, exec: &ExecutorContent) {
        let Some(node_id) = self.step_map.get(&exec.current_step).cloned() else {
            warn!(step = %exec.current_step, "Executor report for a step with no node");
            return;
        };
        if let Some(node) = self.workflow.node_mut(&node_id) {
            node.tool_args = exec.tool_arg.clone();
            node.results = exec.results.clone();
            node.status = if exec.succeeded() {
                NodeStatus::Executed
            } else {
                NodeStatus::Failed
            };
        }
    }

    /// Type-directed repair: insert a converter chain in front of the
    /// failing step so every missing type becomes producible. Returns the
    /// inserted tool chain; the caller renumbers its plan to match.
    pub fn repair(&mut self, failure: &ConnectionFailure) -> AppResult<Vec<String>> {
        let available: Vec<String> = failure.arguments_pool.keys().cloned().collect();
        let chain = self
            .matrix
            .chain_for_missing(&failure.missing_types, &available)?;
        if chain.is_empty() {
            return Ok(chain);
        }

        let node_id = self
            .step_map
            .get(&failure.current_step)
            .cloned()
            .ok_or_else(|| {
                AppError::Workflow(format!(
                    "cannot repair step '{}': no workflow node",
                    failure.current_step
                ))
            })?;
        debug!(step = %node_id, chain = ?chain, "Inserting converter chain");
        self.workflow.insert_before(&chain, &node_id)?;

        // After insertion the plan is regenerated from the workflow, so
        // plan ids and node ids coincide again
        self.step_map = self
            .workflow
            .nodes
            .iter()
            .map(|n| (n.node_id.clone(), n.node_id.clone()))
            .collect();
        Ok(chain)
    }

    /// Rebuild the workflow from a recorded message pool. Connection
    /// problems mark it invalid without stopping the replay.
    pub fn replay(&mut self, pool: &MessagePool) -> &Workflow {
        self.workflow = Workflow::new();
        self.step_map.clear();

        for message in pool.messages() {
            match message.sender {
                Sender::Planner => match message.content_as::<PlanContent>() {
                    Ok(plan) => {
                        if let Err(e) = self.set_workflow(&plan) {
                            warn!(error = %e, "Replayed plan rejected");
                            self.workflow.valid = false;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Unparseable plan in pool");
                        self.workflow.valid = false;
                    }
                },
                Sender::Connector => {
                    if let Ok(ConnectorContent::Connected(report)) = message.content_as() {
                        self.connect_tool_node(&report);
                    }
                }
                Sender::Executor => {
                    if let Ok(exec) = message.content_as::<ExecutorContent>() {
                        self.execute_toolnode(&exec);
                    }
                }
                _ => {}
            }
        }
        &self.workflow
    }

    pub fn global_io(&self) -> GlobalIo {
        self.workflow.global_io(|tool| {
            self.tools
                .get(tool)
                .map(|t| {
                    t.document()
                        .return_values
                        .iter()
                        .map(|r| r.name.clone())
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Persist the current workflow under `<output_root>/workflows/`.
    pub fn save(&self, output_root: &Path) -> AppResult<PathBuf> {
        let dir = output_root.join("workflows");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "workflow_{}.json",
            Utc::now().format("%Y%m%d_%H%M%S%.3f")
        ));
        let body = serde_json::to_string_pretty(&self.workflow)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        std::fs::write(&path, body)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::protocol::AgentMessage;
    use serde_json::json;

    fn fixture_tools() -> Arc<ToolManager> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("detailed_types.json"),
            json!({
                "UNIPROT_ID": "UniProt accession",
                "PROTEIN_SEQUENCE": "Amino-acid sequence",
                "STRUCTURE_FILE": "3D structure file",
                "PLDDT_SCORE": "Mean pLDDT confidence"
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("uniprot_fetch.json"),
            json!({
                "category": "database",
                "tool_name": "uniprot_fetch",
                "description": "Fetch a protein sequence from UniProt",
                "required_parameters": [
                    {"name": "uniprot_id", "type": "text",
                     "detailed_type": "UNIPROT_ID", "description": ""}
                ],
                "return_values": [
                    {"name": "sequence", "type": "text",
                     "detailed_type": "PROTEIN_SEQUENCE", "description": ""}
                ],
                "runtime": {"kind": "subprocess", "command": ["python3", "uniprot.py"]}
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("esmfold.json"),
            json!({
                "category": "structure_prediction",
                "tool_name": "esmfold",
                "description": "Predict protein structure",
                "required_parameters": [
                    {"name": "protein_sequence", "type": "text",
                     "detailed_type": "PROTEIN_SEQUENCE", "description": ""}
                ],
                "return_values": [
                    {"name": "save_path", "type": "path",
                     "detailed_type": "STRUCTURE_FILE", "description": ""},
                    {"name": "avg_plddt", "type": "float",
                     "detailed_type": "PLDDT_SCORE", "description": ""}
                ],
                "runtime": {"kind": "subprocess", "command": ["python3", "esmfold.py"]}
            })
            .to_string(),
        )
        .unwrap();

        let runtime = RuntimeConfig {
            tool_config_dir: dir.path().to_path_buf(),
            output_root: "unused".into(),
            tool_timeout_secs: 60,
            log_poll_interval_ms: 100,
        };
        Arc::new(ToolManager::load(dir.path(), &runtime).unwrap())
    }

    fn plan(value: serde_json::Value) -> PlanContent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_chat_steps_produce_no_nodes() {
        let mut manager = WorkflowManager::new(fixture_tools());
        manager
            .set_workflow(&plan(json!({
                "step_1": {"tool": "chat", "reason": "greet the user"}
            })))
            .unwrap();
        assert!(manager.workflow().is_empty());
        assert!(manager.workflow().valid);
    }

    #[test]
    fn test_chat_steps_shift_node_ids() {
        let mut manager = WorkflowManager::new(fixture_tools());
        manager
            .set_workflow(&plan(json!({
                "step_1": {"tool": "chat", "reason": "explain"},
                "step_2": {"tool": "esmfold", "reason": "predict"}
            })))
            .unwrap();
        assert_eq!(manager.node_for("step_2"), Some("step_1"));
        assert_eq!(manager.workflow().nodes[0].tool_name, "esmfold");
    }

    #[test]
    fn test_unknown_tool_in_plan_rejected() {
        let mut manager = WorkflowManager::new(fixture_tools());
        let err = manager
            .set_workflow(&plan(json!({
                "step_1": {"tool": "alphafold99", "reason": ""}
            })))
            .unwrap_err();
        assert!(err.to_string().contains("alphafold99"));
    }

    #[test]
    fn test_connect_and_execute_round() {
        let mut manager = WorkflowManager::new(fixture_tools());
        manager
            .set_workflow(&plan(json!({
                "step_1": {"tool": "uniprot_fetch", "reason": ""},
                "step_2": {"tool": "esmfold", "reason": ""}
            })))
            .unwrap();

        let report: ConnectionReport = serde_json::from_value(json!({
            "connection": {
                "protein_sequence": {
                    "source": "node_output",
                    "source_id": "step_1",
                    "source_parameter": "sequence"
                }
            },
            "current_step": "step_2"
        }))
        .unwrap();
        manager.connect_tool_node(&report);
        assert!(manager.workflow().valid);
        assert_eq!(
            manager.workflow().node("step_2").unwrap().status,
            NodeStatus::Connected
        );

        let exec: ExecutorContent = serde_json::from_value(json!({
            "status": "success",
            "results": {"sequence": "MKTAYIAK"},
            "tool_arg": {"uniprot_id": "P12345"},
            "current_step": "step_1",
            "tool_name": "uniprot_fetch"
        }))
        .unwrap();
        manager.execute_toolnode(&exec);
        let node = manager.workflow().node("step_1").unwrap();
        assert_eq!(node.status, NodeStatus::Executed);
        assert_eq!(node.results["sequence"], json!("MKTAYIAK"));
    }

    #[test]
    fn test_bad_connection_marks_invalid_but_keeps_going() {
        let mut manager = WorkflowManager::new(fixture_tools());
        manager
            .set_workflow(&plan(json!({
                "step_1": {"tool": "uniprot_fetch", "reason": ""},
                "step_2": {"tool": "esmfold", "reason": ""}
            })))
            .unwrap();

        let report: ConnectionReport = serde_json::from_value(json!({
            "connection": {
                "protein_sequence": {
                    "source": "node_output",
                    "source_id": "step_1",
                    "source_parameter": "no_such_output"
                }
            },
            "current_step": "step_2"
        }))
        .unwrap();
        manager.connect_tool_node(&report);
        assert!(!manager.workflow().valid);

        // Executions still materialize afterwards
        let exec: ExecutorContent = serde_json::from_value(json!({
            "status": "success",
            "results": {"sequence": "MKT"},
            "tool_arg": {},
            "current_step": "step_1",
            "tool_name": "uniprot_fetch"
        }))
        .unwrap();
        manager.execute_toolnode(&exec);
        assert_eq!(
            manager.workflow().node("step_1").unwrap().status,
            NodeStatus::Executed
        );
    }

    #[test]
    fn test_undeclared_parameter_marks_invalid() {
        let mut manager = WorkflowManager::new(fixture_tools());
        manager
            .set_workflow(&plan(json!({
                "step_1": {"tool": "esmfold", "reason": ""}
            })))
            .unwrap();

        let report: ConnectionReport = serde_json::from_value(json!({
            "connection": {"not_a_real_parameter": {"source": "user_input"}},
            "current_step": "step_1"
        }))
        .unwrap();
        manager.connect_tool_node(&report);

        assert!(!manager.workflow().valid);
        let node = manager.workflow().node("step_1").unwrap();
        assert!(node.parameter_origins.is_empty());
    }

    #[test]
    fn test_repair_inserts_converter_chain() {
        let mut manager = WorkflowManager::new(fixture_tools());
        manager
            .set_workflow(&plan(json!({
                "step_1": {"tool": "esmfold", "reason": ""}
            })))
            .unwrap();

        let failure: ConnectionFailure = serde_json::from_value(json!({
            "error": "missing_type",
            "current_step": "step_1",
            "arguments_pool": {"UNIPROT_ID": "P12345"},
            "missing_types": ["PROTEIN_SEQUENCE"]
        }))
        .unwrap();

        let chain = manager.repair(&failure).unwrap();
        assert_eq!(chain, vec!["uniprot_fetch".to_string()]);
        assert_eq!(manager.workflow().nodes[0].tool_name, "uniprot_fetch");
        assert_eq!(manager.workflow().nodes[1].tool_name, "esmfold");
        assert_eq!(manager.workflow().nodes[1].node_id, "step_2");
    }

    #[test]
    fn test_repair_unreachable_type_is_plan_level_error() {
        let mut manager = WorkflowManager::new(fixture_tools());
        manager
            .set_workflow(&plan(json!({
                "step_1": {"tool": "esmfold", "reason": ""}
            })))
            .unwrap();

        let failure: ConnectionFailure = serde_json::from_value(json!({
            "error": "missing_type",
            "current_step": "step_1",
            "arguments_pool": {"STRUCTURE_FILE": "x.pdb"},
            "missing_types": ["PROTEIN_SEQUENCE"]
        }))
        .unwrap();

        let err = manager.repair(&failure).unwrap_err();
        assert!(err.to_string().contains("No tool chain to produce"));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let tools = fixture_tools();
        let mut pool = MessagePool::new();
        pool.push(AgentMessage::new(
            Sender::Planner,
            "",
            json!({
                "step_1": {"tool": "uniprot_fetch", "reason": ""},
                "step_2": {"tool": "esmfold", "reason": ""}
            }),
        ));
        pool.push(AgentMessage::new(
            Sender::Connector,
            "",
            json!({
                "connection": {"uniprot_id": {"source": "user_input"}},
                "current_step": "step_1"
            }),
        ));
        pool.push(AgentMessage::new(
            Sender::Executor,
            "",
            json!({
                "status": "success",
                "results": {"sequence": "MKT"},
                "tool_arg": {"uniprot_id": "P12345"},
                "current_step": "step_1",
                "tool_name": "uniprot_fetch"
            }),
        ));

        let mut manager = WorkflowManager::new(tools);
        let first = serde_json::to_value(manager.replay(&pool)).unwrap();
        let second = serde_json::to_value(manager.replay(&pool)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first["step_1"]["status"], json!("executed"));
    }

    #[test]
    fn test_executed_steps_imported_from_plan() {
        let mut manager = WorkflowManager::new(fixture_tools());
        manager
            .set_workflow(&plan(json!({
                "step_1": {
                    "tool": "uniprot_fetch",
                    "reason": "",
                    "executed": true,
                    "tool_args": {"uniprot_id": "P12345"},
                    "results": {"sequence": "MKT"}
                },
                "step_2": {"tool": "esmfold", "reason": ""}
            })))
            .unwrap();

        let node = manager.workflow().node("step_1").unwrap();
        assert_eq!(node.status, NodeStatus::Executed);
        assert_eq!(node.results["sequence"], json!("MKT"));
        assert_eq!(
            manager.workflow().node("step_2").unwrap().status,
            NodeStatus::Init
        );
    }

    #[test]
    fn test_save_writes_under_workflows_dir() {
        let out = tempfile::tempdir().unwrap();
        let mut manager = WorkflowManager::new(fixture_tools());
        manager
            .set_workflow(&plan(json!({
                "step_1": {"tool": "esmfold", "reason": ""}
            })))
            .unwrap();

        let path = manager.save(out.path()).unwrap();
        assert!(path.starts_with(out.path().join("workflows")));
        let restored: Workflow =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(&restored, manager.workflow());
    }
}
