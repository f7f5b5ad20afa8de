//! Orchestrator
//!
//! Drives the sub-agent state machine for one conversation:
//!
//! ```text
//! INIT -> PARSE_QUERY -> PLAN -> (per step: CONNECT -> repair? -> EXECUTE)
//!      -> RESPOND -> TITLE -> IDLE
//! ```
//!
//! Every sub-agent delta is forwarded to the UI as a GENERATING snapshot of
//! the message pool; terminal phases emit FINAL_RESPONSE, WORKFLOW, TITLE
//! and IDLE events. Failed plans are abandoned and regenerated within
//! `max_plan_turns`; failed steps retry within `max_step_turns`.

use crate::agents::connector::ToolConnector;
use crate::agents::executor::ToolExecutor;
use crate::agents::planner::PlanGenerator;
use crate::agents::query_parser::QueryParser;
use crate::agents::responder::Responder;
use crate::agents::titler::Titler;
use crate::agents::{AgentRuntime, DeltaSink};
use crate::config::OrchestratorConfig;
use crate::llm::LLM;
use crate::protocol::{
    ordered_steps, AgentMessage, AgentResponse, ConnectionReport, ConnectorContent,
    MessagePool, PlanContent, PlanStep, ResponseStatus, Sender,
};
use crate::tools::{InvocationContext, ToolDocument, ToolManager, CHAT_TOOL_NAME};
use crate::types::{AppError, AppResult};
use crate::workflow::{Workflow, WorkflowManager};
use futures::future::Future;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub struct Orchestrator {
    tools: Arc<ToolManager>,
    llm: Arc<LLM>,
    provider: String,
    model: String,
    config: OrchestratorConfig,
    /// Exclusively owned by this conversation
    output_root: PathBuf,
}

impl Orchestrator {
    pub fn new(
        tools: Arc<ToolManager>,
        llm: Arc<LLM>,
        provider: &str,
        model: &str,
        config: OrchestratorConfig,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tools,
            llm,
            provider: provider.to_string(),
            model: model.to_string(),
            config,
            output_root: output_root.into(),
        }
    }

    /// Run the full pipeline for one user turn, streaming UI events. The
    /// stream always ends with a terminal IDLE or ERROR event.
    pub fn stream_chat(
        self: &Arc<Self>,
        query: String,
        uploaded_files: Vec<String>,
        cancel: watch::Receiver<bool>,
    ) -> BoxStream<'static, AgentResponse> {
        let (tx, rx) = mpsc::channel::<AgentResponse>(64);
        let this = self.clone();

        tokio::spawn(async move {
            let mut pool = MessagePool::new();
            let mut manager = WorkflowManager::new(this.tools.clone());
            let mut cancel = cancel;

            if let Err(e) = this
                .drive(&query, &uploaded_files, &mut pool, &mut manager, &mut cancel, &tx)
                .await
            {
                let reason = match &e {
                    AppError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                };
                warn!(error = %reason, "Pipeline terminated with an error");
                let workflow = serde_json::to_value(manager.replay(&pool)).ok();
                let _ = tx
                    .send(AgentResponse {
                        content: pool.serialized(),
                        status: ResponseStatus::Error,
                        workflow,
                        error: Some(reason),
                    })
                    .await;
            }
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    async fn drive(
        &self,
        query: &str,
        uploaded_files: &[String],
        pool: &mut MessagePool,
        manager: &mut WorkflowManager,
        cancel: &mut watch::Receiver<bool>,
        tx: &mpsc::Sender<AgentResponse>,
    ) -> AppResult<()> {
        let rt = AgentRuntime::new(
            self.llm.clone(),
            &self.provider,
            &self.model,
            self.config.max_agent_retries,
        );
        let ctx = InvocationContext::new(&self.output_root);
        let rt = &rt;

        // PARSE_QUERY
        let parsed = self
            .with_partial_stream(pool, Sender::QueryParser, tx, |d| async move {
                QueryParser::run(&rt, query, self.tools.vocabulary(), uploaded_files, Some(&d))
                    .await
            })
            .await?;
        let parsed_inputs = parsed.content.clone();
        let parsed_inputs = &parsed_inputs;
        pool.push(parsed);
        self.yield_snapshot(pool, tx).await;
        ensure_live(cancel)?;

        // PLAN, with bounded replanning
        let mut plan_turn = 0u32;
        'replan: loop {
            plan_turn += 1;
            if plan_turn > self.config.max_plan_turns {
                return Err(AppError::Workflow(
                    "replanning budget exhausted".to_string(),
                ));
            }

            let history = pool.render_history();
            let (plan_message, plan) = self
                .with_partial_stream(pool, Sender::Planner, tx, |d| async move {
                    PlanGenerator::run(&rt, query, &parsed_inputs, &self.tools, &history, Some(&d))
                        .await
                })
                .await?;
            pool.push(plan_message);
            manager.set_workflow(&plan)?;
            self.yield_snapshot(pool, tx).await;
            ensure_live(cancel)?;

            let mut plan = plan;
            let mut steps = ordered_steps(&plan);
            let mut attempts: HashMap<String, u32> = HashMap::new();
            let mut index = 0usize;

            while index < steps.len() {
                let (step_id, entry) = steps[index].clone();
                if entry.tool == CHAT_TOOL_NAME || entry.executed {
                    index += 1;
                    continue;
                }

                let turns = attempts.entry(step_id.clone()).or_insert(0);
                *turns += 1;
                if *turns > self.config.max_step_turns {
                    warn!(step = %step_id, "Step attempt budget exhausted, abandoning plan");
                    continue 'replan;
                }

                let tool = self.tools.get(&entry.tool)?;
                let document = tool.document().clone();

                // CONNECT
                let pool_text =
                    render_arguments_pool(&parsed_inputs, manager.workflow(), &self.tools);
                let (connector_message, connection) = {
                    let step_id = step_id.clone();
                    let document = document.clone();
                    self.with_partial_stream(pool, Sender::Connector, tx, |d| async move {
                        ToolConnector::run(&rt, &step_id, &document, &pool_text, Some(&d)).await
                    })
                    .await?
                };
                pool.push(connector_message);
                self.yield_snapshot(pool, tx).await;
                ensure_live(cancel)?;

                let report = match connection {
                    ConnectorContent::Connected(report) => report,
                    ConnectorContent::Failed(failure) => {
                        let repairable = !failure.missing_types.is_empty()
                            && (self.config.repair_on_any_error
                                || failure.error == "missing_type");
                        if !repairable {
                            warn!(step = %step_id, error = %failure.error, "Unrepairable connection failure");
                            continue 'replan;
                        }
                        match manager.repair(&failure) {
                            Ok(chain) if !chain.is_empty() => {
                                // A repair rewrites the plan, so it spends a
                                // replanning turn; otherwise a connector that
                                // keeps reporting repairable failures would
                                // grow the workflow without bound
                                plan_turn += 1;
                                if plan_turn > self.config.max_plan_turns {
                                    return Err(AppError::Workflow(
                                        "replanning budget exhausted".to_string(),
                                    ));
                                }
                                info!(step = %step_id, chain = ?chain, "Plan repaired by converter insertion");
                                plan = plan_from_workflow(manager.workflow(), &plan);
                                pool.push(plan_as_message(&plan, &chain));
                                manager.set_workflow(&plan)?;
                                self.yield_snapshot(pool, tx).await;
                                steps = ordered_steps(&plan);
                                attempts.clear();
                                index = 0;
                                continue;
                            }
                            Ok(_) => {
                                // Nothing actually missing; let the step retry
                                continue;
                            }
                            Err(e) => {
                                warn!(step = %step_id, error = %e, "Type-directed repair failed");
                                continue 'replan;
                            }
                        }
                    }
                };
                manager.connect_tool_node(&report);

                // EXECUTE, with the running tool hooked to the cancel signal
                let connections_text =
                    render_connections(&report, manager.workflow(), &parsed_inputs, &document);
                let watcher = {
                    let tool = tool.clone();
                    let ctx = ctx.clone();
                    let mut rx = cancel.clone();
                    tokio::spawn(async move {
                        loop {
                            if *rx.borrow() {
                                tool.cancel(&ctx).await;
                                break;
                            }
                            if rx.changed().await.is_err() {
                                break;
                            }
                        }
                    })
                };
                let executed = {
                    let step_id = step_id.clone();
                    let tool = tool.clone();
                    let ctx = ctx.clone();
                    self.with_partial_stream(pool, Sender::Executor, tx, |d| async move {
                        ToolExecutor::run(&rt, tool, &step_id, &connections_text, &ctx, Some(&d))
                            .await
                    })
                    .await
                };
                watcher.abort();
                let (executor_message, execution) = executed?;
                pool.push(executor_message);
                self.yield_snapshot(pool, tx).await;

                let error_text = execution
                    .results
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if *cancel.borrow() || error_text == "Cancelled" {
                    manager.execute_toolnode(&execution);
                    return Err(AppError::Cancelled);
                }

                manager.execute_toolnode(&execution);
                if execution.succeeded() {
                    let entry = &mut steps[index].1;
                    entry.executed = true;
                    entry.tool_args = execution.tool_arg.clone();
                    entry.results = execution.results.clone();
                    plan.insert(step_id.clone(), entry.clone());
                    index += 1;
                } else if error_text == "Timeout" {
                    // Timeouts are not retried within the same plan
                    warn!(step = %step_id, "Tool timed out, abandoning plan");
                    continue 'replan;
                }
                // Other runtime errors retry the same step within its budget
            }

            break;
        }

        // RESPOND
        let history = pool.render_history();
        let responder_message = self
            .with_partial_stream(pool, Sender::Responder, tx, |d| async move {
                Responder::run(&rt, query, &history, Some(&d)).await
            })
            .await?;
        let final_text = responder_message.content_text();
        pool.push(responder_message);
        let _ = tx
            .send(AgentResponse {
                content: pool.serialized(),
                status: ResponseStatus::FinalResponse,
                workflow: None,
                error: None,
            })
            .await;
        ensure_live(cancel)?;

        // Materialize the final workflow from the recorded pool
        let workflow = manager.replay(pool).clone();
        let mut workflow_value =
            serde_json::to_value(&workflow).map_err(|e| AppError::Internal(e.to_string()))?;
        if let Value::Object(map) = &mut workflow_value {
            let io = serde_json::to_value(manager.global_io())
                .map_err(|e| AppError::Internal(e.to_string()))?;
            map.insert("global_io".to_string(), io);
        }
        let saved = manager.save(&self.output_root)?;
        info!(path = %saved.display(), "Workflow persisted");
        let _ = tx
            .send(AgentResponse {
                content: pool.serialized(),
                status: ResponseStatus::Workflow,
                workflow: Some(workflow_value.clone()),
                error: None,
            })
            .await;

        // TITLE
        let title_message = self
            .with_partial_stream(pool, Sender::Titler, tx, |d| async move {
                Titler::run(&rt, query, &final_text, Some(&d)).await
            })
            .await?;
        pool.push(title_message);
        let _ = tx
            .send(AgentResponse {
                content: pool.serialized(),
                status: ResponseStatus::Title,
                workflow: None,
                error: None,
            })
            .await;

        let _ = tx
            .send(AgentResponse {
                content: pool.serialized(),
                status: ResponseStatus::Idle,
                workflow: Some(workflow_value),
                error: None,
            })
            .await;
        Ok(())
    }

    /// Run one sub-agent call while forwarding its text deltas as
    /// GENERATING snapshots: the current pool plus one growing in-progress
    /// message.
    async fn with_partial_stream<T, Fut>(
        &self,
        pool: &MessagePool,
        sender: Sender,
        tx: &mpsc::Sender<AgentResponse>,
        call: impl FnOnce(DeltaSink) -> Fut,
    ) -> AppResult<T>
    where
        Fut: Future<Output = AppResult<T>>,
    {
        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
        let base = pool.clone();
        let out = tx.clone();
        let forwarder = tokio::spawn(async move {
            let mut accumulated = String::new();
            while let Some(delta) = delta_rx.recv().await {
                accumulated.push_str(&delta);
                let _ = out
                    .send(AgentResponse::generating(
                        base.serialized_with_partial(sender, &accumulated),
                    ))
                    .await;
            }
        });

        let result = call(delta_tx).await;
        let _ = forwarder.await;
        result
    }

    async fn yield_snapshot(&self, pool: &MessagePool, tx: &mpsc::Sender<AgentResponse>) {
        let _ = tx.send(AgentResponse::generating(pool.serialized())).await;
    }
}

fn ensure_live(cancel: &watch::Receiver<bool>) -> AppResult<()> {
    if *cancel.borrow() {
        Err(AppError::Cancelled)
    } else {
        Ok(())
    }
}

/// Rebuild the plan from the repaired workflow, carrying forward reasons
/// and executed state. Inserted converter steps get a standard reason.
fn plan_from_workflow(workflow: &Workflow, previous: &PlanContent) -> PlanContent {
    let mut unused: Vec<(&str, &str)> = previous
        .values()
        .map(|s| (s.tool.as_str(), s.reason.as_str()))
        .collect();

    workflow
        .nodes
        .iter()
        .map(|node| {
            let reason = unused
                .iter()
                .position(|(tool, _)| *tool == node.tool_name)
                .map(|i| unused.remove(i).1.to_string())
                .unwrap_or_else(|| "Inserted to convert available inputs".to_string());
            (
                node.node_id.clone(),
                PlanStep {
                    tool: node.tool_name.clone(),
                    reason,
                    executed: node.is_executed(),
                    tool_args: node.tool_args.clone(),
                    results: node.results.clone(),
                },
            )
        })
        .collect()
}

fn plan_as_message(plan: &PlanContent, chain: &[String]) -> AgentMessage {
    AgentMessage::new(
        Sender::Planner,
        format!("Inserted converter chain: {}", chain.join(" -> ")),
        serde_json::to_value(plan).unwrap_or(Value::Null),
    )
}

/// Everything a step can draw on, rendered for the connector prompt: user
/// inputs keyed by detailed type, plus outputs of executed nodes.
fn render_arguments_pool(
    user_inputs: &Value,
    workflow: &Workflow,
    tools: &ToolManager,
) -> String {
    let mut lines = vec!["User inputs:".to_string()];
    match user_inputs.as_object() {
        Some(map) if !map.is_empty() => {
            for (tag, value) in map {
                lines.push(format!("  - {}: {}", tag, value));
            }
        }
        _ => lines.push("  (none)".to_string()),
    }

    lines.push("Executed step outputs:".to_string());
    let mut any = false;
    for node in &workflow.nodes {
        if !node.is_executed() {
            continue;
        }
        let document = tools.get(&node.tool_name).ok().map(|t| t.document().clone());
        for (name, value) in &node.results {
            if name == "error" {
                continue;
            }
            let tag = document
                .as_ref()
                .and_then(|d| d.return_value(name))
                .map(|r| r.detailed_type.clone())
                .unwrap_or_else(|| "UNTYPED".to_string());
            lines.push(format!("  - {}.{} ({}): {}", node.node_id, name, tag, value));
            any = true;
        }
    }
    if !any {
        lines.push("  (none)".to_string());
    }
    lines.join("\n")
}

/// The connector's decisions plus the literal values behind them, rendered
/// for the executor prompt.
fn render_connections(
    report: &ConnectionReport,
    workflow: &Workflow,
    user_inputs: &Value,
    document: &ToolDocument,
) -> String {
    report
        .connection
        .iter()
        .map(|(param, source)| match source.source.as_str() {
            "user_input" => {
                let tag = document
                    .parameter(param)
                    .map(|p| p.detailed_type.clone())
                    .unwrap_or_default();
                let value = user_inputs.get(&tag).cloned().unwrap_or(Value::Null);
                format!("- {} <- user_input ({}): {}", param, tag, value)
            }
            "default" => format!("- {} <- default", param),
            "node_output" => {
                let step = source.source_id.as_deref().unwrap_or("?");
                let output = source.source_parameter.as_deref().unwrap_or("?");
                let value = workflow
                    .node(step)
                    .and_then(|n| n.results.get(output))
                    .cloned()
                    .unwrap_or(Value::Null);
                format!("- {} <- {}.{}: {}", param, step, output, value)
            }
            other => format!("- {} <- {}", param, other),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
