//! Subprocess-backed tools
//!
//! The tool's executable receives `--args <json>` and `--output-dir <dir>`
//! and is expected to print its structured results JSON as the last line of
//! stdout. stdout and stderr are both captured into a timestamped log file;
//! the final line of the log always encodes the terminal results object so
//! log-tailing consumers can recover it without the return channel.
//!
//! One `SubprocessTool` is shared by every conversation, so in-flight
//! process groups and cancel requests are tracked per conversation output
//! root: cancelling conversation A never touches conversation B's process.

use crate::tools::document::ToolDocument;
use crate::tools::runtime::{
    error_results, InvocationContext, InvocationStatus, JsonMap, RunStream, RunUpdate, Tool,
    ToolInvocation,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Default)]
struct RunState {
    /// Conversation roots with a pending cancel request
    cancelled: HashSet<PathBuf>,
    /// Process groups of in-flight runs, keyed by conversation root
    running: HashMap<PathBuf, Vec<i32>>,
}

pub struct SubprocessTool {
    document: ToolDocument,
    command: Vec<String>,
    timeout: Duration,
    poll_interval: Duration,
    state: Arc<Mutex<RunState>>,
}

/// Everything a single execution needs, detached from `&self` so streaming
/// runs can move it into a task.
#[derive(Clone)]
struct ExecSpec {
    tool_name: String,
    command: Vec<String>,
    timeout: Duration,
    state: Arc<Mutex<RunState>>,
}

struct Prepared {
    dir: PathBuf,
    log_path: PathBuf,
}

impl SubprocessTool {
    pub fn new(
        document: ToolDocument,
        command: Vec<String>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            document,
            command,
            timeout,
            poll_interval,
            state: Arc::new(Mutex::new(RunState::default())),
        }
    }

    fn spec(&self) -> ExecSpec {
        ExecSpec {
            tool_name: self.document.tool_name.clone(),
            command: self.command.clone(),
            timeout: self.timeout,
            state: self.state.clone(),
        }
    }
}

fn lock_state(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

fn prepare(ctx: &InvocationContext, tool_name: &str) -> std::io::Result<Prepared> {
    let dir = ctx.invocation_dir(tool_name)?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let log_path = dir.join(format!("{}_{}.log", tool_name, stamp));
    std::fs::File::create(&log_path)?;
    Ok(Prepared { dir, log_path })
}

#[cfg(unix)]
fn kill_process_group(pgid: i32) {
    // The child was placed in its own process group, so this takes the
    // whole tree down with it.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: i32) {}

async fn append_results_line(log_path: &PathBuf, results: &JsonMap) {
    let line = serde_json::to_string(results).unwrap_or_default();
    match tokio::fs::OpenOptions::new()
        .append(true)
        .open(log_path)
        .await
    {
        Ok(mut file) => {
            let _ = file.write_all(format!("\n{}\n", line).as_bytes()).await;
        }
        Err(e) => warn!(error = %e, "Failed to append results line to tool log"),
    }
}

/// Persist the invocation record next to the log so a run stays auditable
/// after the conversation moves on.
async fn write_invocation_record(prepared: &Prepared, record: &ToolInvocation) {
    match serde_json::to_string_pretty(record) {
        Ok(body) => {
            if let Err(e) = tokio::fs::write(prepared.dir.join("invocation.json"), body).await {
                warn!(error = %e, "Failed to write invocation record");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize invocation record"),
    }
}

/// Read child stdout line by line into the log file, remembering the last
/// non-empty line (the results candidate).
async fn drain_stdout(
    stdout: tokio::process::ChildStdout,
    log_path: PathBuf,
) -> Option<String> {
    let mut last_line = None;
    let mut log = match tokio::fs::OpenOptions::new().append(true).open(&log_path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "Failed to open tool log for stdout capture");
            return None;
        }
    };

    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = log.write_all(line.as_bytes()).await;
        let _ = log.write_all(b"\n").await;
        if !line.trim().is_empty() {
            last_line = Some(line);
        }
    }
    let _ = log.flush().await;
    last_line
}

async fn execute(
    spec: ExecSpec,
    args: JsonMap,
    ctx: InvocationContext,
    prepared: Prepared,
) -> (JsonMap, InvocationStatus) {
    let key = ctx.output_root.clone();

    // A fresh run clears any cancellation left over from a previous attempt
    // of the same conversation
    lock_state(&spec.state).cancelled.remove(&key);

    let record = ToolInvocation::started();

    let args_json = match serde_json::to_string(&Value::Object(args)) {
        Ok(s) => s,
        Err(e) => return (error_results(e.to_string()), InvocationStatus::Error),
    };

    let stderr_file = match std::fs::OpenOptions::new()
        .append(true)
        .open(&prepared.log_path)
    {
        Ok(f) => f,
        Err(e) => return (error_results(e.to_string()), InvocationStatus::Error),
    };

    let (program, rest) = match spec.command.split_first() {
        Some(parts) => parts,
        None => {
            return (
                error_results(format!("tool '{}' has an empty command", spec.tool_name)),
                InvocationStatus::Error,
            )
        }
    };

    let mut cmd = Command::new(program);
    cmd.args(rest)
        .arg("--args")
        .arg(&args_json)
        .arg("--output-dir")
        .arg(&prepared.dir)
        .current_dir(&ctx.output_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(stderr_file));
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return (
                error_results(format!("failed to spawn '{}': {}", program, e)),
                InvocationStatus::Error,
            )
        }
    };

    let pid = child.id().map(|p| p as i32);
    let cancelled_before_registration = {
        let mut state = lock_state(&spec.state);
        if state.cancelled.contains(&key) {
            // Cancelled between spawn request and registration
            true
        } else {
            if let Some(pid) = pid {
                state.running.entry(key.clone()).or_default().push(pid);
            }
            false
        }
    };
    if cancelled_before_registration {
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        let _ = child.wait().await;
        let results = error_results("Cancelled");
        append_results_line(&prepared.log_path, &results).await;
        return (results, InvocationStatus::Cancelled);
    }
    debug!(tool = %spec.tool_name, pid = ?pid, "Spawned tool process");

    let reader = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(drain_stdout(stdout, prepared.log_path.clone())));

    let wait_result = tokio::time::timeout(spec.timeout, child.wait()).await;

    let cancelled = {
        let mut state = lock_state(&spec.state);
        if let Some(pids) = state.running.get_mut(&key) {
            pids.retain(|p| Some(*p) != pid);
            if pids.is_empty() {
                state.running.remove(&key);
            }
        }
        state.cancelled.remove(&key)
    };

    let (results, status) = match wait_result {
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
            if let Some(handle) = &reader {
                handle.abort();
            }
            (error_results("Timeout"), InvocationStatus::Timeout)
        }
        Ok(Err(e)) => (
            error_results(format!("failed to wait for process: {}", e)),
            InvocationStatus::Error,
        ),
        Ok(Ok(exit)) => {
            let last_line = match reader {
                Some(handle) => handle.await.ok().flatten(),
                None => None,
            };

            if cancelled {
                (error_results("Cancelled"), InvocationStatus::Cancelled)
            } else if exit.success() {
                match last_line
                    .as_deref()
                    .and_then(|l| serde_json::from_str::<Value>(l.trim()).ok())
                    .and_then(|v| v.as_object().cloned())
                {
                    Some(map) if map.contains_key("error") => (map, InvocationStatus::Error),
                    Some(map) => (map, InvocationStatus::Success),
                    None => {
                        // Tool did not speak the results protocol; surface raw output
                        let mut map = JsonMap::new();
                        map.insert(
                            "output".to_string(),
                            Value::String(last_line.unwrap_or_default()),
                        );
                        (map, InvocationStatus::Success)
                    }
                }
            } else {
                (
                    error_results(format!("process exited with status {}", exit)),
                    InvocationStatus::Error,
                )
            }
        }
    };

    // Guarantee the log's final line carries the terminal results object,
    // except when the tool itself already printed exactly that object.
    let tool_printed_results = status == InvocationStatus::Success
        && !results.contains_key("output");
    if !tool_printed_results {
        append_results_line(&prepared.log_path, &results).await;
    }

    let mut record = record.finish(status, results.clone());
    record.log_path = Some(prepared.log_path.clone());
    write_invocation_record(&prepared, &record).await;

    (results, status)
}

#[async_trait]
impl Tool for SubprocessTool {
    fn document(&self) -> &ToolDocument {
        &self.document
    }

    async fn run(&self, args: JsonMap, ctx: &InvocationContext) -> JsonMap {
        let prepared = match prepare(ctx, &self.document.tool_name) {
            Ok(p) => p,
            Err(e) => return error_results(e.to_string()),
        };
        let (results, _status) = execute(self.spec(), args, ctx.clone(), prepared).await;
        results
    }

    fn run_streaming(&self, args: JsonMap, ctx: InvocationContext) -> RunStream {
        let spec = self.spec();
        let poll = self.poll_interval;
        let (tx, rx) = tokio::sync::mpsc::channel::<RunUpdate>(16);

        tokio::spawn(async move {
            let prepared = match prepare(&ctx, &spec.tool_name) {
                Ok(p) => p,
                Err(e) => {
                    let results = error_results(e.to_string());
                    let _ = tx
                        .send(RunUpdate::Done {
                            log: String::new(),
                            results,
                            status: InvocationStatus::Error,
                        })
                        .await;
                    return;
                }
            };

            let log_path = prepared.log_path.clone();
            let mut run = tokio::spawn(execute(spec, args, ctx, prepared));
            let mut interval = tokio::time::interval(poll);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the initial
            // snapshot is not an empty log.
            interval.tick().await;

            loop {
                tokio::select! {
                    joined = &mut run => {
                        let (results, status) = joined.unwrap_or_else(|e| {
                            (error_results(format!("tool task failed: {}", e)),
                             InvocationStatus::Error)
                        });
                        let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
                        let _ = tx.send(RunUpdate::Done { log, results, status }).await;
                        break;
                    }
                    _ = interval.tick() => {
                        let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
                        if tx.send(RunUpdate::LogTail { log }).await.is_err() {
                            // Consumer went away; keep running to completion
                        }
                    }
                }
            }
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|update| (update, rx))
        }))
    }

    async fn cancel(&self, ctx: &InvocationContext) {
        let pgids = {
            let mut state = lock_state(&self.state);
            state.cancelled.insert(ctx.output_root.clone());
            state.running.remove(&ctx.output_root).unwrap_or_default()
        };
        for pgid in pgids {
            warn!(tool = %self.document.tool_name, pgid, "Cancelling in-flight tool process");
            kill_process_group(pgid);
        }
    }
}
