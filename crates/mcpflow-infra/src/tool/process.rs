//! Child-process tool service.
//!
//! Implements [`ToolExecutionService`] by running each tool as a local
//! command configured under `[tools.<id>]` in `config.toml`. The step's
//! parameters are written to the child's stdin as a JSON object and its
//! stdout is parsed as the result: JSON when possible, otherwise wrapped as
//! `{"output": "<text>"}`.
//!
//! Every job publishes its snapshot through a `tokio::sync::watch` channel,
//! so waiters wake as soon as the child exits instead of polling.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use mcpflow_core::tool::{ToolError, ToolExecutionService};
use mcpflow_types::config::ToolCommandConfig;
use mcpflow_types::tool::{ToolExecution, ToolExecutionStatus, ToolRequest};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Environment variable carrying the tool ID into the child.
pub const TOOL_ID_ENV: &str = "MCP_TOOL_ID";
/// Environment variable carrying the requesting user into the child.
pub const USER_ID_ENV: &str = "MCP_USER_ID";
/// Environment variable carrying the workflow ID, when there is one.
pub const WORKFLOW_ID_ENV: &str = "MCP_WORKFLOW_ID";

/// How long a finished job stays queryable before it is dropped.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(300);

struct Job {
    state: watch::Receiver<ToolExecution>,
    cancel: CancellationToken,
}

/// Runs tools as child processes and tracks them as asynchronous jobs.
pub struct ProcessToolService {
    tools: HashMap<String, ToolCommandConfig>,
    jobs: Arc<DashMap<Uuid, Job>>,
    retention: Duration,
}

impl ProcessToolService {
    /// Create a service for the given tool table.
    pub fn new(tools: HashMap<String, ToolCommandConfig>) -> Self {
        Self {
            tools,
            jobs: Arc::new(DashMap::new()),
            retention: DEFAULT_JOB_RETENTION,
        }
    }

    /// Keep finished jobs for `retention` instead of the default.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Number of jobs currently tracked, running or recently finished.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// IDs of every configured tool, sorted.
    pub fn tool_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    fn spawn_child(&self, request: &ToolRequest) -> Result<Child, ToolError> {
        let config = self
            .tools
            .get(&request.tool_id)
            .ok_or_else(|| ToolError::UnknownTool(request.tool_id.clone()))?;

        let Some((program, args)) = config.command.split_first() else {
            return Err(ToolError::Launch(format!(
                "tool '{}' has an empty command",
                request.tool_id
            )));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&config.env)
            .env(TOOL_ID_ENV, &request.tool_id)
            .env(USER_ID_ENV, &request.user_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(workflow_id) = request.workflow_id {
            command.env(WORKFLOW_ID_ENV, workflow_id.to_string());
        }
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        command
            .spawn()
            .map_err(|e| ToolError::Launch(format!("{program}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Job supervision
// ---------------------------------------------------------------------------

/// How a supervised child stopped.
enum Exit {
    Finished(std::io::Result<ExitStatus>),
    TimedOut(u64),
    Cancelled,
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::debug!("tool pipe read failed: {e}");
        }
    }
    buf
}

/// Interpret tool stdout: a JSON document, or plain text under `output`.
fn parse_output(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if !trimmed.is_empty() => value,
        _ => json!({ "output": trimmed }),
    }
}

async fn supervise(
    mut child: Child,
    input: Vec<u8>,
    timeout_secs: u64,
    cancel: CancellationToken,
    state: watch::Sender<ToolExecution>,
) {
    if let Some(mut stdin) = child.stdin.take() {
        // Closing stdin after the write signals EOF to the tool.
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!("tool stdin write failed: {e}");
            }
        });
    }
    let stdout = tokio::spawn(read_all(child.stdout.take()));
    let stderr = tokio::spawn(read_all(child.stderr.take()));

    let deadline = async {
        if timeout_secs == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        }
    };

    let exit = tokio::select! {
        status = child.wait() => Exit::Finished(status),
        _ = deadline => Exit::TimedOut(timeout_secs),
        _ = cancel.cancelled() => Exit::Cancelled,
    };

    if !matches!(exit, Exit::Finished(_)) {
        if let Err(e) = child.kill().await {
            tracing::warn!("failed to kill tool process: {e}");
        }
    }

    let stdout = stdout.await.unwrap_or_default();
    let stderr = stderr.await.unwrap_or_default();

    state.send_modify(|job| {
        job.finished_at = Some(Utc::now());
        match exit {
            Exit::Finished(Ok(status)) if status.success() => {
                job.status = ToolExecutionStatus::Completed;
                job.result = Some(parse_output(&stdout));
            }
            Exit::Finished(Ok(status)) => {
                let stderr = String::from_utf8_lossy(&stderr);
                let stderr = stderr.trim();
                job.status = ToolExecutionStatus::Failed;
                job.error_message = Some(if stderr.is_empty() {
                    format!("tool exited with {status}")
                } else {
                    stderr.to_string()
                });
            }
            Exit::Finished(Err(e)) => {
                job.status = ToolExecutionStatus::Failed;
                job.error_message = Some(format!("failed to wait for tool process: {e}"));
            }
            Exit::TimedOut(secs) => {
                job.status = ToolExecutionStatus::Timeout;
                job.error_message = Some(format!("Tool timed out after {secs}s"));
            }
            Exit::Cancelled => {
                job.status = ToolExecutionStatus::Cancelled;
                job.error_message = Some("Tool execution cancelled".to_string());
            }
        }
    });

    let job = state.borrow();
    tracing::debug!(job_id = %job.id, tool_id = %job.tool_id, status = ?job.status, "tool job finished");
}

// ---------------------------------------------------------------------------
// ToolExecutionService impl
// ---------------------------------------------------------------------------

impl ToolExecutionService for ProcessToolService {
    async fn execute_tool(&self, request: ToolRequest) -> Result<ToolExecution, ToolError> {
        let input = serde_json::to_vec(&request.parameters)
            .map_err(|e| ToolError::Internal(format!("serialize parameters: {e}")))?;
        let child = self.spawn_child(&request)?;

        let mut job = ToolExecution::submitted(request.tool_id.clone());
        job.status = ToolExecutionStatus::Running;
        let snapshot = job.clone();

        let (tx, rx) = watch::channel(job);
        let cancel = CancellationToken::new();
        self.jobs.insert(
            snapshot.id,
            Job {
                state: rx,
                cancel: cancel.clone(),
            },
        );

        tracing::debug!(
            job_id = %snapshot.id,
            tool_id = %request.tool_id,
            user_id = %request.user_id,
            "tool process started"
        );
        let jobs = Arc::clone(&self.jobs);
        let retention = self.retention;
        let job_id = snapshot.id;
        tokio::spawn(async move {
            supervise(child, input, request.timeout_secs, cancel, tx).await;
            tokio::time::sleep(retention).await;
            jobs.remove(&job_id);
        });

        Ok(snapshot)
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ToolExecution>, ToolError> {
        Ok(self.jobs.get(id).map(|job| job.state.borrow().clone()))
    }

    async fn cancel_execution(&self, id: &Uuid) -> Result<bool, ToolError> {
        let Some(job) = self.jobs.get(id) else {
            return Ok(false);
        };
        if job.state.borrow().status.is_terminal() {
            return Ok(false);
        }
        job.cancel.cancel();
        Ok(true)
    }

    async fn wait_for_completion(
        &self,
        id: Uuid,
        _poll_interval: Duration,
    ) -> Result<ToolExecution, ToolError> {
        let mut state = self
            .jobs
            .get(&id)
            .map(|job| job.state.clone())
            .ok_or(ToolError::NotFound(id))?;

        let finished = match state.wait_for(|job| job.status.is_terminal()).await {
            Ok(job) => job.clone(),
            Err(_) => {
                return Err(ToolError::Internal(format!(
                    "tool job {id} stopped reporting before finishing"
                )));
            }
        };
        Ok(finished)
    }
}
