//! Tool execution port.
//!
//! Workflow steps delegate their actual work to an external tool service. The
//! executor only needs an opaque job interface: submit, look up, cancel, and
//! wait for a terminal status. Infrastructure provides the real service.

use std::time::Duration;

use mcpflow_types::tool::{ToolExecution, ToolRequest};
use uuid::Uuid;

/// Errors surfaced by a tool service.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// No tool is registered under this ID.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The tool could not be started.
    #[error("failed to launch tool: {0}")]
    Launch(String),

    /// The job ID is not known to the service.
    #[error("tool execution not found: {0}")]
    NotFound(Uuid),

    #[error("tool service error: {0}")]
    Internal(String),
}

/// Asynchronous job interface to the tool execution service.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait ToolExecutionService: Send + Sync {
    /// Submit a tool invocation and return its handle immediately.
    fn execute_tool(
        &self,
        request: ToolRequest,
    ) -> impl std::future::Future<Output = Result<ToolExecution, ToolError>> + Send;

    /// Current snapshot of a job, or `None` if the ID is unknown.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ToolExecution>, ToolError>> + Send;

    /// Request cancellation. Returns `false` if the job is unknown or finished.
    fn cancel_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, ToolError>> + Send;

    /// Resolve once the job reaches a terminal status.
    ///
    /// The provided implementation polls `get_execution` every
    /// `poll_interval`. Services that can signal completion should override
    /// it. Callers bound the wait with their own timeout.
    fn wait_for_completion(
        &self,
        id: Uuid,
        poll_interval: Duration,
    ) -> impl std::future::Future<Output = Result<ToolExecution, ToolError>> + Send {
        async move {
            loop {
                match self.get_execution(&id).await? {
                    Some(execution) if execution.status.is_terminal() => return Ok(execution),
                    Some(_) => tokio::time::sleep(poll_interval).await,
                    None => return Err(ToolError::NotFound(id)),
                }
            }
        }
    }
}
