//! Tool job types shared between the executor and tool services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ToolExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            ToolExecutionStatus::Pending | ToolExecutionStatus::Running
        )
    }
}

/// A request to run one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool_id: String,
    pub parameters: serde_json::Map<String, Value>,
    pub user_id: String,
    pub timeout_secs: u64,
    pub workflow_id: Option<Uuid>,
    /// The workflow execution the tool runs on behalf of.
    pub parent_execution_id: Option<Uuid>,
}

/// Snapshot of a tool invocation, returned as a handle on submission and
/// refreshed by polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolExecution {
    pub id: Uuid,
    pub tool_id: String,
    pub status: ToolExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolExecution {
    /// A freshly submitted job.
    pub fn submitted(tool_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            tool_id: tool_id.into(),
            status: ToolExecutionStatus::Pending,
            result: None,
            error_message: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}
