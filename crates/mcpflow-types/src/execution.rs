//! Execution tracking types.
//!
//! A `WorkflowExecution` is one run of a workflow definition. It moves through
//! `pending -> active -> {completed | failed | cancelled}` and never leaves a
//! terminal status. `StepExecutionRecord` rows capture the per-step detail of
//! a run for auditing.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses are sticky.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Active => "active",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// One concrete run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Definition version at the time the run was requested.
    pub workflow_version: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub input_parameters: HashMap<String, Value>,
    /// Variable defaults overridden by the input parameters.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Step results keyed by step ID, filled in when the run finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    /// Final status and result of every step.
    #[serde(default)]
    pub step_executions: BTreeMap<String, StepOutcome>,
    #[serde(default)]
    pub executed_by: String,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: String,
    /// Reserved for nested runs; never set by the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

fn default_trigger_type() -> String {
    "manual".to_string()
}

impl WorkflowExecution {
    /// Create a pending execution for the given workflow version.
    pub fn pending(
        workflow_id: Uuid,
        workflow_version: impl Into<String>,
        input_parameters: HashMap<String, Value>,
        executed_by: impl Into<String>,
        trigger_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_version: workflow_version.into(),
            status: ExecutionStatus::Pending,
            input_parameters,
            variables: HashMap::new(),
            result: None,
            error_message: None,
            start_time: None,
            end_time: None,
            execution_time: None,
            step_executions: BTreeMap::new(),
            executed_by: executed_by.into(),
            trigger_type: trigger_type.into(),
            parent_execution_id: None,
            created_at: Utc::now(),
        }
    }

    /// Move to `to` unless the execution is already terminal.
    ///
    /// Returns `false` (and leaves the status untouched) when the current
    /// status is terminal.
    pub fn transition(&mut self, to: ExecutionStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = to;
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Final state of one step as recorded on the execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutcome {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

// ---------------------------------------------------------------------------
// StepExecutionRecord
// ---------------------------------------------------------------------------

/// Persisted detail of one step of one execution, across all its attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepExecutionRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub tool_id: String,
    pub status: StepStatus,
    /// Parameters after mapping and substitution.
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    /// Attempts beyond the first.
    #[serde(default)]
    pub retry_count: u32,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Execution counts and timings across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub total_executions: u64,
    /// Runs currently tracked in memory by the executor.
    pub active_executions: usize,
    pub status_counts: BTreeMap<String, u64>,
    pub average_execution_time: f64,
    /// Most recent executions, newest first.
    pub recent: Vec<WorkflowExecution>,
}

/// Summary across all stored workflow definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total_workflows: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub category_counts: BTreeMap<String, usize>,
    pub total_executions: i64,
    pub total_successes: i64,
    /// Successes over executions, 0.0 when nothing has run.
    pub success_rate: f64,
    /// Run duration averaged over every recorded execution.
    pub average_execution_time: f64,
}
