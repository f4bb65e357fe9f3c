//! Event types for the workflow event bus.
//!
//! `WorkflowEvent` is broadcast by the executor as runs and steps change
//! state. All variants are Clone + Send + Sync for use with tokio broadcast
//! channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ExecutionStatus;

/// Events emitted while a workflow execution runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run left the queue and started executing steps.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
        workflow_name: String,
        trigger_type: String,
    },

    /// A step started its first attempt.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        tool_id: String,
    },

    /// A step completed successfully.
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    /// A step attempt failed.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    /// A step was skipped (disabled or conditions not met).
    StepSkipped {
        execution_id: Uuid,
        step_id: String,
    },

    /// A run reached its final status.
    ExecutionFinished {
        execution_id: Uuid,
        workflow_id: Uuid,
        status: ExecutionStatus,
        duration_ms: u64,
    },

    /// A run was cancelled by a caller.
    ExecutionCancelled { execution_id: Uuid },
}

impl WorkflowEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::StepSkipped { execution_id, .. }
            | WorkflowEvent::ExecutionFinished { execution_id, .. }
            | WorkflowEvent::ExecutionCancelled { execution_id } => *execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let id = Uuid::now_v7();
        let event = WorkflowEvent::StepSkipped {
            execution_id: id,
            step_id: "notify".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_skipped");
        assert_eq!(json["step_id"], "notify");
        assert_eq!(event.execution_id(), id);
    }
}
