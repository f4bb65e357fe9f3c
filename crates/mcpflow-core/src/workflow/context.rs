//! Per-execution runtime state.
//!
//! `ExecutionContext` is shared by every task of one run (including the
//! concurrent tasks of a parallel group) and by `cancel_execution`. All
//! mutable state sits behind one lock and is only touched through the
//! operations below, each of which completes under a single acquisition.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mcpflow_types::execution::{StepOutcome, StepStatus};
use mcpflow_types::workflow::WorkflowDefinition;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::expression::{ConditionSet, EvalScope};
use super::mapping::StepParameters;

#[derive(Debug, Default)]
struct ContextState {
    variables: HashMap<String, Value>,
    step_results: HashMap<String, Value>,
    statuses: HashMap<String, StepStatus>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    /// Tool job currently serving each step.
    tool_jobs: HashMap<String, Uuid>,
    halted: bool,
}

/// A consistent copy of the context state.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    pub variables: HashMap<String, Value>,
    pub step_results: HashMap<String, Value>,
    pub step_executions: BTreeMap<String, StepOutcome>,
    /// Failed step IDs in definition order.
    pub failed: Vec<String>,
    pub halted: bool,
}

/// Mutable state of one workflow execution.
#[derive(Debug)]
pub struct ExecutionContext {
    definition: Arc<WorkflowDefinition>,
    execution_id: Uuid,
    executed_by: String,
    cancel: CancellationToken,
    state: Mutex<ContextState>,
}

impl ExecutionContext {
    /// Variables start as the definition's defaults overridden by the inputs.
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        execution_id: Uuid,
        executed_by: impl Into<String>,
        input_parameters: &HashMap<String, Value>,
    ) -> Self {
        let mut variables = definition.variable_defaults();
        variables.extend(input_parameters.iter().map(|(k, v)| (k.clone(), v.clone())));

        let statuses = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();

        Self {
            definition,
            execution_id,
            executed_by: executed_by.into(),
            cancel: CancellationToken::new(),
            state: Mutex::new(ContextState {
                variables,
                statuses,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn executed_by(&self) -> &str {
        &self.executed_by
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop scheduling further steps after a failure under `stop` handling.
    pub fn halt(&self) {
        self.state().halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.state().halted
    }

    /// True once no new step may start.
    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.is_halted()
    }

    // -----------------------------------------------------------------------
    // Step transitions
    // -----------------------------------------------------------------------

    pub fn mark_running(&self, step_id: &str) {
        self.state()
            .statuses
            .insert(step_id.to_string(), StepStatus::Running);
    }

    /// Store the result and expose its fields as `stepId.field` variables.
    pub fn record_success(&self, step_id: &str, result: Value) {
        let mut state = self.state();
        if let Value::Object(fields) = &result {
            for (key, value) in fields {
                state
                    .variables
                    .insert(format!("{step_id}.{key}"), value.clone());
            }
        }
        state.step_results.insert(step_id.to_string(), result);
        state
            .statuses
            .insert(step_id.to_string(), StepStatus::Completed);
        state.completed.insert(step_id.to_string());
    }

    pub fn record_failure(&self, step_id: &str, error: &str) {
        let mut state = self.state();
        state
            .step_results
            .insert(step_id.to_string(), json!({ "error": error }));
        state.statuses.insert(step_id.to_string(), StepStatus::Failed);
        state.failed.insert(step_id.to_string());
    }

    pub fn mark_skipped(&self, step_id: &str) {
        self.state()
            .statuses
            .insert(step_id.to_string(), StepStatus::Skipped);
    }

    /// Fail a step that never reached the tool (conditions, group timeout).
    pub fn mark_failed_unstarted(&self, step_id: &str, reason: Option<&str>) {
        let mut state = self.state();
        if let Some(reason) = reason {
            state
                .step_results
                .insert(step_id.to_string(), json!({ "error": reason }));
        }
        state.statuses.insert(step_id.to_string(), StepStatus::Failed);
        state.failed.insert(step_id.to_string());
    }

    pub fn status_of(&self, step_id: &str) -> StepStatus {
        self.state()
            .statuses
            .get(step_id)
            .copied()
            .unwrap_or_default()
    }

    /// Pending steps whose data/control predecessors have all completed,
    /// in definition order.
    pub fn ready_steps(&self) -> Vec<String> {
        let state = self.state();
        self.definition
            .steps
            .iter()
            .filter(|step| {
                state.statuses.get(&step.id).copied().unwrap_or_default() == StepStatus::Pending
                    && !state.completed.contains(&step.id)
                    && !state.failed.contains(&step.id)
                    && self
                        .definition
                        .dependencies(&step.id)
                        .iter()
                        .all(|dep| state.completed.contains(*dep))
            })
            .map(|step| step.id.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Reads under the lock
    // -----------------------------------------------------------------------

    pub fn evaluate_conditions(&self, conditions: &ConditionSet) -> bool {
        if conditions.is_empty() {
            return true;
        }
        let state = self.state();
        conditions.evaluate(&EvalScope {
            variables: &state.variables,
            step_results: &state.step_results,
        })
    }

    pub fn resolve_parameters(&self, parameters: &StepParameters) -> Map<String, Value> {
        let state = self.state();
        parameters.resolve(&state.step_results, &state.variables)
    }

    // -----------------------------------------------------------------------
    // Tool jobs
    // -----------------------------------------------------------------------

    pub fn attach_tool_job(&self, step_id: &str, job_id: Uuid) {
        self.state().tool_jobs.insert(step_id.to_string(), job_id);
    }

    pub fn detach_tool_job(&self, step_id: &str) {
        self.state().tool_jobs.remove(step_id);
    }

    /// Remove and return the job a step was waiting on, if any.
    pub fn take_tool_job(&self, step_id: &str) -> Option<Uuid> {
        self.state().tool_jobs.remove(step_id)
    }

    pub fn has_failures(&self) -> bool {
        !self.state().failed.is_empty()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.state();
        let step_executions = self
            .definition
            .steps
            .iter()
            .map(|step| {
                let outcome = StepOutcome {
                    status: state.statuses.get(&step.id).copied().unwrap_or_default(),
                    result: state.step_results.get(&step.id).cloned(),
                };
                (step.id.clone(), outcome)
            })
            .collect();
        let failed = self
            .definition
            .steps
            .iter()
            .filter(|s| state.failed.contains(&s.id))
            .map(|s| s.id.clone())
            .collect();

        ContextSnapshot {
            variables: state.variables.clone(),
            step_results: state.step_results.clone(),
            step_executions,
            failed,
            halted: state.halted,
        }
    }
}
