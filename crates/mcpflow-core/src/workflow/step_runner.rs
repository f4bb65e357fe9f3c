//! The per-step primitive shared by every execution strategy.
//!
//! A step is first admitted (enabled, conditions hold), then run: parameters
//! are resolved against the context, a fresh tool job is started for each
//! attempt, and the wait on each job is bounded by the step timeout. Tool
//! failures and timeouts are retried `retry_count` times, `retry_delay`
//! seconds apart. Every outcome lands in the context; nothing is returned as
//! an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mcpflow_types::event::WorkflowEvent;
use mcpflow_types::execution::{StepExecutionRecord, StepStatus};
use mcpflow_types::tool::{ToolExecutionStatus, ToolRequest};
use mcpflow_types::workflow::WorkflowStep;
use serde_json::{Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;
use crate::tool::ToolExecutionService;

use super::context::ExecutionContext;
use super::expression::ConditionSet;
use super::mapping::StepParameters;

/// Error recorded for a step whose conditions do not hold.
pub const CONDITIONS_NOT_MET: &str = "Step conditions not met";

// ---------------------------------------------------------------------------
// PreparedStep
// ---------------------------------------------------------------------------

/// A step with its conditions and parameter recipe compiled for one run.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub step: WorkflowStep,
    conditions: ConditionSet,
    parameters: StepParameters,
}

impl PreparedStep {
    pub fn new(step: &WorkflowStep) -> Self {
        Self {
            conditions: ConditionSet::compile(step),
            parameters: StepParameters::compile(step),
            step: step.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.step.id
    }
}

/// Whether a step may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Run,
    /// Disabled, or optional with conditions that do not hold.
    Skipped,
    /// Required step whose conditions do not hold; already recorded as failed.
    Rejected,
}

/// Why one attempt did not complete.
#[derive(Debug)]
struct AttemptFailure {
    message: String,
    retryable: bool,
}

impl AttemptFailure {
    fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Runs single steps against the tool service.
pub struct StepRunner<R, T> {
    repository: Arc<R>,
    tools: Arc<T>,
    events: EventBus,
    poll_interval: Duration,
}

impl<R, T> StepRunner<R, T>
where
    R: WorkflowRepository,
    T: ToolExecutionService,
{
    pub fn new(repository: Arc<R>, tools: Arc<T>, events: EventBus, poll_interval: Duration) -> Self {
        Self {
            repository,
            tools,
            events,
            poll_interval,
        }
    }

    /// Check `enabled` and the step conditions, recording skips and
    /// condition failures in the context.
    pub fn admit(&self, ctx: &ExecutionContext, prepared: &PreparedStep) -> Admission {
        let step = &prepared.step;
        let execution_id = ctx.execution_id();

        if !step.enabled {
            tracing::debug!(%execution_id, step_id = step.id.as_str(), "step disabled, skipping");
            ctx.mark_skipped(&step.id);
            self.events.publish(WorkflowEvent::StepSkipped {
                execution_id,
                step_id: step.id.clone(),
            });
            return Admission::Skipped;
        }

        if ctx.evaluate_conditions(&prepared.conditions) {
            return Admission::Run;
        }

        if step.optional {
            tracing::debug!(%execution_id, step_id = step.id.as_str(), "conditions false, skipping optional step");
            ctx.mark_skipped(&step.id);
            self.events.publish(WorkflowEvent::StepSkipped {
                execution_id,
                step_id: step.id.clone(),
            });
            Admission::Skipped
        } else {
            tracing::info!(%execution_id, step_id = step.id.as_str(), "conditions false, failing required step");
            ctx.mark_failed_unstarted(&step.id, Some(CONDITIONS_NOT_MET));
            self.events.publish(WorkflowEvent::StepFailed {
                execution_id,
                step_id: step.id.clone(),
                error: CONDITIONS_NOT_MET.to_string(),
                will_retry: false,
            });
            Admission::Rejected
        }
    }

    /// Run an admitted step to completion. Returns whether it succeeded.
    pub async fn run(&self, ctx: &ExecutionContext, prepared: &PreparedStep) -> bool {
        let step = &prepared.step;
        let execution_id = ctx.execution_id();

        ctx.mark_running(&step.id);
        self.events.publish(WorkflowEvent::StepStarted {
            execution_id,
            step_id: step.id.clone(),
            tool_id: step.tool_id.clone(),
        });
        tracing::info!(%execution_id, step_id = step.id.as_str(), tool_id = step.tool_id.as_str(), "executing step");

        let parameters = ctx.resolve_parameters(&prepared.parameters);
        let mut record = StepExecutionRecord {
            id: Uuid::now_v7(),
            execution_id,
            step_id: step.id.clone(),
            tool_id: step.tool_id.clone(),
            status: StepStatus::Running,
            parameters: parameters.clone(),
            result: None,
            error_message: None,
            start_time: Some(Utc::now()),
            end_time: None,
            execution_time: None,
            retry_count: 0,
        };
        self.persist_record(&record).await;

        let started = Instant::now();
        let attempts = u32::try_from(step.retry_count).unwrap_or(0).saturating_add(1);
        let retry_delay = Duration::from_secs(u64::try_from(step.retry_delay).unwrap_or(0));
        let mut last_error = String::from("Step was not attempted");

        for attempt in 1..=attempts {
            if attempt > 1 {
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => false,
                    _ = ctx.cancel_token().cancelled() => true,
                };
                if cancelled {
                    tracing::debug!(%execution_id, step_id = step.id.as_str(), "run cancelled, no further attempts");
                    break;
                }
            }
            record.retry_count = attempt - 1;

            match self.attempt(ctx, step, parameters.clone(), attempt).await {
                Ok(result) => {
                    let elapsed = started.elapsed();
                    ctx.record_success(&step.id, result.clone());
                    self.events.publish(WorkflowEvent::StepCompleted {
                        execution_id,
                        step_id: step.id.clone(),
                        duration_ms: elapsed.as_millis() as u64,
                    });
                    tracing::info!(%execution_id, step_id = step.id.as_str(), attempt, "step completed");

                    record.status = StepStatus::Completed;
                    record.result = Some(result);
                    self.finish_record(&mut record, elapsed).await;
                    return true;
                }
                Err(failure) => {
                    let will_retry =
                        failure.retryable && attempt < attempts && !ctx.is_cancelled();
                    tracing::warn!(
                        %execution_id,
                        step_id = step.id.as_str(),
                        attempt,
                        max_attempts = attempts,
                        will_retry,
                        error = failure.message.as_str(),
                        "step attempt failed"
                    );
                    self.events.publish(WorkflowEvent::StepFailed {
                        execution_id,
                        step_id: step.id.clone(),
                        error: failure.message.clone(),
                        will_retry,
                    });
                    last_error = failure.message;
                    if !will_retry {
                        break;
                    }
                }
            }
        }

        ctx.record_failure(&step.id, &last_error);
        record.status = StepStatus::Failed;
        record.error_message = Some(last_error);
        self.finish_record(&mut record, started.elapsed()).await;
        false
    }

    /// One tool job: start, wait with the step timeout, interpret.
    async fn attempt(
        &self,
        ctx: &ExecutionContext,
        step: &WorkflowStep,
        parameters: Map<String, Value>,
        attempt: u32,
    ) -> Result<Value, AttemptFailure> {
        let timeout_secs = u64::try_from(step.timeout).unwrap_or(0);
        let request = ToolRequest {
            tool_id: step.tool_id.clone(),
            parameters,
            user_id: ctx.executed_by().to_string(),
            timeout_secs,
            workflow_id: Some(ctx.definition().id),
            parent_execution_id: Some(ctx.execution_id()),
        };

        let job = self
            .tools
            .execute_tool(request)
            .await
            .map_err(|e| AttemptFailure::fatal(format!("Failed to start tool execution: {e}")))?;
        tracing::debug!(
            execution_id = %ctx.execution_id(),
            step_id = step.id.as_str(),
            tool_execution_id = %job.id,
            attempt,
            "tool job started"
        );

        ctx.attach_tool_job(&step.id, job.id);
        let waited = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.tools.wait_for_completion(job.id, self.poll_interval),
        )
        .await;
        ctx.detach_tool_job(&step.id);

        let finished = match waited {
            Ok(Ok(finished)) => finished,
            Ok(Err(e)) => return Err(AttemptFailure::fatal(format!("Tool service error: {e}"))),
            Err(_) => {
                if let Err(e) = self.tools.cancel_execution(&job.id).await {
                    tracing::warn!(tool_execution_id = %job.id, error = %e, "failed to cancel timed out tool job");
                }
                return Err(AttemptFailure::retryable(format!(
                    "Step timed out after {timeout_secs}s"
                )));
            }
        };

        match finished.status {
            ToolExecutionStatus::Completed => Ok(finished.result.unwrap_or(Value::Null)),
            ToolExecutionStatus::Failed => Err(AttemptFailure::retryable(
                finished
                    .error_message
                    .unwrap_or_else(|| "Tool execution failed".to_string()),
            )),
            ToolExecutionStatus::Timeout => Err(AttemptFailure::retryable(
                finished
                    .error_message
                    .unwrap_or_else(|| "Tool execution timed out".to_string()),
            )),
            ToolExecutionStatus::Cancelled => Err(AttemptFailure::fatal(
                finished
                    .error_message
                    .unwrap_or_else(|| "Tool execution was cancelled".to_string()),
            )),
            ToolExecutionStatus::Pending | ToolExecutionStatus::Running => {
                Err(AttemptFailure::fatal("Unexpected execution status"))
            }
        }
    }

    /// Cancel the tool job of a step whose task was dropped mid-attempt.
    pub async fn cancel_tool_job(&self, ctx: &ExecutionContext, step_id: &str) {
        let Some(job_id) = ctx.take_tool_job(step_id) else {
            return;
        };
        match self.tools.cancel_execution(&job_id).await {
            Ok(cancelled) => {
                tracing::debug!(execution_id = %ctx.execution_id(), step_id, tool_execution_id = %job_id, cancelled, "abandoned tool job cancelled");
            }
            Err(e) => {
                tracing::warn!(execution_id = %ctx.execution_id(), step_id, tool_execution_id = %job_id, error = %e, "failed to cancel abandoned tool job");
            }
        }
    }

    async fn finish_record(&self, record: &mut StepExecutionRecord, elapsed: Duration) {
        record.end_time = Some(Utc::now());
        record.execution_time = Some(elapsed.as_secs_f64());
        self.persist_record(record).await;
    }

    async fn persist_record(&self, record: &StepExecutionRecord) {
        if let Err(e) = self.repository.save_step_execution(record).await {
            tracing::warn!(
                execution_id = %record.execution_id,
                step_id = record.step_id.as_str(),
                error = %e,
                "failed to persist step execution"
            );
        }
    }
}
