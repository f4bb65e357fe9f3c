//! Workflow executor: background runs, cancellation, callbacks and statistics.
//!
//! `execute_workflow` persists a pending execution and returns at once; the
//! run itself happens on a spawned task that waits for a slot of the shared
//! run pool, drives the `ExecutionStrategy` for the workflow's mode and then
//! finalizes the execution.
//!
//! # Lifecycle
//!
//! 1. `pending`: persisted, tracked in the active map, queued for a run slot.
//! 2. `active`: start time set and persisted, steps running.
//! 3. `completed` / `failed` / `cancelled`: terminal and sticky. A cancel
//!    persists its snapshot immediately; finalization then leaves the stored
//!    record alone but still updates workflow statistics and fires callbacks.
//!
//! The execution record of an active run sits behind an async lock that is
//! held across each persist, so a cancel and a status change of the
//! background task can never overwrite each other out of order.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use mcpflow_types::config::ExecutorConfig;
use mcpflow_types::error::RepositoryError;
use mcpflow_types::event::WorkflowEvent;
use mcpflow_types::execution::{ExecutionStatistics, ExecutionStatus, WorkflowExecution};
use mcpflow_types::workflow::WorkflowStatus;
use serde_json::Value;
use tokio::sync::{Semaphore, broadcast, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;
use crate::tool::ToolExecutionService;

use super::context::{ContextSnapshot, ExecutionContext};
use super::definition::WorkflowError;
use super::step_runner::StepRunner;
use super::store::WorkflowStore;
use super::strategy::{ExecutionStrategy, RunPlan};

/// Number of executions reported by `get_execution_statistics`.
const RECENT_EXECUTIONS: u32 = 10;

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors from workflow executor entry points.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

/// Invoked once with the terminal execution.
pub type ExecutionCallback = Box<dyn FnOnce(&WorkflowExecution) + Send + 'static>;

// ---------------------------------------------------------------------------
// ActiveRun
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Completion {
    /// Set once finalization has produced the terminal execution.
    finished: Option<WorkflowExecution>,
    callbacks: Vec<ExecutionCallback>,
}

/// In-memory state of a run between `execute_workflow` and finalization.
struct ActiveRun {
    ctx: Arc<ExecutionContext>,
    execution: tokio::sync::Mutex<WorkflowExecution>,
    started: OnceLock<Instant>,
    completion: Mutex<Completion>,
}

impl ActiveRun {
    fn elapsed_secs(&self) -> Option<f64> {
        self.started.get().map(|s| s.elapsed().as_secs_f64())
    }

    fn completion(&self) -> std::sync::MutexGuard<'_, Completion> {
        self.completion.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Copy the context snapshot onto an execution record.
fn apply_snapshot(execution: &mut WorkflowExecution, snapshot: ContextSnapshot) {
    execution.result = Some(snapshot.step_results.into_iter().collect());
    execution.step_executions = snapshot.step_executions;
    execution.variables = snapshot.variables;
}

fn invoke(callback: ExecutionCallback, execution: &WorkflowExecution) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(execution))).is_err() {
        tracing::error!(execution_id = %execution.id, "execution callback panicked");
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

struct ExecutorInner<R, T> {
    store: Arc<WorkflowStore<R>>,
    repository: Arc<R>,
    runner: Arc<StepRunner<R, T>>,
    events: EventBus,
    run_slots: Semaphore,
    active: DashMap<Uuid, Arc<ActiveRun>>,
}

/// Runs workflows from a `WorkflowStore` against a tool service.
///
/// Cheap to clone; clones share the active runs and the run pool.
pub struct WorkflowExecutor<R, T> {
    inner: Arc<ExecutorInner<R, T>>,
}

impl<R, T> Clone for WorkflowExecutor<R, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, T> WorkflowExecutor<R, T>
where
    R: WorkflowRepository + 'static,
    T: ToolExecutionService + 'static,
{
    pub fn new(store: Arc<WorkflowStore<R>>, tools: Arc<T>, config: &ExecutorConfig) -> Self {
        let repository = Arc::clone(store.repository());
        let events = EventBus::new(config.event_capacity);
        let runner = Arc::new(StepRunner::new(
            Arc::clone(&repository),
            tools,
            events.clone(),
            Duration::from_millis(config.poll_interval_ms),
        ));
        Self {
            inner: Arc::new(ExecutorInner {
                store,
                repository,
                runner,
                events,
                run_slots: Semaphore::new(config.max_concurrent_runs.max(1)),
                active: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<WorkflowStore<R>> {
        &self.inner.store
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    /// Start a run of an active workflow in the background.
    ///
    /// Returns the persisted pending execution without waiting for any step.
    pub async fn execute_workflow(
        &self,
        workflow_id: &Uuid,
        input_parameters: HashMap<String, Value>,
        executed_by: &str,
        trigger_type: &str,
    ) -> Result<WorkflowExecution, ExecutorError> {
        let definition = self
            .inner
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound(*workflow_id))?;
        if definition.status != WorkflowStatus::Active {
            return Err(WorkflowError::NotActive {
                id: definition.id,
                status: definition.status,
            }
            .into());
        }

        let mut execution = WorkflowExecution::pending(
            definition.id,
            definition.version.clone(),
            input_parameters,
            executed_by,
            trigger_type,
        );
        let ctx = Arc::new(ExecutionContext::new(
            Arc::new(definition),
            execution.id,
            executed_by,
            &execution.input_parameters,
        ));
        execution.variables = ctx.snapshot().variables;
        self.inner.repository.save_execution(&execution).await?;

        let run = Arc::new(ActiveRun {
            ctx,
            execution: tokio::sync::Mutex::new(execution.clone()),
            started: OnceLock::new(),
            completion: Mutex::new(Completion::default()),
        });
        self.inner.active.insert(execution.id, Arc::clone(&run));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drive(run).await });

        tracing::info!(
            execution_id = %execution.id,
            %workflow_id,
            executed_by,
            trigger_type,
            "workflow execution queued"
        );
        Ok(execution)
    }

    /// Cancel an active run.
    ///
    /// Returns `false` if the execution is not active in this process or is
    /// already terminal. Steps already talking to a tool finish their current
    /// attempt; nothing new is started.
    pub async fn cancel_execution(&self, execution_id: &Uuid) -> Result<bool, ExecutorError> {
        let Some(run) = self.inner.active.get(execution_id).map(|r| Arc::clone(r.value())) else {
            return Ok(false);
        };
        run.ctx.cancel_token().cancel();

        let mut execution = run.execution.lock().await;
        if !execution.transition(ExecutionStatus::Cancelled) {
            return Ok(false);
        }
        execution.end_time = Some(Utc::now());
        execution.execution_time = run.elapsed_secs();
        apply_snapshot(&mut execution, run.ctx.snapshot());
        self.inner.repository.save_execution(&execution).await?;
        drop(execution);

        self.inner.events.publish(WorkflowEvent::ExecutionCancelled {
            execution_id: *execution_id,
        });
        tracing::info!(%execution_id, "workflow execution cancelled");
        Ok(true)
    }

    /// The in-memory execution of an active run, else the stored one.
    pub async fn get_execution(&self, execution_id: &Uuid) -> Result<Option<WorkflowExecution>, ExecutorError> {
        let active = self.inner.active.get(execution_id).map(|r| Arc::clone(r.value()));
        if let Some(run) = active {
            return Ok(Some(run.execution.lock().await.clone()));
        }
        Ok(self.inner.repository.get_execution(execution_id).await?)
    }

    /// Executions still tracked in memory, oldest first.
    pub async fn get_active_executions(&self) -> Vec<WorkflowExecution> {
        let runs: Vec<Arc<ActiveRun>> = self.inner.active.iter().map(|r| Arc::clone(r.value())).collect();
        let mut executions = Vec::with_capacity(runs.len());
        for run in runs {
            executions.push(run.execution.lock().await.clone());
        }
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        executions
    }

    /// Counts and timings from the repository, optionally for one workflow.
    pub async fn get_execution_statistics(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> Result<ExecutionStatistics, ExecutorError> {
        let repo = &self.inner.repository;
        let status_counts = repo.count_executions_by_status(workflow_id).await?;
        let average_execution_time = repo.average_execution_time(workflow_id).await?;
        let recent = repo.list_executions(workflow_id, RECENT_EXECUTIONS).await?;
        let active_executions = self
            .inner
            .active
            .iter()
            .filter(|r| workflow_id.is_none_or(|id| r.ctx.definition().id == *id))
            .count();

        Ok(ExecutionStatistics {
            total_executions: status_counts.values().sum(),
            active_executions,
            status_counts,
            average_execution_time,
            recent,
        })
    }

    /// Register a callback for when the execution finishes.
    ///
    /// If the execution already finished, the callback runs immediately with
    /// the terminal execution. Executions that are neither active nor
    /// terminal in the repository (left behind by an earlier process) are
    /// reported as not found.
    pub async fn add_execution_callback<F>(&self, execution_id: &Uuid, callback: F) -> Result<(), ExecutorError>
    where
        F: FnOnce(&WorkflowExecution) + Send + 'static,
    {
        let callback: ExecutionCallback = Box::new(callback);
        let active = self.inner.active.get(execution_id).map(|r| Arc::clone(r.value()));
        if let Some(run) = active {
            let finished = {
                let mut completion = run.completion();
                if completion.finished.is_none() {
                    completion.callbacks.push(callback);
                    return Ok(());
                }
                completion.finished.clone()
            };
            if let Some(execution) = finished {
                invoke(callback, &execution);
            }
            return Ok(());
        }

        match self.inner.repository.get_execution(execution_id).await? {
            Some(execution) if execution.is_terminal() => {
                invoke(callback, &execution);
                Ok(())
            }
            _ => Err(ExecutorError::ExecutionNotFound(*execution_id)),
        }
    }

    /// Resolve with the terminal execution.
    ///
    /// Bound the wait with `tokio::time::timeout` where needed.
    pub async fn wait_for_completion(&self, execution_id: &Uuid) -> Result<WorkflowExecution, ExecutorError> {
        let (tx, rx) = oneshot::channel();
        self.add_execution_callback(execution_id, move |execution| {
            let _ = tx.send(execution.clone());
        })
        .await?;
        rx.await.map_err(|_| ExecutorError::ExecutionNotFound(*execution_id))
    }
}

// ---------------------------------------------------------------------------
// Background run
// ---------------------------------------------------------------------------

impl<R, T> ExecutorInner<R, T>
where
    R: WorkflowRepository + 'static,
    T: ToolExecutionService + 'static,
{
    async fn drive(self: Arc<Self>, run: Arc<ActiveRun>) {
        let outcome = self.run_to_end(&run).await;
        if let Err(e) = &outcome {
            tracing::error!(execution_id = %run.ctx.execution_id(), error = %e, "workflow execution failed");
        }
        self.finalize(&run, outcome).await;
    }

    async fn run_to_end(&self, run: &ActiveRun) -> Result<(), ExecutorError> {
        let ctx = &run.ctx;
        let definition = Arc::clone(ctx.definition());

        let _slot = tokio::select! {
            slot = self.run_slots.acquire() => slot.ok(),
            _ = ctx.cancel_token().cancelled() => return Ok(()),
        };

        let trigger_type = {
            let mut execution = run.execution.lock().await;
            if !execution.transition(ExecutionStatus::Active) {
                return Ok(());
            }
            let _ = run.started.set(Instant::now());
            execution.start_time = Some(Utc::now());
            self.repository.save_execution(&execution).await?;
            execution.trigger_type.clone()
        };

        self.events.publish(WorkflowEvent::ExecutionStarted {
            execution_id: ctx.execution_id(),
            workflow_id: definition.id,
            workflow_name: definition.name.clone(),
            trigger_type,
        });
        tracing::info!(
            execution_id = %ctx.execution_id(),
            workflow = definition.name.as_str(),
            mode = %definition.execution_mode,
            steps = definition.steps.len(),
            "executing workflow"
        );

        let strategy = ExecutionStrategy::for_mode(definition.execution_mode)?;
        let plan = RunPlan::new(&definition);
        strategy.run(&self.runner, ctx, &plan).await;
        Ok(())
    }

    async fn finalize(&self, run: &ActiveRun, outcome: Result<(), ExecutorError>) {
        let ctx = &run.ctx;
        let execution_id = ctx.execution_id();
        let workflow_id = ctx.definition().id;
        let finished_at = Utc::now();
        let snapshot = ctx.snapshot();

        let execution = {
            let mut execution = run.execution.lock().await;
            if !execution.is_terminal() {
                let (status, error) = match &outcome {
                    Err(e) => (ExecutionStatus::Failed, Some(e.to_string())),
                    Ok(()) if ctx.is_cancelled() => (ExecutionStatus::Cancelled, None),
                    Ok(()) if !snapshot.failed.is_empty() => (
                        ExecutionStatus::Failed,
                        Some(format!("Failed steps: {}", snapshot.failed.join(", "))),
                    ),
                    Ok(()) => (ExecutionStatus::Completed, None),
                };
                execution.transition(status);
                execution.error_message = error;
                execution.end_time = Some(finished_at);
                execution.execution_time = run.elapsed_secs();
                apply_snapshot(&mut execution, snapshot);
                if let Err(e) = self.repository.save_execution(&execution).await {
                    tracing::error!(%execution_id, error = %e, "failed to persist finished execution");
                }
            } else if execution.status == ExecutionStatus::Cancelled {
                // Steps in flight at cancel time finish their attempt; record where they landed.
                apply_snapshot(&mut execution, snapshot);
                if let Err(e) = self.repository.save_execution(&execution).await {
                    tracing::error!(%execution_id, error = %e, "failed to persist cancelled execution");
                }
            }
            execution.clone()
        };

        let succeeded = execution.status == ExecutionStatus::Completed;
        let duration = execution.execution_time.unwrap_or(0.0);
        if let Err(e) = self
            .store
            .record_execution(&workflow_id, succeeded, duration, execution.end_time.unwrap_or(finished_at))
            .await
        {
            tracing::warn!(%execution_id, %workflow_id, error = %e, "failed to update workflow statistics");
        }

        self.events.publish(WorkflowEvent::ExecutionFinished {
            execution_id,
            workflow_id,
            status: execution.status,
            duration_ms: (duration * 1000.0) as u64,
        });

        let callbacks = {
            let mut completion = run.completion();
            completion.finished = Some(execution.clone());
            std::mem::take(&mut completion.callbacks)
        };
        self.active.remove(&execution_id);
        for callback in callbacks {
            invoke(callback, &execution);
        }

        tracing::info!(
            %execution_id,
            status = %execution.status,
            duration_secs = duration,
            "workflow execution finished"
        );
    }
}
