//! Orchestration algorithms, one per executable `ExecutionMode`.
//!
//! All strategies drive the same `StepRunner` and only differ in which steps
//! they start and when. They never return errors: outcomes are recorded in
//! the `ExecutionContext`, which the executor turns into the final status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcpflow_types::execution::StepStatus;
use mcpflow_types::workflow::{ErrorHandling, ExecutionMode, WorkflowDefinition};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::repository::workflow::WorkflowRepository;
use crate::tool::ToolExecutionService;

use super::context::ExecutionContext;
use super::definition::WorkflowError;
use super::graph::{parallel_groups, DependencyGraph};
use super::step_runner::{Admission, PreparedStep, StepRunner};

// ---------------------------------------------------------------------------
// RunPlan
// ---------------------------------------------------------------------------

/// Every step of a definition, compiled once for a run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    steps: HashMap<String, Arc<PreparedStep>>,
}

impl RunPlan {
    pub fn new(def: &WorkflowDefinition) -> Self {
        Self {
            steps: def
                .steps
                .iter()
                .map(|s| (s.id.clone(), Arc::new(PreparedStep::new(s))))
                .collect(),
        }
    }

    pub fn get(&self, step_id: &str) -> Option<&Arc<PreparedStep>> {
        self.steps.get(step_id)
    }
}

// ---------------------------------------------------------------------------
// ExecutionStrategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// One step at a time in topological order.
    Sequential,
    /// Parallel groups one after another, steps of a group concurrently.
    Parallel,
    /// Repeatedly run the frontier of steps whose predecessors completed.
    Conditional,
}

impl ExecutionStrategy {
    pub fn for_mode(mode: ExecutionMode) -> Result<Self, WorkflowError> {
        match mode {
            ExecutionMode::Sequential => Ok(Self::Sequential),
            ExecutionMode::Parallel => Ok(Self::Parallel),
            ExecutionMode::Conditional => Ok(Self::Conditional),
            ExecutionMode::Loop => Err(WorkflowError::UnsupportedExecutionMode(mode.to_string())),
        }
    }

    pub async fn run<R, T>(
        self,
        runner: &Arc<StepRunner<R, T>>,
        ctx: &Arc<ExecutionContext>,
        plan: &RunPlan,
    ) where
        R: WorkflowRepository + 'static,
        T: ToolExecutionService + 'static,
    {
        match self {
            Self::Sequential => run_sequential(runner, ctx, plan).await,
            Self::Parallel => run_parallel(runner, ctx, plan).await,
            Self::Conditional => run_conditional(runner, ctx, plan).await,
        }
    }
}

/// Halt the run if the workflow stops on errors.
fn note_failure(ctx: &ExecutionContext) {
    if ctx.definition().error_handling == ErrorHandling::Stop {
        ctx.halt();
    }
}

/// Admit and run one step. Skipped steps count as success.
async fn run_one<R, T>(runner: &StepRunner<R, T>, ctx: &ExecutionContext, step: &PreparedStep) -> bool
where
    R: WorkflowRepository,
    T: ToolExecutionService,
{
    match runner.admit(ctx, step) {
        Admission::Run => runner.run(ctx, step).await,
        Admission::Skipped => true,
        Admission::Rejected => false,
    }
}

// ---------------------------------------------------------------------------
// Sequential
// ---------------------------------------------------------------------------

async fn run_sequential<R, T>(runner: &Arc<StepRunner<R, T>>, ctx: &Arc<ExecutionContext>, plan: &RunPlan)
where
    R: WorkflowRepository,
    T: ToolExecutionService,
{
    let definition = Arc::clone(ctx.definition());
    let order = DependencyGraph::new(&definition).topological_order();

    for step_id in order {
        if ctx.should_stop() {
            tracing::debug!(execution_id = %ctx.execution_id(), "sequential run stopping");
            break;
        }
        let Some(step) = plan.get(step_id) else {
            continue;
        };
        if !run_one(runner, ctx, step).await {
            note_failure(ctx);
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

async fn run_parallel<R, T>(runner: &Arc<StepRunner<R, T>>, ctx: &Arc<ExecutionContext>, plan: &RunPlan)
where
    R: WorkflowRepository + 'static,
    T: ToolExecutionService + 'static,
{
    let definition = Arc::clone(ctx.definition());
    let stop_on_error = definition.error_handling == ErrorHandling::Stop;
    let max_parallel = usize::try_from(definition.max_parallel_steps)
        .unwrap_or(1)
        .max(1);
    let group_timeout = Duration::from_secs(u64::try_from(definition.max_execution_time).unwrap_or(0));
    let limit = Arc::new(Semaphore::new(max_parallel));

    for (group_index, group) in parallel_groups(&definition.steps).into_iter().enumerate() {
        if ctx.should_stop() {
            tracing::debug!(execution_id = %ctx.execution_id(), group_index, "parallel run stopping");
            break;
        }
        tracing::debug!(execution_id = %ctx.execution_id(), group_index, steps = group.len(), "starting parallel group");

        // Cancelled by the run token, or by a failure under stop handling.
        let group_stop = ctx.cancel_token().child_token();
        let mut join_set = JoinSet::new();
        let mut launched = Vec::new();

        for step in group {
            let Some(prepared) = plan.get(&step.id) else {
                continue;
            };
            match runner.admit(ctx, prepared) {
                Admission::Run => {}
                Admission::Skipped => continue,
                Admission::Rejected => {
                    note_failure(ctx);
                    continue;
                }
            }

            launched.push(step.id.clone());
            let runner = Arc::clone(runner);
            let ctx = Arc::clone(ctx);
            let prepared = Arc::clone(prepared);
            let limit = Arc::clone(&limit);
            let group_stop = group_stop.clone();

            join_set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = group_stop.cancelled() => return None,
                    permit = limit.acquire_owned() => permit.ok()?,
                };
                if group_stop.is_cancelled() {
                    return None;
                }
                let succeeded = runner.run(&ctx, &prepared).await;
                if !succeeded && stop_on_error {
                    group_stop.cancel();
                }
                Some(succeeded)
            });
        }

        let drained = tokio::time::timeout(group_timeout, async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Some(false)) => note_failure(ctx),
                    Ok(_) => {}
                    Err(e) => tracing::error!(execution_id = %ctx.execution_id(), error = %e, "parallel step task failed"),
                }
            }
        })
        .await;

        if drained.is_err() {
            join_set.abort_all();
            tracing::warn!(
                execution_id = %ctx.execution_id(),
                group_index,
                timeout_secs = group_timeout.as_secs(),
                "parallel group timed out"
            );
            let reason = format!("Step timed out after {}s waiting for its parallel group", group_timeout.as_secs());
            for step_id in &launched {
                runner.cancel_tool_job(ctx, step_id).await;
                if !ctx.status_of(step_id).is_finished() {
                    ctx.mark_failed_unstarted(step_id, Some(&reason));
                }
            }
            note_failure(ctx);
        } else {
            // A task that died mid-step leaves its step running.
            for step_id in &launched {
                if ctx.status_of(step_id) == StepStatus::Running {
                    ctx.mark_failed_unstarted(step_id, Some("Step task terminated unexpectedly"));
                    note_failure(ctx);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Conditional
// ---------------------------------------------------------------------------

async fn run_conditional<R, T>(runner: &Arc<StepRunner<R, T>>, ctx: &Arc<ExecutionContext>, plan: &RunPlan)
where
    R: WorkflowRepository,
    T: ToolExecutionService,
{
    // Every ready step leaves `pending` below, so the frontier shrinks.
    loop {
        if ctx.should_stop() {
            break;
        }
        let ready = ctx.ready_steps();
        if ready.is_empty() {
            break;
        }
        tracing::debug!(execution_id = %ctx.execution_id(), ready = ?ready, "conditional frontier");

        for step_id in ready {
            if ctx.should_stop() {
                break;
            }
            let Some(step) = plan.get(&step_id) else {
                ctx.mark_skipped(&step_id);
                continue;
            };
            if !run_one(runner, ctx, step).await {
                note_failure(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::bus::EventBus;
    use crate::workflow::test_support::{MemoryRepository, Script, ScriptedTools};
    use mcpflow_types::workflow::{
        Condition, ConditionOperator, ConnectionType, WorkflowConnection, WorkflowStep,
    };
    use serde_json::json;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn run_parts(
        def: WorkflowDefinition,
        tools: ScriptedTools,
    ) -> (Arc<StepRunner<MemoryRepository, ScriptedTools>>, Arc<ExecutionContext>, RunPlan, Arc<ScriptedTools>) {
        let tools = Arc::new(tools);
        let runner = Arc::new(StepRunner::new(
            Arc::new(MemoryRepository::default()),
            Arc::clone(&tools),
            EventBus::new(64),
            Duration::from_millis(50),
        ));
        let plan = RunPlan::new(&def);
        let ctx = Arc::new(ExecutionContext::new(
            Arc::new(def),
            Uuid::now_v7(),
            "tester",
            &Default::default(),
        ));
        (runner, ctx, plan, tools)
    }

    fn chain(mode: ExecutionMode) -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("chain");
        def.execution_mode = mode;
        def.steps = vec![
            WorkflowStep::new("save", "Save", "db"),
            WorkflowStep::new("transform", "Transform", "jq"),
            WorkflowStep::new("fetch", "Fetch", "http"),
        ];
        def.connections = vec![
            WorkflowConnection::new("c1", "fetch", "transform", ConnectionType::Data),
            WorkflowConnection::new("c2", "transform", "save", ConnectionType::Data),
        ];
        def
    }

    fn chain_tools() -> ScriptedTools {
        ScriptedTools::default()
            .with("http", Script::succeed(json!({"body": "x"})))
            .with("jq", Script::succeed(json!({})))
            .with("db", Script::succeed(json!({})))
    }

    #[test]
    fn loop_mode_is_unsupported() {
        assert!(matches!(
            ExecutionStrategy::for_mode(ExecutionMode::Loop),
            Err(WorkflowError::UnsupportedExecutionMode(_))
        ));
        assert_eq!(
            ExecutionStrategy::for_mode(ExecutionMode::Parallel).unwrap(),
            ExecutionStrategy::Parallel
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_follows_topological_order() {
        let (runner, ctx, plan, tools) = run_parts(chain(ExecutionMode::Sequential), chain_tools());
        ExecutionStrategy::Sequential.run(&runner, &ctx, &plan).await;
        assert_eq!(tools.finished(), vec!["http", "jq", "db"]);
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_runs_frontiers_in_dependency_order() {
        let (runner, ctx, plan, tools) = run_parts(chain(ExecutionMode::Conditional), chain_tools());
        ExecutionStrategy::Conditional.run(&runner, &ctx, &plan).await;
        assert_eq!(tools.finished(), vec!["http", "jq", "db"]);
        assert!(!ctx.has_failures());
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_terminates_with_disabled_step() {
        let mut def = chain(ExecutionMode::Conditional);
        def.steps[1].enabled = false;
        let (runner, ctx, plan, tools) = run_parts(def, chain_tools());

        ExecutionStrategy::Conditional.run(&runner, &ctx, &plan).await;
        assert_eq!(tools.finished(), vec!["http"]);
        assert_eq!(ctx.status_of("transform"), StepStatus::Skipped);
        assert_eq!(ctx.status_of("save"), StepStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn continue_handling_runs_past_failures() {
        let mut def = chain(ExecutionMode::Sequential);
        def.error_handling = ErrorHandling::Continue;
        let tools = chain_tools().with("jq", Script::fail("bad input"));
        let (runner, ctx, plan, _) = run_parts(def, tools);

        ExecutionStrategy::Sequential.run(&runner, &ctx, &plan).await;
        assert_eq!(ctx.status_of("transform"), StepStatus::Failed);
        assert_eq!(ctx.status_of("save"), StepStatus::Completed);
        assert!(!ctx.is_halted());
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_group_runs_concurrently() {
        let mut def = WorkflowDefinition::new("fan-out");
        def.execution_mode = ExecutionMode::Parallel;
        for id in ["a", "b", "c"] {
            let mut step = WorkflowStep::new(id, id, id);
            step.parallel_group = Some("g1".to_string());
            def.steps.push(step);
        }
        let tools = ScriptedTools::default()
            .with("a", Script::succeed(json!({})).after(Duration::from_secs(1)))
            .with("b", Script::succeed(json!({})).after(Duration::from_secs(2)))
            .with("c", Script::succeed(json!({})).after(Duration::from_secs(1)));
        let (runner, ctx, plan, _) = run_parts(def, tools);

        let started = Instant::now();
        ExecutionStrategy::Parallel.run(&runner, &ctx, &plan).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_respects_max_parallel_steps() {
        let mut def = WorkflowDefinition::new("throttled");
        def.execution_mode = ExecutionMode::Parallel;
        def.max_parallel_steps = 1;
        for id in ["a", "b"] {
            let mut step = WorkflowStep::new(id, id, "work");
            step.parallel_group = Some("g".to_string());
            def.steps.push(step);
        }
        let tools = ScriptedTools::default()
            .with("work", Script::succeed(json!({})).after(Duration::from_secs(1)));
        let (runner, ctx, plan, _) = run_parts(def, tools);

        let started = Instant::now();
        ExecutionStrategy::Parallel.run(&runner, &ctx, &plan).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_stop_halts_later_groups_and_unstarted_steps() {
        let mut def = WorkflowDefinition::new("stop");
        def.execution_mode = ExecutionMode::Parallel;
        def.max_parallel_steps = 1;
        let mut bad = WorkflowStep::new("bad", "Bad", "bad");
        bad.parallel_group = Some("g1".to_string());
        let mut queued = WorkflowStep::new("queued", "Queued", "ok");
        queued.parallel_group = Some("g1".to_string());
        let later = WorkflowStep::new("later", "Later", "ok");
        def.steps = vec![bad, queued, later];
        let tools = ScriptedTools::default()
            .with("bad", Script::fail("boom"))
            .with("ok", Script::succeed(json!({})));
        let (runner, ctx, plan, tools) = run_parts(def, tools);

        ExecutionStrategy::Parallel.run(&runner, &ctx, &plan).await;
        assert_eq!(ctx.status_of("bad"), StepStatus::Failed);
        assert_eq!(ctx.status_of("queued"), StepStatus::Pending);
        assert_eq!(ctx.status_of("later"), StepStatus::Pending);
        assert_eq!(tools.attempts("ok"), 0);
        assert!(ctx.is_halted());
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_group_wait_is_bounded() {
        let mut def = WorkflowDefinition::new("bounded");
        def.execution_mode = ExecutionMode::Parallel;
        def.max_execution_time = 5;
        def.error_handling = ErrorHandling::Continue;
        let mut stuck = WorkflowStep::new("stuck", "Stuck", "hang");
        stuck.timeout = 60;
        stuck.parallel_group = Some("g".to_string());
        let mut quick = WorkflowStep::new("quick", "Quick", "ok");
        quick.parallel_group = Some("g".to_string());
        def.steps = vec![stuck, quick];
        let tools = ScriptedTools::default()
            .with("hang", Script::hang())
            .with("ok", Script::succeed(json!({})));
        let (runner, ctx, plan, tools) = run_parts(def, tools);

        let started = Instant::now();
        ExecutionStrategy::Parallel.run(&runner, &ctx, &plan).await;
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(ctx.status_of("quick"), StepStatus::Completed);
        assert_eq!(ctx.status_of("stuck"), StepStatus::Failed);
        let error = &ctx.snapshot().step_results["stuck"]["error"];
        assert!(error.as_str().unwrap().contains("timed out"));
        // The abandoned step's tool job is cancelled, the finished one is not.
        assert_eq!(tools.cancelled_jobs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn required_step_with_false_condition_stops_sequential_run() {
        let mut def = chain(ExecutionMode::Sequential);
        def.steps[1].conditions = vec![Condition::new("fetch.body", ConditionOperator::Equals, "y")];
        let (runner, ctx, plan, tools) = run_parts(def, chain_tools());

        ExecutionStrategy::Sequential.run(&runner, &ctx, &plan).await;
        assert_eq!(ctx.status_of("transform"), StepStatus::Failed);
        assert_eq!(ctx.status_of("save"), StepStatus::Pending);
        assert_eq!(tools.attempts("jq"), 0);
    }
}
