//! In-memory repository and scripted tool service for engine tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use mcpflow_types::error::RepositoryError;
use mcpflow_types::execution::{StepExecutionRecord, WorkflowExecution};
use mcpflow_types::template::WorkflowTemplate;
use mcpflow_types::tool::{ToolExecution, ToolExecutionStatus, ToolRequest};
use mcpflow_types::workflow::WorkflowDefinition;
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::{WorkflowFilter, WorkflowRepository};
use crate::tool::{ToolError, ToolExecutionService};

// ---------------------------------------------------------------------------
// MemoryRepository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MemoryRepository {
    pub definitions: DashMap<Uuid, WorkflowDefinition>,
    pub executions: DashMap<Uuid, WorkflowExecution>,
    pub steps: DashMap<Uuid, StepExecutionRecord>,
    pub templates: DashMap<Uuid, WorkflowTemplate>,
    /// Status of every execution save, in order.
    pub execution_saves: Mutex<Vec<(Uuid, String)>>,
}

impl WorkflowRepository for MemoryRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.get(id).map(|d| d.clone()))
    }

    async fn list_definitions(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<_> = self
            .definitions
            .iter()
            .filter(|d| filter.matches(d.value()))
            .map(|d| d.clone())
            .collect();
        defs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(defs)
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        self.executions.retain(|_, e| e.workflow_id != *id);
        Ok(self.definitions.remove(id).is_some())
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        self.executions.insert(execution.id, execution.clone());
        if let Ok(mut saves) = self.execution_saves.lock() {
            saves.push((execution.id, execution.status.to_string()));
        }
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut execs: Vec<_> = self
            .executions
            .iter()
            .filter(|e| workflow_id.is_none_or(|id| e.workflow_id == *id))
            .map(|e| e.clone())
            .collect();
        execs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        execs.truncate(limit as usize);
        Ok(execs)
    }

    async fn count_executions_by_status(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> Result<BTreeMap<String, u64>, RepositoryError> {
        let mut counts = BTreeMap::new();
        for e in self.executions.iter() {
            if workflow_id.is_none_or(|id| e.workflow_id == *id) {
                *counts.entry(e.status.to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn average_execution_time(&self, workflow_id: Option<&Uuid>) -> Result<f64, RepositoryError> {
        let times: Vec<f64> = self
            .executions
            .iter()
            .filter(|e| workflow_id.is_none_or(|id| e.workflow_id == *id))
            .filter_map(|e| e.execution_time)
            .collect();
        if times.is_empty() {
            return Ok(0.0);
        }
        Ok(times.iter().sum::<f64>() / times.len() as f64)
    }

    async fn save_step_execution(&self, record: &StepExecutionRecord) -> Result<(), RepositoryError> {
        self.steps.insert(record.id, record.clone());
        Ok(())
    }

    async fn list_step_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<StepExecutionRecord>, RepositoryError> {
        let mut rows: Vec<_> = self
            .steps
            .iter()
            .filter(|r| r.execution_id == *execution_id)
            .map(|r| r.clone())
            .collect();
        rows.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn save_template(&self, template: &WorkflowTemplate) -> Result<(), RepositoryError> {
        self.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: &Uuid) -> Result<Option<WorkflowTemplate>, RepositoryError> {
        Ok(self.templates.get(id).map(|t| t.clone()))
    }

    async fn list_templates(&self, category: Option<&str>) -> Result<Vec<WorkflowTemplate>, RepositoryError> {
        let mut templates: Vec<_> = self
            .templates
            .iter()
            .filter(|t| category.is_none_or(|c| t.category == c))
            .map(|t| t.clone())
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn delete_template(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.templates.remove(id).is_some())
    }
}

// ---------------------------------------------------------------------------
// ScriptedTools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Outcome {
    Succeed(Value),
    Fail(String),
    /// Fail the first `n` attempts, then succeed.
    FailTimes(u32, Value),
    Cancelled,
    Hang,
}

/// What a scripted tool does for every job.
#[derive(Debug, Clone)]
pub(crate) struct Script {
    delay: Duration,
    outcome: Outcome,
}

impl Script {
    fn new(outcome: Outcome) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome,
        }
    }

    pub fn succeed(result: Value) -> Self {
        Self::new(Outcome::Succeed(result))
    }

    pub fn fail(message: &str) -> Self {
        Self::new(Outcome::Fail(message.to_string()))
    }

    pub fn fail_times(n: u32, result: Value) -> Self {
        Self::new(Outcome::FailTimes(n, result))
    }

    pub fn cancelled() -> Self {
        Self::new(Outcome::Cancelled)
    }

    pub fn hang() -> Self {
        Self::new(Outcome::Hang)
    }

    /// Take `delay` of (virtual) time before finishing.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Tool service whose tools follow fixed scripts.
#[derive(Default)]
pub(crate) struct ScriptedTools {
    scripts: HashMap<String, Script>,
    /// job id -> (tool id, 1-based attempt number)
    jobs: DashMap<Uuid, (String, u32)>,
    attempts: DashMap<String, u32>,
    cancelled: AtomicUsize,
    requests: Mutex<Vec<ToolRequest>>,
    finished: Mutex<Vec<String>>,
}

impl ScriptedTools {
    pub fn with(mut self, tool_id: &str, script: Script) -> Self {
        self.scripts.insert(tool_id.to_string(), script);
        self
    }

    pub fn attempts(&self, tool_id: &str) -> u32 {
        self.attempts.get(tool_id).map(|n| *n).unwrap_or(0)
    }

    pub fn cancelled_jobs(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ToolRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Tool IDs in the order their jobs finished.
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl ToolExecutionService for ScriptedTools {
    async fn execute_tool(&self, request: ToolRequest) -> Result<ToolExecution, ToolError> {
        if !self.scripts.contains_key(&request.tool_id) {
            return Err(ToolError::UnknownTool(request.tool_id));
        }
        let attempt = {
            let mut n = self.attempts.entry(request.tool_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let mut job = ToolExecution::submitted(request.tool_id.clone());
        job.status = ToolExecutionStatus::Running;
        self.jobs.insert(job.id, (request.tool_id.clone(), attempt));
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        Ok(job)
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ToolExecution>, ToolError> {
        Ok(self.jobs.get(id).map(|job| {
            let mut snapshot = ToolExecution::submitted(job.0.clone());
            snapshot.id = *id;
            snapshot.status = ToolExecutionStatus::Running;
            snapshot
        }))
    }

    async fn cancel_execution(&self, id: &Uuid) -> Result<bool, ToolError> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(self.jobs.contains_key(id))
    }

    async fn wait_for_completion(
        &self,
        id: Uuid,
        _poll_interval: Duration,
    ) -> Result<ToolExecution, ToolError> {
        let (tool_id, attempt) = self
            .jobs
            .get(&id)
            .map(|job| job.clone())
            .ok_or(ToolError::NotFound(id))?;
        let script = self
            .scripts
            .get(&tool_id)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(tool_id.clone()))?;

        tokio::time::sleep(script.delay).await;

        let mut job = ToolExecution::submitted(tool_id.clone());
        job.id = id;
        match script.outcome {
            Outcome::Succeed(result) => {
                job.status = ToolExecutionStatus::Completed;
                job.result = Some(result);
            }
            Outcome::FailTimes(n, result) if attempt > n => {
                job.status = ToolExecutionStatus::Completed;
                job.result = Some(result);
            }
            Outcome::Fail(message) => {
                job.status = ToolExecutionStatus::Failed;
                job.error_message = Some(message);
            }
            Outcome::FailTimes(..) => {
                job.status = ToolExecutionStatus::Failed;
                job.error_message = Some(format!("attempt {attempt} failed"));
            }
            Outcome::Cancelled => job.status = ToolExecutionStatus::Cancelled,
            Outcome::Hang => return std::future::pending().await,
        }
        job.finished_at = Some(Utc::now());
        if let Ok(mut finished) = self.finished.lock() {
            finished.push(tool_id);
        }
        Ok(job)
    }
}
