//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions, step
//! execution records and templates. The infrastructure layer (mcpflow-infra)
//! implements this trait with SQLite persistence.

use std::collections::BTreeMap;

use mcpflow_types::error::RepositoryError;
use mcpflow_types::execution::{StepExecutionRecord, WorkflowExecution};
use mcpflow_types::template::WorkflowTemplate;
use mcpflow_types::workflow::{WorkflowDefinition, WorkflowStatus};
use uuid::Uuid;

/// Equality filters for listing workflow definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub category: Option<String>,
    pub created_by: Option<String>,
}

impl WorkflowFilter {
    /// Whether a definition passes every set filter.
    pub fn matches(&self, def: &WorkflowDefinition) -> bool {
        self.status.is_none_or(|s| def.status == s)
            && self.category.as_deref().is_none_or(|c| def.category == c)
            && self
                .created_by
                .as_deref()
                .is_none_or(|by| def.created_by == by)
    }
}

/// Repository trait for workflow persistence.
///
/// Covers four entity families:
/// - **Definitions:** CRUD for workflow definitions, including statistics.
/// - **Executions:** Upsert/query workflow runs.
/// - **Step executions:** Upsert/query per-step records of a run.
/// - **Templates:** CRUD for reusable workflow templates.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List definitions matching the filter, most recently updated first.
    fn list_definitions(
        &self,
        filter: &WorkflowFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a definition (and its executions). Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Upsert an execution record.
    fn save_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// List executions, newest first, optionally for one workflow.
    fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Count executions per status name, optionally for one workflow.
    fn count_executions_by_status(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<BTreeMap<String, u64>, RepositoryError>> + Send;

    /// Average `execution_time` over executions that recorded one.
    fn average_execution_time(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<f64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    /// Upsert a step execution record.
    fn save_step_execution(
        &self,
        record: &StepExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List step records of an execution, ordered by start time.
    fn list_step_executions(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecutionRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    /// Upsert a template.
    fn save_template(
        &self,
        template: &WorkflowTemplate,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a template by its UUID.
    fn get_template(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowTemplate>, RepositoryError>> + Send;

    /// List templates, optionally of one category, ordered by name.
    fn list_templates(
        &self,
        category: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowTemplate>, RepositoryError>> + Send;

    /// Delete a template. Returns `true` if it existed.
    fn delete_template(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
