//! Workflow definition store.
//!
//! The repository is authoritative. The store keeps an in-memory cache of
//! definitions and templates in front of it and, when configured, mirrors
//! every saved definition and template to a `WorkflowBackup` (JSON files).
//! Mirroring is best-effort: failures are logged and never fail a save.
//!
//! Mutations are serialized through one async lock so that the
//! read-modify-write cycles of `add_step` and friends cannot interleave.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mcpflow_types::execution::WorkflowStatistics;
use mcpflow_types::template::WorkflowTemplate;
use mcpflow_types::workflow::{
    WorkflowConnection, WorkflowDefinition, WorkflowStatus, WorkflowStep, generate_id,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::repository::workflow::{WorkflowFilter, WorkflowRepository};

use super::definition::{WorkflowError, bump_patch_version, content_fingerprint};
use super::validator::{ValidationReport, validate_workflow};

// ---------------------------------------------------------------------------
// Backup port
// ---------------------------------------------------------------------------

/// Secondary copy of definitions and templates outside the database.
pub trait WorkflowBackup: Send + Sync {
    fn write_workflow(&self, def: &WorkflowDefinition) -> std::io::Result<()>;

    fn remove_workflow(&self, id: &Uuid) -> std::io::Result<()>;

    fn write_template(&self, template: &WorkflowTemplate) -> std::io::Result<()>;

    fn remove_template(&self, id: &Uuid) -> std::io::Result<()>;

    /// Every readable backed-up definition.
    fn read_workflows(&self) -> std::io::Result<Vec<WorkflowDefinition>>;

    /// Every readable backed-up template.
    fn read_templates(&self) -> std::io::Result<Vec<WorkflowTemplate>>;
}

/// Counts reported by [`WorkflowStore::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub workflows: usize,
    pub templates: usize,
    /// Entries found only in the backup and written to the repository.
    pub imported: usize,
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

pub struct WorkflowStore<R> {
    pub(super) repository: Arc<R>,
    pub(super) workflows: DashMap<Uuid, WorkflowDefinition>,
    pub(super) templates: DashMap<Uuid, WorkflowTemplate>,
    pub(super) backup: Option<Arc<dyn WorkflowBackup>>,
    pub(super) writes: Mutex<()>,
}

impl<R: WorkflowRepository> WorkflowStore<R> {
    pub fn new(repository: Arc<R>, backup: Option<Arc<dyn WorkflowBackup>>) -> Self {
        Self {
            repository,
            workflows: DashMap::new(),
            templates: DashMap::new(),
            backup,
            writes: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// Warm the cache from the repository, then import anything that exists
    /// only in the backup.
    pub async fn load(&self) -> Result<LoadSummary, WorkflowError> {
        let _guard = self.writes.lock().await;
        let mut summary = LoadSummary::default();

        for def in self.repository.list_definitions(&WorkflowFilter::default()).await? {
            self.workflows.insert(def.id, def);
        }
        for template in self.repository.list_templates(None).await? {
            self.templates.insert(template.id, template);
        }

        if let Some(backup) = &self.backup {
            match backup.read_workflows() {
                Ok(defs) => {
                    for def in defs {
                        if self.workflows.contains_key(&def.id) {
                            continue;
                        }
                        tracing::info!(workflow_id = %def.id, name = def.name.as_str(), "importing workflow from backup");
                        self.repository.save_definition(&def).await?;
                        self.workflows.insert(def.id, def);
                        summary.imported += 1;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to read workflow backups"),
            }
            match backup.read_templates() {
                Ok(templates) => {
                    for template in templates {
                        if self.templates.contains_key(&template.id) {
                            continue;
                        }
                        tracing::info!(template_id = %template.id, name = template.name.as_str(), "importing template from backup");
                        self.repository.save_template(&template).await?;
                        self.templates.insert(template.id, template);
                        summary.imported += 1;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to read template backups"),
            }
        }

        summary.workflows = self.workflows.len();
        summary.templates = self.templates.len();
        tracing::info!(
            workflows = summary.workflows,
            templates = summary.templates,
            imported = summary.imported,
            "workflow store loaded"
        );
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Create and persist an empty draft.
    pub async fn create_workflow(
        &self,
        name: &str,
        description: &str,
        created_by: &str,
        category: Option<&str>,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let mut def = WorkflowDefinition::new(name);
        def.description = description.to_string();
        def.created_by = created_by.to_string();
        if let Some(category) = category {
            def.category = category.to_string();
        }
        let def = self.save_workflow(def).await?;
        tracing::info!(workflow_id = %def.id, name, "created workflow");
        Ok(def)
    }

    /// Persist a definition, bumping its patch version if its content changed.
    ///
    /// Returns the definition as stored.
    pub async fn save_workflow(&self, def: WorkflowDefinition) -> Result<WorkflowDefinition, WorkflowError> {
        let _guard = self.writes.lock().await;
        self.save_locked(def).await
    }

    pub(super) async fn save_locked(&self, mut def: WorkflowDefinition) -> Result<WorkflowDefinition, WorkflowError> {
        if def.status != WorkflowStatus::Draft {
            let report = validate_workflow(&def);
            if !report.is_valid() {
                return Err(WorkflowError::Validation(report.errors));
            }
        }

        let previous = self.workflows.get(&def.id).map(|d| content_fingerprint(&d));
        if let Some(previous) = previous {
            if previous != content_fingerprint(&def) {
                let bumped = bump_patch_version(&def.version);
                tracing::debug!(workflow_id = %def.id, from = def.version.as_str(), to = bumped.as_str(), "workflow content changed");
                def.version = bumped;
            }
        }
        def.updated_at = Utc::now();

        self.persist_definition(&def).await?;
        tracing::info!(workflow_id = %def.id, version = def.version.as_str(), "saved workflow");
        Ok(def)
    }

    /// Write to the repository, the cache and the backup mirror.
    async fn persist_definition(&self, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
        self.repository.save_definition(def).await?;
        self.workflows.insert(def.id, def.clone());
        if let Some(backup) = &self.backup {
            if let Err(e) = backup.write_workflow(def) {
                tracing::warn!(workflow_id = %def.id, error = %e, "failed to mirror workflow");
            }
        }
        Ok(())
    }

    /// Cached definition, falling back to the repository.
    pub async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, WorkflowError> {
        if let Some(def) = self.workflows.get(id).map(|d| d.clone()) {
            return Ok(Some(def));
        }
        let found = self.repository.get_definition(id).await?;
        if let Some(def) = &found {
            self.workflows.insert(def.id, def.clone());
        }
        Ok(found)
    }

    pub async fn require_workflow(&self, id: &Uuid) -> Result<WorkflowDefinition, WorkflowError> {
        self.get_workflow(id).await?.ok_or(WorkflowError::NotFound(*id))
    }

    /// Cached definitions matching the filter, most recently updated first.
    pub fn list_workflows(&self, filter: &WorkflowFilter) -> Vec<WorkflowDefinition> {
        let mut defs: Vec<WorkflowDefinition> = self
            .workflows
            .iter()
            .filter(|d| filter.matches(d.value()))
            .map(|d| d.clone())
            .collect();
        defs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        defs
    }

    /// Returns `false` if the workflow was not known.
    pub async fn delete_workflow(&self, id: &Uuid) -> Result<bool, WorkflowError> {
        let _guard = self.writes.lock().await;
        let existed = self.repository.delete_definition(id).await?;
        let cached = self.workflows.remove(id).is_some();
        if let Some(backup) = &self.backup {
            if let Err(e) = backup.remove_workflow(id) {
                tracing::warn!(workflow_id = %id, error = %e, "failed to remove workflow mirror");
            }
        }
        if existed || cached {
            tracing::info!(workflow_id = %id, "deleted workflow");
        }
        Ok(existed || cached)
    }

    pub fn validate_workflow(&self, def: &WorkflowDefinition) -> ValidationReport {
        validate_workflow(def)
    }

    /// Change lifecycle status. Activation requires a valid definition.
    pub async fn set_status(&self, id: &Uuid, status: WorkflowStatus) -> Result<WorkflowDefinition, WorkflowError> {
        let _guard = self.writes.lock().await;
        let mut def = self.require_workflow(id).await?;
        if status == WorkflowStatus::Active {
            let report = validate_workflow(&def);
            if !report.is_valid() {
                return Err(WorkflowError::Validation(report.errors));
            }
        }
        def.status = status;
        let def = self.save_locked(def).await?;
        tracing::info!(workflow_id = %id, %status, "workflow status changed");
        Ok(def)
    }

    /// Append a step; the definition is left untouched if the result is invalid.
    pub async fn add_step(&self, workflow_id: &Uuid, mut step: WorkflowStep) -> Result<WorkflowDefinition, WorkflowError> {
        let _guard = self.writes.lock().await;
        let mut def = self.require_workflow(workflow_id).await?;
        if step.id.is_empty() {
            step.id = generate_id();
        }
        if def.step(&step.id).is_some() {
            return Err(WorkflowError::DuplicateStep(step.id));
        }
        def.steps.push(step);
        let report = validate_workflow(&def);
        if !report.is_valid() {
            return Err(WorkflowError::Validation(report.errors));
        }
        self.save_locked(def).await
    }

    /// Remove a step together with every connection touching it.
    pub async fn remove_step(&self, workflow_id: &Uuid, step_id: &str) -> Result<WorkflowDefinition, WorkflowError> {
        let _guard = self.writes.lock().await;
        let mut def = self.require_workflow(workflow_id).await?;
        let index = def
            .step_index(step_id)
            .ok_or_else(|| WorkflowError::UnknownStep(step_id.to_string()))?;
        def.steps.remove(index);
        def.connections
            .retain(|c| c.source_step_id != step_id && c.target_step_id != step_id);
        self.save_locked(def).await
    }

    /// Add a connection between two existing steps.
    pub async fn add_connection(
        &self,
        workflow_id: &Uuid,
        mut connection: WorkflowConnection,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let _guard = self.writes.lock().await;
        let mut def = self.require_workflow(workflow_id).await?;
        if connection.id.is_empty() {
            connection.id = generate_id();
        }
        if def.connections.iter().any(|c| c.id == connection.id) {
            return Err(WorkflowError::DuplicateConnection(connection.id));
        }
        for endpoint in [&connection.source_step_id, &connection.target_step_id] {
            if def.step(endpoint).is_none() {
                return Err(WorkflowError::UnknownStep(endpoint.clone()));
            }
        }
        def.connections.push(connection);
        let report = validate_workflow(&def);
        if !report.is_valid() {
            return Err(WorkflowError::Validation(report.errors));
        }
        self.save_locked(def).await
    }

    pub async fn remove_connection(
        &self,
        workflow_id: &Uuid,
        connection_id: &str,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let _guard = self.writes.lock().await;
        let mut def = self.require_workflow(workflow_id).await?;
        let before = def.connections.len();
        def.connections.retain(|c| c.id != connection_id);
        if def.connections.len() == before {
            return Err(WorkflowError::UnknownConnection(connection_id.to_string()));
        }
        self.save_locked(def).await
    }

    /// Fold one finished run into the workflow's statistics.
    ///
    /// Statistics are not content: the version and `updated_at` stay as they are.
    pub async fn record_execution(
        &self,
        workflow_id: &Uuid,
        succeeded: bool,
        duration_secs: f64,
        finished_at: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let _guard = self.writes.lock().await;
        let mut def = self.require_workflow(workflow_id).await?;
        def.stats.record(succeeded, duration_secs, finished_at);
        self.persist_definition(&def).await
    }

    /// Aggregate counts over all cached definitions.
    pub fn get_workflow_statistics(&self) -> WorkflowStatistics {
        let mut status_counts = BTreeMap::new();
        let mut category_counts = BTreeMap::new();
        let mut total_executions = 0i64;
        let mut total_successes = 0i64;
        let mut total_time = 0.0f64;

        for def in self.workflows.iter() {
            *status_counts.entry(def.status.to_string()).or_insert(0) += 1;
            *category_counts.entry(def.category.clone()).or_insert(0) += 1;
            total_executions += def.stats.execution_count;
            total_successes += def.stats.success_count;
            total_time += def.stats.average_execution_time * def.stats.execution_count as f64;
        }

        let (success_rate, average_execution_time) = if total_executions > 0 {
            (
                total_successes as f64 / total_executions as f64,
                total_time / total_executions as f64,
            )
        } else {
            (0.0, 0.0)
        };

        WorkflowStatistics {
            total_workflows: self.workflows.len(),
            status_counts,
            category_counts,
            total_executions,
            total_successes,
            success_rate,
            average_execution_time,
        }
    }
}
