//! Workflow templates: reusable definitions that new workflows are stamped from.

use std::collections::HashMap;

use chrono::Utc;
use mcpflow_types::template::WorkflowTemplate;
use mcpflow_types::workflow::{WorkflowDefinition, WorkflowStats, WorkflowStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::definition::WorkflowError;
use super::store::WorkflowStore;

impl<R: WorkflowRepository> WorkflowStore<R> {
    /// Wrap a definition in a new template and persist it.
    pub async fn create_template(
        &self,
        definition: WorkflowDefinition,
        name: &str,
        description: &str,
        category: &str,
        author: &str,
    ) -> Result<WorkflowTemplate, WorkflowError> {
        let template = WorkflowTemplate::from_definition(definition, name, description, category, author);
        let template = self.save_template(template).await?;
        tracing::info!(template_id = %template.id, name, "created workflow template");
        Ok(template)
    }

    pub async fn save_template(&self, template: WorkflowTemplate) -> Result<WorkflowTemplate, WorkflowError> {
        let _guard = self.writes.lock().await;
        self.save_template_locked(template).await
    }

    async fn save_template_locked(&self, mut template: WorkflowTemplate) -> Result<WorkflowTemplate, WorkflowError> {
        template.updated_at = Utc::now();
        self.repository.save_template(&template).await?;
        self.templates.insert(template.id, template.clone());
        if let Some(backup) = &self.backup {
            if let Err(e) = backup.write_template(&template) {
                tracing::warn!(template_id = %template.id, error = %e, "failed to mirror template");
            }
        }
        Ok(template)
    }

    pub async fn get_template(&self, id: &Uuid) -> Result<Option<WorkflowTemplate>, WorkflowError> {
        if let Some(template) = self.templates.get(id).map(|t| t.clone()) {
            return Ok(Some(template));
        }
        let found = self.repository.get_template(id).await?;
        if let Some(template) = &found {
            self.templates.insert(template.id, template.clone());
        }
        Ok(found)
    }

    /// Cached templates, optionally of one category, most recently updated first.
    pub fn list_templates(&self, category: Option<&str>) -> Vec<WorkflowTemplate> {
        let mut templates: Vec<WorkflowTemplate> = self
            .templates
            .iter()
            .filter(|t| category.is_none_or(|c| t.category == c))
            .map(|t| t.clone())
            .collect();
        templates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        templates
    }

    pub async fn delete_template(&self, id: &Uuid) -> Result<bool, WorkflowError> {
        let _guard = self.writes.lock().await;
        let existed = self.repository.delete_template(id).await?;
        let cached = self.templates.remove(id).is_some();
        if let Some(backup) = &self.backup {
            if let Err(e) = backup.remove_template(id) {
                tracing::warn!(template_id = %id, error = %e, "failed to remove template mirror");
            }
        }
        Ok(existed || cached)
    }

    /// Stamp a new draft workflow out of a template.
    ///
    /// `parameters` override the default values of the template's variables;
    /// names the template does not declare are ignored.
    pub async fn create_workflow_from_template(
        &self,
        template_id: &Uuid,
        name: &str,
        parameters: &HashMap<String, Value>,
        created_by: &str,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let _guard = self.writes.lock().await;
        let mut template = self
            .get_template(template_id)
            .await?
            .ok_or(WorkflowError::TemplateNotFound(*template_id))?;

        let now = Utc::now();
        let mut def = template.workflow_definition.clone();
        def.id = Uuid::now_v7();
        def.name = name.to_string();
        def.created_by = created_by.to_string();
        def.created_at = now;
        def.updated_at = now;
        def.status = WorkflowStatus::Draft;
        def.stats = WorkflowStats::default();
        for variable in &mut def.variables {
            if let Some(value) = parameters.get(&variable.name) {
                variable.default_value = Some(value.clone());
            }
        }

        let def = self.save_locked(def).await?;

        template.usage_count += 1;
        self.save_template_locked(template).await?;

        tracing::info!(workflow_id = %def.id, %template_id, name, "created workflow from template");
        Ok(def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_support::MemoryRepository;
    use mcpflow_types::workflow::{WorkflowStep, WorkflowVariable};
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> WorkflowStore<MemoryRepository> {
        WorkflowStore::new(Arc::new(MemoryRepository::default()), None)
    }

    fn report_definition() -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("report");
        def.steps.push(WorkflowStep::new("query", "Query", "sql"));
        def.steps.push(WorkflowStep::new("mail", "Mail", "smtp"));
        def.variables.push(WorkflowVariable::new("recipient", Some(json!("ops@example.com"))));
        def.variables.push(WorkflowVariable::new("limit", Some(json!(10))));
        def.status = WorkflowStatus::Active;
        def.stats.execution_count = 7;
        def
    }

    #[tokio::test]
    async fn instantiation_overrides_variables_and_resets_identity() {
        let store = store();
        let source = report_definition();
        let template = store
            .create_template(source.clone(), "Report", "daily report", "reporting", "alice")
            .await
            .unwrap();
        assert_eq!(template.requirements, vec!["smtp".to_string(), "sql".to_string()]);

        let params = HashMap::from([
            ("recipient".to_string(), json!("me@example.com")),
            ("unknown".to_string(), json!(true)),
        ]);
        let def = store
            .create_workflow_from_template(&template.id, "my report", &params, "bob")
            .await
            .unwrap();

        assert_ne!(def.id, source.id);
        assert_eq!(def.name, "my report");
        assert_eq!(def.created_by, "bob");
        assert_eq!(def.status, WorkflowStatus::Draft);
        assert_eq!(def.stats.execution_count, 0);
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.variables[0].default_value, Some(json!("me@example.com")));
        assert_eq!(def.variables[1].default_value, Some(json!(10)));
        assert!(store.get_workflow(&def.id).await.unwrap().is_some());

        let template = store.get_template(&template.id).await.unwrap().unwrap();
        assert_eq!(template.usage_count, 1);
        // The template's own definition is untouched.
        assert_eq!(template.workflow_definition.name, "report");
    }

    #[tokio::test]
    async fn missing_template_is_an_error() {
        let store = store();
        let missing = Uuid::now_v7();
        let err = store
            .create_workflow_from_template(&missing, "x", &HashMap::new(), "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::TemplateNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn list_by_category_and_delete() {
        let store = store();
        let a = store
            .create_template(report_definition(), "A", "", "reporting", "alice")
            .await
            .unwrap();
        store
            .create_template(report_definition(), "B", "", "ops", "alice")
            .await
            .unwrap();

        assert_eq!(store.list_templates(None).len(), 2);
        let reporting = store.list_templates(Some("reporting"));
        assert_eq!(reporting.len(), 1);
        assert_eq!(reporting[0].id, a.id);

        assert!(store.delete_template(&a.id).await.unwrap());
        assert!(store.get_template(&a.id).await.unwrap().is_none());
        assert!(!store.delete_template(&a.id).await.unwrap());
    }
}
