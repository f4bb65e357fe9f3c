//! Reusable workflow templates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{WorkflowDefinition, WorkflowVariable};

/// A parameterized workflow snapshot that new workflows are cloned from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTemplate {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// The embedded definition cloned on instantiation.
    pub workflow_definition: WorkflowDefinition,
    #[serde(default)]
    pub author: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Number of workflows created from this template.
    #[serde(default)]
    pub usage_count: i64,
    /// Parameters a caller is expected to supply when instantiating.
    #[serde(default)]
    pub parameters: Vec<WorkflowVariable>,
    /// Tools or services the template needs.
    #[serde(default)]
    pub requirements: Vec<String>,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowTemplate {
    /// Wrap a definition in a new template, listing its tools as requirements.
    pub fn from_definition(
        definition: WorkflowDefinition,
        name: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        let mut requirements: Vec<String> =
            definition.steps.iter().map(|s| s.tool_id.clone()).collect();
        requirements.sort();
        requirements.dedup();

        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: description.into(),
            category: category.into(),
            tags: definition.tags.clone(),
            parameters: definition.variables.clone(),
            workflow_definition: definition,
            author: author.into(),
            version: default_version(),
            created_at: now,
            updated_at: now,
            usage_count: 0,
            requirements,
        }
    }
}
