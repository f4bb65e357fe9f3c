//! Workflow definition errors, JSON loading and versioning.
//!
//! Definitions travel as JSON (CLI import, backup mirror, database blobs).
//! Parsing here is purely structural; `validator::validate_workflow` decides
//! whether a definition may be saved or activated.

use std::path::Path;

use mcpflow_types::error::RepositoryError;
use mcpflow_types::workflow::{WorkflowDefinition, WorkflowStatus};
use serde_json::json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

/// Errors raised by the workflow store and executor entry points.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Structural validation failed; carries every message.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    #[error("workflow template not found: {0}")]
    TemplateNotFound(Uuid),

    /// Only active workflows may be executed.
    #[error("workflow {id} is not active (status: {status})")]
    NotActive { id: Uuid, status: WorkflowStatus },

    #[error("step '{0}' already exists")]
    DuplicateStep(String),

    #[error("connection '{0}' already exists")]
    DuplicateConnection(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("unsupported execution mode: {0}")]
    UnsupportedExecutionMode(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a JSON document into a `WorkflowDefinition`, filling defaults.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Serialize a `WorkflowDefinition` as pretty-printed JSON.
pub fn serialize_workflow_json(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_json::to_string_pretty(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load a workflow definition from a JSON file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_json(&content)
}

// ---------------------------------------------------------------------------
// Versioning
// ---------------------------------------------------------------------------

/// The parts of a definition whose change warrants a new version.
///
/// Identity, status, timestamps and statistics are excluded.
pub fn content_fingerprint(def: &WorkflowDefinition) -> serde_json::Value {
    json!({
        "name": def.name,
        "description": def.description,
        "steps": def.steps,
        "connections": def.connections,
        "variables": def.variables,
        "triggers": def.triggers,
        "execution_mode": def.execution_mode,
        "error_handling": def.error_handling,
        "max_execution_time": def.max_execution_time,
        "max_parallel_steps": def.max_parallel_steps,
        "tags": def.tags,
        "category": def.category,
    })
}

/// Increment the patch component of a semantic version.
///
/// Versions that do not parse as semver are restarted at `1.0.1`.
pub fn bump_patch_version(version: &str) -> String {
    match semver::Version::parse(version) {
        Ok(mut v) => {
            v.patch += 1;
            v.pre = semver::Prerelease::EMPTY;
            v.build = semver::BuildMetadata::EMPTY;
            v.to_string()
        }
        Err(e) => {
            tracing::warn!(version, error = %e, "unparseable workflow version, restarting at 1.0.1");
            "1.0.1".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpflow_types::workflow::WorkflowStep;

    #[test]
    fn parse_minimal_json() {
        let def = parse_workflow_json(
            r#"{"name": "etl", "steps": [{"id": "fetch", "name": "Fetch", "tool_id": "http"}]}"#,
        )
        .unwrap();
        assert_eq!(def.name, "etl");
        assert_eq!(def.steps[0].tool_id, "http");
    }

    #[test]
    fn parse_rejects_malformed_json() {
        let err = parse_workflow_json("{not json").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn load_and_serialize_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.json");
        let mut def = WorkflowDefinition::new("digest");
        def.steps.push(WorkflowStep::new("a", "A", "echo"));
        std::fs::write(&path, serialize_workflow_json(&def).unwrap()).unwrap();

        let loaded = load_workflow_file(&path).unwrap();
        assert_eq!(loaded, def);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_workflow_file(Path::new("/nonexistent/wf.json")).unwrap_err();
        assert!(matches!(err, WorkflowError::IoError(_)));
    }

    #[test]
    fn bump_patch() {
        assert_eq!(bump_patch_version("1.0.0"), "1.0.1");
        assert_eq!(bump_patch_version("2.3.9"), "2.3.10");
        assert_eq!(bump_patch_version("1.0.0-beta"), "1.0.1");
        assert_eq!(bump_patch_version("v1"), "1.0.1");
    }

    #[test]
    fn fingerprint_ignores_stats_and_status() {
        let mut def = WorkflowDefinition::new("digest");
        let before = content_fingerprint(&def);

        def.stats.execution_count = 4;
        def.status = WorkflowStatus::Active;
        assert_eq!(content_fingerprint(&def), before);

        def.steps.push(WorkflowStep::new("a", "A", "echo"));
        assert_ne!(content_fingerprint(&def), before);
    }

    #[test]
    fn validation_error_joins_messages() {
        let err = WorkflowError::Validation(vec![
            "Workflow name is required".to_string(),
            "Workflow must have at least one step".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: Workflow name is required; Workflow must have at least one step"
        );
    }
}
