//! JSON file mirror of workflow definitions and templates.
//!
//! Layout under the backup root:
//!
//! ```text
//! workflows/{id}.json
//! templates/workflows/{id}.json
//! ```
//!
//! Files are pretty-printed and written through a temporary file plus rename,
//! so a crash never leaves a truncated backup behind.

use std::io;
use std::path::{Path, PathBuf};

use mcpflow_core::workflow::store::WorkflowBackup;
use mcpflow_types::template::WorkflowTemplate;
use mcpflow_types::workflow::WorkflowDefinition;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// Filesystem-backed [`WorkflowBackup`].
#[derive(Debug, Clone)]
pub struct JsonFileBackup {
    workflows_dir: PathBuf,
    templates_dir: PathBuf,
}

impl JsonFileBackup {
    pub fn new(root: &Path) -> Self {
        Self {
            workflows_dir: root.join("workflows"),
            templates_dir: root.join("templates").join("workflows"),
        }
    }

    pub fn workflows_dir(&self) -> &Path {
        &self.workflows_dir
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }
}

fn write_json<T: Serialize>(dir: &Path, id: &Uuid, value: &T) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    let path = dir.join(format!("{id}.json"));
    let tmp = dir.join(format!(".{id}.json.tmp"));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &path)
}

fn remove_json(dir: &Path, id: &Uuid) -> io::Result<()> {
    match std::fs::remove_file(dir.join(format!("{id}.json"))) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Every `*.json` file in `dir` that parses; others are skipped with a warning.
fn read_all<T: DeserializeOwned>(dir: &Path) -> io::Result<Vec<T>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut items = Vec::with_capacity(paths.len());
    for path in paths {
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()));
        match parsed {
            Ok(item) => items.push(item),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable backup file"),
        }
    }
    Ok(items)
}

impl WorkflowBackup for JsonFileBackup {
    fn write_workflow(&self, def: &WorkflowDefinition) -> io::Result<()> {
        write_json(&self.workflows_dir, &def.id, def)
    }

    fn remove_workflow(&self, id: &Uuid) -> io::Result<()> {
        remove_json(&self.workflows_dir, id)
    }

    fn write_template(&self, template: &WorkflowTemplate) -> io::Result<()> {
        write_json(&self.templates_dir, &template.id, template)
    }

    fn remove_template(&self, id: &Uuid) -> io::Result<()> {
        remove_json(&self.templates_dir, id)
    }

    fn read_workflows(&self) -> io::Result<Vec<WorkflowDefinition>> {
        read_all(&self.workflows_dir)
    }

    fn read_templates(&self) -> io::Result<Vec<WorkflowTemplate>> {
        read_all(&self.templates_dir)
    }
}
