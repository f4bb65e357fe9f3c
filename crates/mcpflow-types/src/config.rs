//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a default so an empty or partial file is valid.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.mcpflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite file name, relative to the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Root of the JSON backup mirror. Defaults to the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,

    /// Mirror workflows and templates to JSON files on every save.
    #[serde(default = "default_true")]
    pub backups_enabled: bool,

    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Commands backing each tool ID, used by the process tool service.
    #[serde(default)]
    pub tools: HashMap<String, ToolCommandConfig>,
}

fn default_database_file() -> String {
    "mcpflow.db".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
            backup_dir: None,
            backups_enabled: true,
            executor: ExecutorConfig::default(),
            tools: HashMap::new(),
        }
    }
}

/// Executor pool sizing and polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Workflow runs executing at once; further runs wait in `pending`.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Poll interval for tool services that cannot signal completion.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Capacity of the workflow event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_concurrent_runs() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_event_capacity() -> usize {
    256
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            poll_interval_ms: default_poll_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// How to launch one tool as a child process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCommandConfig {
    /// Program followed by its arguments.
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.database_file, "mcpflow.db");
        assert!(config.backups_enabled);
        assert!(config.backup_dir.is_none());
        assert_eq!(config.executor.max_concurrent_runs, 10);
        assert_eq!(config.executor.poll_interval_ms, 1000);
        assert!(config.tools.is_empty());
    }

    #[test]
    fn test_engine_config_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
backups_enabled = false

[executor]
max_concurrent_runs = 2

[tools.word-count]
command = ["wc", "-w"]
"#,
        )
        .unwrap();

        assert!(!config.backups_enabled);
        assert_eq!(config.executor.max_concurrent_runs, 2);
        assert_eq!(config.executor.poll_interval_ms, 1000);
        assert_eq!(config.tools["word-count"].command, vec!["wc", "-w"]);
        assert!(config.tools["word-count"].env.is_empty());
    }
}
