//! Application state wiring the store, executor and infrastructure together.
//!
//! The core types are generic over the repository and tool service; AppState
//! pins them to the SQLite repository and the child-process tool service.

use std::path::PathBuf;
use std::sync::Arc;

use mcpflow_core::workflow::executor::WorkflowExecutor;
use mcpflow_core::workflow::store::{WorkflowBackup, WorkflowStore};
use mcpflow_infra::backup::JsonFileBackup;
use mcpflow_infra::config::{backup_root, load_engine_config, resolve_data_dir};
use mcpflow_infra::sqlite::pool::{DatabasePool, database_url};
use mcpflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use mcpflow_infra::tool::process::ProcessToolService;
use mcpflow_types::config::EngineConfig;

/// Concrete type aliases for the generics pinned to infra implementations.
pub type ConcreteStore = WorkflowStore<SqliteWorkflowRepository>;

pub type ConcreteExecutor = WorkflowExecutor<SqliteWorkflowRepository, ProcessToolService>;

/// Shared application state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConcreteStore>,
    pub executor: ConcreteExecutor,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub database_url: String,
}

impl AppState {
    /// Connect to the database, warm the store cache and build the executor.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;

        let db_url = database_url(&data_dir.join(&config.database_file));
        let db_pool = DatabasePool::new(&db_url).await?;
        let repository = Arc::new(SqliteWorkflowRepository::new(db_pool));

        let backup: Option<Arc<dyn WorkflowBackup>> = if config.backups_enabled {
            Some(Arc::new(JsonFileBackup::new(&backup_root(&config, &data_dir))))
        } else {
            None
        };

        let store = Arc::new(WorkflowStore::new(repository, backup));
        let summary = store.load().await?;
        tracing::debug!(
            workflows = summary.workflows,
            templates = summary.templates,
            imported = summary.imported,
            "workflow store loaded"
        );

        let tools = Arc::new(ProcessToolService::new(config.tools.clone()));
        let executor = WorkflowExecutor::new(Arc::clone(&store), tools, &config.executor);

        Ok(Self {
            store,
            executor,
            config,
            data_dir,
            database_url: db_url,
        })
    }
}
