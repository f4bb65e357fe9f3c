//! Infrastructure layer for mcpflow.
//!
//! Implementations of the ports defined in `mcpflow-core`: SQLite storage for
//! the workflow repository, a JSON file mirror for definitions and templates,
//! a subprocess-backed tool service, and the `config.toml` loader.

pub mod backup;
pub mod config;
pub mod sqlite;
pub mod tool;
