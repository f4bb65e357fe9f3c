//! Shared domain types for mcpflow.
//!
//! Workflow definitions, executions, templates, tool job snapshots, events,
//! configuration and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod template;
pub mod tool;
pub mod workflow;
