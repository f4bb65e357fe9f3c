//! Business logic for mcpflow.
//!
//! Validation, dependency analysis, condition and parameter evaluation, and
//! the workflow executor, written against the repository and tool-service
//! ports defined here. The core crate never depends on a storage engine or
//! on how tools are actually launched.

pub mod event;
pub mod repository;
pub mod tool;
pub mod workflow;
