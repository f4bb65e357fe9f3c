//! Workflow engine core: definitions, validation, scheduling and execution.
//!
//! - `definition` -- JSON parsing, versioning and the `WorkflowError` type
//! - `validator` -- structural validation with accumulated messages
//! - `graph` -- dependency graph, topological order, cycle detection
//! - `expression` -- typed condition operands and evaluation
//! - `mapping` -- step parameter resolution from mappings and variables
//! - `context` -- lock-guarded per-execution state
//! - `step_runner` -- the per-step primitive (retries, timeouts, events)
//! - `strategy` -- sequential, parallel and conditional orchestration
//! - `executor` -- background runs, cancellation, callbacks, statistics
//! - `store` -- cached, persisted and mirrored workflow definitions
//! - `template` -- workflow templates and instantiation

pub mod context;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod mapping;
pub mod step_runner;
pub mod store;
pub mod strategy;
pub mod template;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;
