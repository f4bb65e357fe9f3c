//! Logging and trace export setup for mcpflow binaries.

pub mod tracing_setup;
