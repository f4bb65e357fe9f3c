//! Tool execution service implementations.

pub mod process;
