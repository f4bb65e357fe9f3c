//! Workflow event distribution.

pub mod bus;
