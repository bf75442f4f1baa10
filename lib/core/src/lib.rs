//! Core types shared by the switchyard workflow engine.
//!
//! This crate carries the strongly typed identifiers for workflows, runs
//! and node runs, plus the `rootcause`-backed `Result` alias used at host
//! boundaries.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{NodeRunId, ParseIdError, WorkflowId, WorkflowRunId};
