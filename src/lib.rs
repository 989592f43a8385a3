//! Grading and gradebook engine.
//!
//! Submissions are validated and recorded, graded with late penalties and
//! exclusions, rolled up through weighted categories into one course grade
//! per learner, and a completion signal is handed to a [`signal::CompletionSink`]
//! the first time a course grade becomes complete. The `gradebookd` binary
//! exposes all of it over line-delimited JSON.

pub mod authz;
pub mod calc;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod finalize;
pub mod grading;
pub mod ipc;
pub mod model;
pub mod recompute;
pub mod repo;
pub mod signal;
pub mod submission;

pub use error::{GradebookError, Result};
