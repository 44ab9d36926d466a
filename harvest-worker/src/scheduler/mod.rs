//! Scheduler layer for the worker
//!
//! This layer polls the job store for pending jobs, drives each claimed job
//! from compilation to its final status and reports worker health.

pub mod health;
pub mod poller;

pub use poller::{JobPoller, TickOutcome};
