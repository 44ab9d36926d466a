//! Harvest Worker
//!
//! A long-running worker that claims scraper jobs from a shared Postgres job
//! store, compiles each job's script in an isolated workspace, runs the
//! artifact as a supervised subprocess and records results, logs and the
//! final status.
//!
//! Architecture:
//! - Configuration: settings from environment variables with defaults
//! - Repositories: job store, tenant catalog and result store access
//! - Services: compilation, subprocess supervision, output classification,
//!   result persistence, log batching and memory governance
//! - Scheduler: job polling, per-job lifecycle and health reporting

pub mod config;
pub mod db;
pub mod repository;
pub mod scheduler;
pub mod service;
