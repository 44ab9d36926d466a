//! Harvest Core
//!
//! Core types shared by the harvest worker and its tests.
//!
//! This crate contains:
//! - Job types: the claimed unit of work and its partial updates
//! - Log types: structured per-job log entries and their phase tags
//! - Script types: the context bundle handed to a scraper subprocess
//! - Record types: result lines emitted by a scraper subprocess

pub mod domain;
