//! Core domain types
//!
//! These types describe the job store rows this worker reads and writes and
//! the data exchanged with a scraper subprocess.

pub mod job;
pub mod log;
pub mod record;
pub mod script;
