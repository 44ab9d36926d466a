//! Log domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A structured log entry from job execution
///
/// Serialized with short keys since thousands of these end up in a single
/// job row's log array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "lvl")]
    pub level: LogLevel,
    pub phase: String,
    #[serde(rename = "msg")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            phase: phase.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(rename = "WARN")]
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase tags attached to job log entries
pub mod phase {
    pub const SETUP: &str = "SETUP";
    pub const JOB_CLAIM: &str = "JOB_CLAIM";
    pub const COMPILATION: &str = "COMPILATION";
    pub const SUBPROCESS_EXEC: &str = "SUBPROCESS_EXEC";
    pub const SUBPROCESS_ERROR: &str = "SUBPROCESS_ERROR";
    pub const SCRIPT_STDOUT: &str = "SCRIPT_STDOUT";
    pub const SCRIPT_STDERR: &str = "SCRIPT_STDERR";
    pub const SCRIPT_LOG: &str = "SCRIPT_LOG";
    pub const SCRIPT_PROGRESS: &str = "SCRIPT_PROGRESS";
    pub const PHASE_TRANSITION: &str = "PHASE_TRANSITION";
    pub const PROGRESS_UPDATE: &str = "PROGRESS_UPDATE";
    pub const DB_BATCH_SAVE: &str = "DB_BATCH_SAVE";
    pub const DB_INSERT: &str = "DB_INSERT";
    pub const JOB_TIMEOUT: &str = "JOB_TIMEOUT";
    pub const JOB_COMPLETION: &str = "JOB_COMPLETION";
    pub const JOB_PROCESSING: &str = "JOB_PROCESSING";
    pub const JOB_STATUS_UPDATE: &str = "JOB_STATUS_UPDATE";
    pub const CLEANUP: &str = "CLEANUP";
    pub const COMPLETION: &str = "COMPLETION";

    /// Phases whose entries are flushed to the job store immediately
    pub const IMPORTANT: &[&str] = &[JOB_CLAIM, PHASE_TRANSITION, JOB_COMPLETION, COMPLETION];

    pub fn is_important(phase: &str) -> bool {
        IMPORTANT.contains(&phase)
    }
}
