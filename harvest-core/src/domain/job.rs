//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum stored length of a job's short error message
pub const MAX_ERROR_MESSAGE_LEN: usize = 1000;

/// Maximum stored length of a job's structured error detail
pub const MAX_ERROR_DETAILS_LEN: usize = 4000;

/// A scraper run as stored in the job store
///
/// Created externally in `Pending` state, claimed by a worker, then finalized
/// exactly once with a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scraper_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_test_run: bool,
    pub is_validation_run: bool,
    /// Competitor this run scrapes, if bound to one
    pub competitor_id: Option<Uuid>,
    pub product_count: i64,
    pub execution_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub current_phase: Option<i32>,
    pub current_batch: Option<i32>,
    pub total_batches: Option<i32>,
}

impl Job {
    /// Test and validation runs are diagnostic and tolerate script errors
    pub fn is_diagnostic(&self) -> bool {
        self.is_test_run || self.is_validation_run
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs never change status again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Scraper definition referenced by a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperDefinition {
    pub id: Uuid,
    pub scraper_type: String,
    /// Script source text; absent when the scraper was never given one
    pub script: Option<String>,
    pub filter_by_active_brands: bool,
    pub scrape_only_own_products: bool,
}

/// Partial update of a job row
///
/// Only fields that are `Some` are written. Error texts are truncated to their
/// stored limits when set through the builder methods.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub product_count: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub products_per_second: Option<f64>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub current_phase: Option<i32>,
    pub current_batch: Option<i32>,
    pub total_batches: Option<i32>,
}

impl JobUpdate {
    /// A terminal update stamping `completed_at`
    pub fn finished(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Shorthand for a terminal failure with a message
    pub fn failed(message: impl AsRef<str>) -> Self {
        Self::finished(JobStatus::Failed).error_message(message)
    }

    pub fn error_message(mut self, message: impl AsRef<str>) -> Self {
        self.error_message = Some(truncate_chars(message.as_ref(), MAX_ERROR_MESSAGE_LEN));
        self
    }

    pub fn error_details(mut self, details: impl AsRef<str>) -> Self {
        self.error_details = Some(truncate_chars(details.as_ref(), MAX_ERROR_DETAILS_LEN));
        self
    }

    pub fn product_count(mut self, count: i64) -> Self {
        self.product_count = Some(count);
        self
    }

    pub fn progress(mut self, phase: Option<i32>, current_batch: i32, total_batches: i32) -> Self {
        if phase.is_some() {
            self.current_phase = phase;
        }
        self.current_batch = Some(current_batch);
        self.total_batches = Some(total_batches);
        self
    }

    /// Records run duration and derived throughput
    pub fn timing(mut self, execution_time_ms: i64, product_count: i64) -> Self {
        self.execution_time_ms = Some(execution_time_ms);
        self.products_per_second = Some(if execution_time_ms > 0 {
            product_count as f64 / (execution_time_ms as f64 / 1000.0)
        } else {
            0.0
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Truncates to at most `max` characters without splitting a code point
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
