//! Jobs repository
//!
//! Handles job store operations for the worker:
//! - Atomically claiming the next pending job
//! - Fetching the scraper definition a job points at
//! - Partial updates of job fields
//! - Reading and writing the job's log array

use anyhow::{Context, Result};
use async_trait::async_trait;
use harvest_core::domain::job::{Job, JobStatus, JobUpdate, ScraperDefinition};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

/// Repository trait for job-related operations against the job store
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Claims the oldest pending job of the given type
    ///
    /// Moves the job to `running` and stamps its start time in one atomic
    /// operation, so two workers racing for the same job never both win.
    async fn claim_next(&self, worker_type: &str) -> Result<Option<Job>>;

    /// Fetches the scraper a job runs
    async fn fetch_scraper(&self, scraper_id: Uuid) -> Result<Option<ScraperDefinition>>;

    /// Applies a partial update to a running job
    ///
    /// Returns `false` when the job is no longer running (already finalized)
    /// or the update is empty.
    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<bool>;

    /// Reads the job's persisted log array
    async fn fetch_logs(&self, job_id: Uuid) -> Result<Vec<Value>>;

    /// Overwrites the job's persisted log array
    async fn replace_logs(&self, job_id: Uuid, logs: Vec<Value>) -> Result<()>;

    /// Appends entries to the log array in a single write, keeping only the
    /// most recent `max_entries`
    async fn append_logs(&self, job_id: Uuid, entries: Vec<Value>, max_entries: usize)
    -> Result<()>;
}

/// Postgres implementation of JobRepository
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn claim_next(&self, worker_type: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE scraper_runs
            SET status = 'running', started_at = now(), claimed_by_worker_at = now(),
                error_message = NULL
            WHERE id = (
                SELECT id FROM scraper_runs
                WHERE status = 'pending' AND scraper_type = $1
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, user_id, scraper_id, status, created_at, started_at, completed_at,
                      is_test_run, is_validation_run, competitor_id, product_count,
                      execution_time_ms, error_message, error_details, current_phase,
                      current_batch, total_batches
            "#,
        )
        .bind(worker_type)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim next job")?;

        Ok(row.map(|r| r.into()))
    }

    async fn fetch_scraper(&self, scraper_id: Uuid) -> Result<Option<ScraperDefinition>> {
        let row = sqlx::query_as::<_, ScraperRow>(
            r#"
            SELECT id, scraper_type, script, filter_by_active_brands, scrape_only_own_products
            FROM scrapers
            WHERE id = $1
            "#,
        )
        .bind(scraper_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch scraper")?;

        Ok(row.map(|r| r.into()))
    }

    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }

        let mut query = QueryBuilder::<Postgres>::new("UPDATE scraper_runs SET ");
        let mut fields = query.separated(", ");

        if let Some(status) = update.status {
            fields.push("status = ").push_bind_unseparated(status.as_str());
        }
        if let Some(completed_at) = update.completed_at {
            fields.push("completed_at = ").push_bind_unseparated(completed_at);
        }
        if let Some(count) = update.product_count {
            fields.push("product_count = ").push_bind_unseparated(count);
        }
        if let Some(ms) = update.execution_time_ms {
            fields.push("execution_time_ms = ").push_bind_unseparated(ms);
        }
        if let Some(pps) = update.products_per_second {
            fields.push("products_per_second = ").push_bind_unseparated(pps);
        }
        if let Some(message) = update.error_message {
            fields.push("error_message = ").push_bind_unseparated(message);
        }
        if let Some(details) = update.error_details {
            fields.push("error_details = ").push_bind_unseparated(details);
        }
        if let Some(phase) = update.current_phase {
            fields.push("current_phase = ").push_bind_unseparated(phase);
        }
        if let Some(batch) = update.current_batch {
            fields.push("current_batch = ").push_bind_unseparated(batch);
        }
        if let Some(total) = update.total_batches {
            fields.push("total_batches = ").push_bind_unseparated(total);
        }

        query
            .push(" WHERE id = ")
            .push_bind(job_id)
            .push(" AND status = ")
            .push_bind(JobStatus::Running.as_str());

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .context("Failed to update job")?;

        Ok(result.rows_affected() > 0)
    }

    async fn fetch_logs(&self, job_id: Uuid) -> Result<Vec<Value>> {
        let logs = sqlx::query_scalar::<_, Option<Value>>(
            "SELECT progress_messages FROM scraper_runs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch job logs")?
        .flatten();

        Ok(match logs {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        })
    }

    async fn replace_logs(&self, job_id: Uuid, logs: Vec<Value>) -> Result<()> {
        sqlx::query("UPDATE scraper_runs SET progress_messages = $1 WHERE id = $2")
            .bind(Value::Array(logs))
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("Failed to write job logs")?;

        Ok(())
    }

    async fn append_logs(
        &self,
        job_id: Uuid,
        entries: Vec<Value>,
        max_entries: usize,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scraper_runs
            SET progress_messages = (
                SELECT COALESCE(jsonb_agg(recent.entry ORDER BY recent.idx), '[]'::jsonb)
                FROM (
                    SELECT entry, idx
                    FROM jsonb_array_elements(COALESCE(progress_messages, '[]'::jsonb) || $1)
                         WITH ORDINALITY AS t(entry, idx)
                    ORDER BY idx DESC
                    LIMIT $2
                ) recent
            )
            WHERE id = $3
            "#,
        )
        .bind(Value::Array(entries))
        .bind(max_entries as i64)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to append job logs")?;

        Ok(())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    user_id: Uuid,
    scraper_id: Uuid,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    is_test_run: bool,
    is_validation_run: bool,
    competitor_id: Option<Uuid>,
    product_count: i64,
    execution_time_ms: Option<i64>,
    error_message: Option<String>,
    error_details: Option<String>,
    current_phase: Option<i32>,
    current_batch: Option<i32>,
    total_batches: Option<i32>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            user_id: row.user_id,
            scraper_id: row.scraper_id,
            status: row.status.parse().unwrap_or(JobStatus::Pending),
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            is_test_run: row.is_test_run,
            is_validation_run: row.is_validation_run,
            competitor_id: row.competitor_id,
            product_count: row.product_count,
            execution_time_ms: row.execution_time_ms,
            error_message: row.error_message,
            error_details: row.error_details,
            current_phase: row.current_phase,
            current_batch: row.current_batch,
            total_batches: row.total_batches,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScraperRow {
    id: Uuid,
    scraper_type: String,
    script: Option<String>,
    filter_by_active_brands: bool,
    scrape_only_own_products: bool,
}

impl From<ScraperRow> for ScraperDefinition {
    fn from(row: ScraperRow) -> Self {
        ScraperDefinition {
            id: row.id,
            scraper_type: row.scraper_type,
            script: row.script,
            filter_by_active_brands: row.filter_by_active_brands,
            scrape_only_own_products: row.scrape_only_own_products,
        }
    }
}
