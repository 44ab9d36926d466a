//! In-memory store
//!
//! Implements every repository trait over a single mutex-guarded state. Claims
//! are single-winner like the SQL claim, which makes this usable for driving
//! the poller end to end without a database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use harvest_core::domain::job::{Job, JobStatus, JobUpdate, ScraperDefinition};
use harvest_core::domain::record::ScrapedRecord;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::catalog::{Brand, CatalogRepository, OwnProduct};
use super::jobs::JobRepository;
use super::results::{ResultRepository, ResultScope};

#[derive(Default)]
struct State {
    jobs: Vec<(String, Job)>,
    scrapers: HashMap<Uuid, ScraperDefinition>,
    logs: HashMap<Uuid, Vec<Value>>,
    updates: HashMap<Uuid, Vec<JobUpdate>>,
    brands: HashMap<Uuid, Vec<Brand>>,
    products: HashMap<Uuid, Vec<OwnProduct>>,
    records: Vec<(ResultScope, ScrapedRecord)>,
    insert_calls: Vec<usize>,
    failing_inserts: usize,
    fail_log_writes: bool,
    fail_catalog_reads: bool,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds a pending job for the given scraper
    pub fn pending_job(user_id: Uuid, scraper_id: Uuid) -> Job {
        Job {
            id: Uuid::new_v4(),
            user_id,
            scraper_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            is_test_run: false,
            is_validation_run: false,
            competitor_id: None,
            product_count: 0,
            execution_time_ms: None,
            error_message: None,
            error_details: None,
            current_phase: None,
            current_batch: None,
            total_batches: None,
        }
    }

    pub fn insert_scraper(&self, scraper: ScraperDefinition) {
        self.state().scrapers.insert(scraper.id, scraper);
    }

    /// Queues a job to be claimed by workers of `worker_type`
    pub fn enqueue(&self, job: Job, worker_type: &str) -> Uuid {
        let id = job.id;
        self.state().jobs.push((worker_type.to_string(), job));
        id
    }

    pub fn add_brand(&self, user_id: Uuid, brand: Brand) {
        self.state().brands.entry(user_id).or_default().push(brand);
    }

    pub fn add_product(&self, user_id: Uuid, product: OwnProduct) {
        self.state().products.entry(user_id).or_default().push(product);
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.state()
            .jobs
            .iter()
            .find(|(_, job)| job.id == job_id)
            .map(|(_, job)| job.clone())
    }

    /// Every non-empty update applied to the job, in order
    pub fn updates(&self, job_id: Uuid) -> Vec<JobUpdate> {
        self.state().updates.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn logs(&self, job_id: Uuid) -> Vec<Value> {
        self.state().logs.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn records(&self) -> Vec<ScrapedRecord> {
        self.state().records.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Sizes of every successful insert call, in order
    pub fn insert_call_sizes(&self) -> Vec<usize> {
        self.state().insert_calls.clone()
    }

    /// Makes the next `count` insert calls fail
    pub fn fail_next_inserts(&self, count: usize) {
        self.state().failing_inserts = count;
    }

    /// Makes every log write fail until switched off
    pub fn fail_log_writes(&self, fail: bool) {
        self.state().fail_log_writes = fail;
    }

    /// Makes every catalog read fail until switched off
    pub fn fail_catalog_reads(&self, fail: bool) {
        self.state().fail_catalog_reads = fail;
    }
}

#[async_trait]
impl JobRepository for InMemoryStore {
    async fn claim_next(&self, worker_type: &str) -> Result<Option<Job>> {
        let mut state = self.state();
        let next = state
            .jobs
            .iter_mut()
            .filter(|(kind, job)| kind == worker_type && job.status == JobStatus::Pending)
            .min_by_key(|(_, job)| job.created_at);

        Ok(next.map(|(_, job)| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.error_message = None;
            job.clone()
        }))
    }

    async fn fetch_scraper(&self, scraper_id: Uuid) -> Result<Option<ScraperDefinition>> {
        Ok(self.state().scrapers.get(&scraper_id).cloned())
    }

    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }

        let mut state = self.state();
        let Some((_, job)) = state
            .jobs
            .iter_mut()
            .find(|(_, job)| job.id == job_id && job.status == JobStatus::Running)
        else {
            return Ok(false);
        };

        if let Some(status) = update.status {
            job.status = status;
        }
        if update.completed_at.is_some() {
            job.completed_at = update.completed_at;
        }
        if let Some(count) = update.product_count {
            job.product_count = count;
        }
        if update.execution_time_ms.is_some() {
            job.execution_time_ms = update.execution_time_ms;
        }
        if update.error_message.is_some() {
            job.error_message = update.error_message.clone();
        }
        if update.error_details.is_some() {
            job.error_details = update.error_details.clone();
        }
        if update.current_phase.is_some() {
            job.current_phase = update.current_phase;
        }
        if update.current_batch.is_some() {
            job.current_batch = update.current_batch;
        }
        if update.total_batches.is_some() {
            job.total_batches = update.total_batches;
        }

        state.updates.entry(job_id).or_default().push(update);
        Ok(true)
    }

    async fn fetch_logs(&self, job_id: Uuid) -> Result<Vec<Value>> {
        let state = self.state();
        if state.fail_log_writes {
            anyhow::bail!("log store unavailable");
        }
        Ok(state.logs.get(&job_id).cloned().unwrap_or_default())
    }

    async fn replace_logs(&self, job_id: Uuid, logs: Vec<Value>) -> Result<()> {
        let mut state = self.state();
        if state.fail_log_writes {
            anyhow::bail!("log store unavailable");
        }
        state.logs.insert(job_id, logs);
        Ok(())
    }

    async fn append_logs(
        &self,
        job_id: Uuid,
        entries: Vec<Value>,
        max_entries: usize,
    ) -> Result<()> {
        let mut state = self.state();
        let logs = state.logs.entry(job_id).or_default();
        logs.extend(entries);
        if logs.len() > max_entries {
            let excess = logs.len() - max_entries;
            logs.drain(..excess);
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogRepository for InMemoryStore {
    async fn active_brands(&self, user_id: Uuid) -> Result<Vec<Brand>> {
        let state = self.state();
        if state.fail_catalog_reads {
            anyhow::bail!("catalog unavailable");
        }
        Ok(state.brands.get(&user_id).cloned().unwrap_or_default())
    }

    async fn own_products(&self, user_id: Uuid) -> Result<Vec<OwnProduct>> {
        let state = self.state();
        if state.fail_catalog_reads {
            anyhow::bail!("catalog unavailable");
        }
        Ok(state.products.get(&user_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ResultRepository for InMemoryStore {
    async fn insert_records(&self, scope: &ResultScope, records: &[ScrapedRecord]) -> Result<u64> {
        let mut state = self.state();
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            anyhow::bail!("result store unavailable");
        }
        state.insert_calls.push(records.len());
        state
            .records
            .extend(records.iter().cloned().map(|r| (*scope, r)));
        Ok(records.len() as u64)
    }
}
