//! Job poller
//!
//! Claims one job at a time from the job store and drives it through
//! compilation, execution and finalization. Poll ticks keep firing while a
//! job is active; the execution slot turns them into no-ops.

use harvest_core::domain::job::{Job, JobStatus, JobUpdate, ScraperDefinition};
use harvest_core::domain::log::{LogEntry, LogLevel, phase};
use harvest_core::domain::script::{CatalogFilter, ScriptContext, SkuBrand};
use serde_json::json;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, ResultFailurePolicy};
use crate::repository::{CatalogRepository, JobRepository, ResultRepository};
use crate::scheduler::health;
use crate::service::{
    Compiler, DailyLogFile, ExecutionOutcome, JobLogger, LogSettings, MemoryGovernor,
    ResultPersister, Supervisor, SupervisorSettings,
};

/// Message used when a job's scraper or its script cannot be loaded
pub const SCRIPT_FETCH_FAILED: &str = "Failed to fetch scraper script";

/// Message used when the tenant's brands or products cannot be read
pub const CATALOG_FETCH_FAILED: &str = "Failed to fetch catalog filter data";

/// What a single poll tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another job is still being processed
    Busy,
    /// Nothing to claim
    Idle,
    ClaimFailed,
    Processed(Uuid),
}

/// The job currently held by this worker, if any
#[derive(Debug, Default)]
struct CurrentExecution {
    active: bool,
    job_id: Option<Uuid>,
    workspace: Option<PathBuf>,
}

/// Holds the execution slot; releasing happens on drop, whatever the exit path
struct ExecutionGuard<'a> {
    slot: &'a Mutex<CurrentExecution>,
}

impl<'a> ExecutionGuard<'a> {
    fn acquire(slot: &'a Mutex<CurrentExecution>) -> Option<Self> {
        let mut current = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if current.active {
            return None;
        }
        current.active = true;
        Some(Self { slot })
    }

    fn bind(&self, job_id: Uuid) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .job_id = Some(job_id);
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = CurrentExecution::default();
    }
}

pub struct JobPoller {
    config: Config,
    jobs: Arc<dyn JobRepository>,
    catalog: Arc<dyn CatalogRepository>,
    compiler: Arc<Compiler>,
    supervisor: Supervisor,
    governor: Arc<MemoryGovernor>,
    log_file: Arc<DailyLogFile>,
    current: Mutex<CurrentExecution>,
    last_activity: Mutex<Instant>,
}

impl JobPoller {
    pub fn new(
        config: Config,
        jobs: Arc<dyn JobRepository>,
        catalog: Arc<dyn CatalogRepository>,
        results: Arc<dyn ResultRepository>,
        compiler: Arc<Compiler>,
        governor: Arc<MemoryGovernor>,
        log_file: Arc<DailyLogFile>,
    ) -> Self {
        let persister = Arc::new(ResultPersister::new(
            results,
            config.result_chunk_size,
            config.result_max_retries,
            config.result_retry_delay,
        ));
        let supervisor = Supervisor::new(
            config.toolchain.runtime.clone(),
            SupervisorSettings {
                timeout: config.script_timeout,
                kill_grace: config.kill_grace_period,
                batch_size: config.result_batch_size,
            },
            persister,
            jobs.clone(),
        );

        Self {
            config,
            jobs,
            catalog,
            compiler,
            supervisor,
            governor,
            log_file,
            current: Mutex::new(CurrentExecution::default()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn current(&self) -> MutexGuard<'_, CurrentExecution> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Job being processed right now
    pub fn active_job(&self) -> Option<Uuid> {
        let current = self.current();
        if current.active { current.job_id } else { None }
    }

    /// Time since a job was last claimed or finished
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn governor(&self) -> &MemoryGovernor {
        &self.governor
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Runs the poll loop until `shutdown` is cancelled
    ///
    /// On cancellation no further jobs are claimed; an active job runs to
    /// completion before this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting job poller (worker: {}, type: {}, interval: {:?})",
            self.config.worker_id, self.config.worker_type, self.config.poll_interval
        );

        let health = tokio::spawn(health::run(
            Arc::clone(&self),
            self.config.health_interval,
            shutdown.clone(),
        ));

        let mut ticker = time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    while let Some(result) = ticks.try_join_next() {
                        if let Err(e) = result {
                            error!("Poll tick task failed: {}", e);
                        }
                    }
                    let poller = Arc::clone(&self);
                    ticks.spawn(async move { poller.tick().await });
                }
            }
        }

        info!("Shutdown requested, waiting for the active job to finish");
        while let Some(result) = ticks.join_next().await {
            if let Err(e) = result {
                error!("Poll tick task failed: {}", e);
            }
        }
        if let Err(e) = health.await {
            warn!("Health loop ended abnormally: {}", e);
        }
        info!("Job poller stopped");
    }

    /// Claims and fully processes at most one job
    pub async fn tick(self: &Arc<Self>) -> TickOutcome {
        let Some(guard) = ExecutionGuard::acquire(&self.current) else {
            debug!("Job already in progress, skipping poll");
            return TickOutcome::Busy;
        };

        let job = match self.jobs.claim_next(&self.config.worker_type).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("No pending jobs");
                return TickOutcome::Idle;
            }
            Err(e) => {
                error!("Failed to claim job: {:#}", e);
                return TickOutcome::ClaimFailed;
            }
        };

        guard.bind(job.id);
        self.touch();
        let job_id = job.id;
        self.process(job).await;
        self.touch();

        drop(guard);
        TickOutcome::Processed(job_id)
    }

    async fn process(self: &Arc<Self>, job: Job) {
        let started = Instant::now();
        let job_id = job.id;
        let logger = JobLogger::new(
            job_id,
            self.jobs.clone(),
            self.log_file.clone(),
            LogSettings {
                flush_interval: self.config.log_flush_interval,
                batch_size: self.config.log_batch_size,
                max_entries: self.config.log_max_entries,
            },
        );

        info!("Processing job {} (scraper {})", job_id, job.scraper_id);
        logger
            .info(
                phase::JOB_CLAIM,
                format!(
                    "Worker {} claimed job for scraper {}",
                    self.config.worker_id, job.scraper_id
                ),
            )
            .await;

        // A panic anywhere in the pipeline surfaces here as a JoinError
        let pipeline = {
            let poller = Arc::clone(self);
            let logger = logger.clone();
            tokio::spawn(async move { poller.execute(job, &logger).await })
        };

        let update = match pipeline.await {
            Ok(update) => update,
            Err(e) => self.unhandled_failure(&logger, e).await,
        };

        self.finalize(job_id, update, started, &logger).await;
    }

    /// Fetch, compile and run; returns the terminal update for the job
    async fn execute(&self, job: Job, logger: &JobLogger) -> JobUpdate {
        let scraper = match self.jobs.fetch_scraper(job.scraper_id).await {
            Ok(Some(scraper)) => scraper,
            Ok(None) => {
                logger
                    .error(phase::SETUP, format!("Scraper {} not found", job.scraper_id))
                    .await;
                return JobUpdate::failed(SCRIPT_FETCH_FAILED)
                    .error_details(format!("Scraper {} not found", job.scraper_id));
            }
            Err(e) => {
                logger
                    .error(phase::SETUP, format!("{}: {:#}", SCRIPT_FETCH_FAILED, e))
                    .await;
                return JobUpdate::failed(SCRIPT_FETCH_FAILED).error_details(format!("{:#}", e));
            }
        };

        let Some(script) = scraper.script.as_deref().filter(|s| !s.trim().is_empty()) else {
            logger
                .error(phase::SETUP, format!("Scraper {} has no script", scraper.id))
                .await;
            return JobUpdate::failed(SCRIPT_FETCH_FAILED)
                .error_details(format!("Scraper {} has no script", scraper.id));
        };

        // A job never runs without the filter its scraper asked for
        let filter = match self.catalog_filter(&job, &scraper, logger).await {
            Ok(filter) => filter,
            Err(e) => {
                logger
                    .error(phase::SETUP, format!("{}: {:#}", CATALOG_FETCH_FAILED, e))
                    .await;
                return JobUpdate::failed(CATALOG_FETCH_FAILED).error_details(format!("{:#}", e));
            }
        };
        let context = ScriptContext::new(&job, &scraper, filter);

        logger
            .info(phase::COMPILATION, "Compiling scraper script")
            .await;
        let compiled = self.compiler.compile(script).await;
        self.current().workspace = Some(compiled.workspace.clone());

        let artifact = match (compiled.success, compiled.artifact) {
            (true, Some(artifact)) => artifact,
            _ => {
                let message = compiled
                    .error
                    .unwrap_or_else(|| "Compilation failed".to_string());
                let message = format!("Compilation failed: {}", message);
                let update = JobUpdate::failed(&message);
                return match compiled.details {
                    Some(details) => {
                        logger
                            .log_with(
                                LogLevel::Error,
                                phase::COMPILATION,
                                message,
                                json!({ "output": details }),
                            )
                            .await;
                        update.error_details(details)
                    }
                    None => {
                        logger.error(phase::COMPILATION, message).await;
                        update
                    }
                };
            }
        };
        logger
            .info(phase::COMPILATION, "Script compiled successfully")
            .await;

        let outcome = self.supervisor.run(&artifact, &job, &context, logger).await;
        if outcome.failed_batches > 0 {
            logger
                .warn(
                    phase::DB_BATCH_SAVE,
                    format!(
                        "{} result batches could not be saved",
                        outcome.failed_batches
                    ),
                )
                .await;
        }

        final_update(&outcome, self.config.result_failure_policy)
    }

    async fn catalog_filter(
        &self,
        job: &Job,
        scraper: &ScraperDefinition,
        logger: &JobLogger,
    ) -> anyhow::Result<CatalogFilter> {
        let mut filter = CatalogFilter::default();

        if scraper.filter_by_active_brands {
            let brands = self
                .catalog
                .active_brands(job.user_id)
                .await
                .context("Failed to load active brands")?;
            logger
                .info(
                    phase::SETUP,
                    format!("Loaded {} active brands for filtering", brands.len()),
                )
                .await;
            for brand in brands {
                filter.active_brand_ids.push(brand.id);
                filter.active_brand_names.push(brand.name);
            }
        }

        if scraper.scrape_only_own_products {
            let products = self
                .catalog
                .own_products(job.user_id)
                .await
                .context("Failed to load own products")?;
            for product in products {
                if let Some(ean) = product.ean.filter(|e| !e.is_empty()) {
                    filter.own_product_eans.push(ean);
                }
                if let Some(sku) = product.sku.filter(|s| !s.is_empty())
                    && (product.brand.is_some() || product.brand_id.is_some())
                {
                    filter.own_product_sku_brands.push(SkuBrand {
                        sku,
                        brand: product.brand.unwrap_or_default(),
                        brand_id: product.brand_id,
                    });
                }
            }
            logger
                .info(
                    phase::SETUP,
                    format!(
                        "Loaded {} own product EANs and {} SKU/brand pairs",
                        filter.own_product_eans.len(),
                        filter.own_product_sku_brands.len()
                    ),
                )
                .await;
        }

        Ok(filter)
    }

    async fn unhandled_failure(&self, logger: &JobLogger, e: tokio::task::JoinError) -> JobUpdate {
        let message = match e.try_into_panic() {
            Ok(payload) => payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string()),
            Err(e) => e.to_string(),
        };
        let data = json!({ "error": message });
        let message = format!("Unhandled error while processing job: {}", message);

        error!(job_id = %logger.job_id(), "{}", message);
        logger
            .log_with(
                LogLevel::Error,
                phase::JOB_PROCESSING,
                message.clone(),
                data.clone(),
            )
            .await;
        if let Err(e) = logger
            .append_direct(
                LogEntry::new(LogLevel::Error, phase::JOB_PROCESSING, message.clone())
                    .with_data(data),
            )
            .await
        {
            error!(job_id = %logger.job_id(), "Failed to append failure to job log: {:#}", e);
        }

        JobUpdate::failed(&message).error_details(&message)
    }

    /// Always runs: writes the terminal status, drops the log batch and
    /// removes the workspace
    async fn finalize(&self, job_id: Uuid, update: JobUpdate, started: Instant, logger: &JobLogger) {
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let product_count = update.product_count.unwrap_or(0);
        let update = update.timing(elapsed_ms, product_count);
        let status = update.status.unwrap_or(JobStatus::Failed);

        let summary = format!(
            "Job finished with status {} ({} products in {} ms)",
            status, product_count, elapsed_ms
        );
        let level = if status == JobStatus::Completed {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        logger.log(level, phase::JOB_COMPLETION, summary.clone()).await;
        logger.shutdown().await;

        match self.jobs.update_job(job_id, update).await {
            Ok(true) => info!("Job {}: {}", job_id, summary),
            Ok(false) => warn!("Job {} was no longer running, final status not written", job_id),
            Err(e) => {
                error!("Failed to write final status for job {}: {:#}", job_id, e);
                let entry = LogEntry::new(
                    LogLevel::Error,
                    phase::JOB_STATUS_UPDATE,
                    format!("Failed to write final status {}: {:#}", status, e),
                );
                if let Err(e) = logger.append_direct(entry).await {
                    error!("Failed to append status failure to job {} log: {:#}", job_id, e);
                }
            }
        }

        let workspace = self.current().workspace.take();
        if let Some(workspace) = workspace {
            self.compiler.cleanup(&workspace).await;
        }

        self.governor.check(&format!("After job {}", job_id));
    }
}

/// Builds the terminal update from a finished execution
pub fn final_update(outcome: &ExecutionOutcome, policy: ResultFailurePolicy) -> JobUpdate {
    let mut status = outcome.status;
    let mut error_message = outcome.error_message.clone();

    if let ResultFailurePolicy::FailAfter(limit) = policy
        && outcome.failed_batches >= limit
        && status == JobStatus::Completed
    {
        status = JobStatus::Failed;
        error_message = Some(format!(
            "Failed to persist {} result batches",
            outcome.failed_batches
        ));
    }

    let mut update = JobUpdate::finished(status).product_count(outcome.product_count);
    if let Some(message) = error_message {
        update = update.error_message(message);
    }
    if let Some(details) = &outcome.error_details {
        update = update.error_details(details);
    }
    outcome.progress.fill(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ExitKind;
    use crate::service::supervisor::ProgressState;

    fn outcome(status: JobStatus, failed_batches: usize) -> ExecutionOutcome {
        ExecutionOutcome {
            status,
            error_message: None,
            error_details: None,
            exit: ExitKind::Exited(0),
            product_count: 42,
            progress: ProgressState {
                phase: Some(2),
                current_batch: Some(3),
                total_batches: Some(4),
            },
            failed_batches,
        }
    }

    #[test]
    fn test_execution_slot_is_exclusive_and_released_on_drop() {
        let slot = Mutex::new(CurrentExecution::default());

        let guard = ExecutionGuard::acquire(&slot).unwrap();
        guard.bind(Uuid::nil());
        assert!(ExecutionGuard::acquire(&slot).is_none());
        assert_eq!(slot.lock().unwrap().job_id, Some(Uuid::nil()));

        drop(guard);
        assert!(!slot.lock().unwrap().active);
        assert!(slot.lock().unwrap().job_id.is_none());
        assert!(ExecutionGuard::acquire(&slot).is_some());
    }

    #[test]
    fn test_best_effort_ignores_failed_batches() {
        let update = final_update(
            &outcome(JobStatus::Completed, 5),
            ResultFailurePolicy::BestEffort,
        );
        assert_eq!(update.status, Some(JobStatus::Completed));
        assert_eq!(update.product_count, Some(42));
        assert_eq!(update.current_phase, Some(2));
        assert_eq!(update.total_batches, Some(4));
        assert!(update.error_message.is_none());
    }

    #[test]
    fn test_fail_after_threshold() {
        let policy = ResultFailurePolicy::FailAfter(2);

        let update = final_update(&outcome(JobStatus::Completed, 1), policy);
        assert_eq!(update.status, Some(JobStatus::Completed));

        let update = final_update(&outcome(JobStatus::Completed, 2), policy);
        assert_eq!(update.status, Some(JobStatus::Failed));
        assert_eq!(
            update.error_message.as_deref(),
            Some("Failed to persist 2 result batches")
        );
    }

    #[test]
    fn test_subprocess_failure_message_wins_over_policy() {
        let mut failed = outcome(JobStatus::Failed, 3);
        failed.error_message = Some("TypeError: boom".to_string());

        let update = final_update(&failed, ResultFailurePolicy::FailAfter(1));
        assert_eq!(update.status, Some(JobStatus::Failed));
        assert_eq!(update.error_message.as_deref(), Some("TypeError: boom"));
    }
}
