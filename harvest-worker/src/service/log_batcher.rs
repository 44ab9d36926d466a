//! Job log batching
//!
//! Each active job gets one [`JobLogger`]. Entries are written to the local
//! daily log file right away and batched before being merged into the job's
//! persisted log array, which is capped at a fixed length.

use anyhow::Result;
use harvest_core::domain::log::{LogEntry, LogLevel, phase};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::repository::JobRepository;

/// Entries kept by the reduced write attempted after a failed flush
const FALLBACK_ENTRIES: usize = 10;

/// Flush intervals without a new message before the timer shuts down
const IDLE_INTERVALS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct LogSettings {
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub max_entries: usize,
}

/// Append-only JSON-lines file, one per UTC day
pub struct DailyLogFile {
    dir: PathBuf,
}

impl DailyLogFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("Failed to create log directory {}: {}", dir.display(), e);
        }
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: chrono::NaiveDate) -> PathBuf {
        self.dir
            .join(format!("harvest-worker-{}.log", date.format("%Y-%m-%d")))
    }

    pub async fn append(&self, line: &str) -> std::io::Result<()> {
        let path = self.path_for(chrono::Utc::now().date_naive());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(format!("{}\n", line).as_bytes()).await
    }
}

struct BatchState {
    pending: Vec<LogEntry>,
    last_flush: Instant,
    last_message: Instant,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    job_id: Uuid,
    jobs: Arc<dyn JobRepository>,
    file: Arc<DailyLogFile>,
    settings: LogSettings,
    state: Mutex<BatchState>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-job log batch with an owned flush timer
///
/// Cheap to clone; clones share the same batch.
#[derive(Clone)]
pub struct JobLogger {
    inner: Arc<Inner>,
}

impl JobLogger {
    pub fn new(
        job_id: Uuid,
        jobs: Arc<dyn JobRepository>,
        file: Arc<DailyLogFile>,
        settings: LogSettings,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                job_id,
                jobs,
                file,
                settings,
                state: Mutex::new(BatchState {
                    pending: Vec::new(),
                    last_flush: now,
                    last_message: now,
                    timer: None,
                }),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.inner.job_id
    }

    pub async fn info(&self, phase: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, phase, message).await;
    }

    pub async fn warn(&self, phase: &str, message: impl Into<String>) {
        self.log(LogLevel::Warning, phase, message).await;
    }

    pub async fn error(&self, phase: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, phase, message).await;
    }

    pub async fn log(&self, level: LogLevel, phase: &str, message: impl Into<String>) {
        self.record(LogEntry::new(level, phase, message)).await;
    }

    pub async fn log_with(
        &self,
        level: LogLevel,
        phase: &str,
        message: impl Into<String>,
        data: Value,
    ) {
        self.record(LogEntry::new(level, phase, message).with_data(data))
            .await;
    }

    async fn record(&self, entry: LogEntry) {
        let job_id = self.inner.job_id;
        match entry.level {
            LogLevel::Debug => debug!(%job_id, phase = %entry.phase, "{}", entry.message),
            LogLevel::Info => info!(%job_id, phase = %entry.phase, "{}", entry.message),
            LogLevel::Warning => warn!(%job_id, phase = %entry.phase, "{}", entry.message),
            LogLevel::Error => error!(%job_id, phase = %entry.phase, "{}", entry.message),
        }

        if let Ok(mut line) = serde_json::to_value(&entry) {
            line["job_id"] = Value::String(job_id.to_string());
            if let Err(e) = self.inner.file.append(&line.to_string()).await {
                warn!("Failed to append to local log file: {}", e);
            }
        }

        let flush_now = {
            let mut state = self.inner.state();
            state.last_message = Instant::now();
            let urgent = entry.level == LogLevel::Error || phase::is_important(&entry.phase);
            state.pending.push(entry);

            let flush_now = urgent || state.pending.len() >= self.inner.settings.batch_size;
            if !flush_now && state.timer.is_none() {
                state.timer = Some(spawn_timer(Arc::downgrade(&self.inner)));
            }
            flush_now
        };

        if flush_now {
            self.flush().await;
        }
    }

    /// Number of entries waiting for the next flush
    pub fn pending(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn has_timer(&self) -> bool {
        self.inner.state().timer.is_some()
    }

    /// Merges pending entries into the persisted log array
    pub async fn flush(&self) {
        flush_inner(&self.inner).await;
    }

    /// Writes one entry straight to the job store, bypassing the batch
    pub async fn append_direct(&self, entry: LogEntry) -> Result<()> {
        let value = serde_json::to_value(&entry)?;
        self.inner
            .jobs
            .append_logs(
                self.inner.job_id,
                vec![value],
                self.inner.settings.max_entries,
            )
            .await
    }

    /// Stops the flush timer and writes out whatever is pending
    pub async fn shutdown(&self) {
        let timer = self.inner.state().timer.take();
        if let Some(timer) = timer {
            timer.abort();
        }
        self.flush().await;
    }
}

fn spawn_timer(inner: Weak<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = match inner.upgrade() {
                Some(inner) => inner.settings.flush_interval,
                None => return,
            };
            tokio::time::sleep(interval).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };

            let has_pending = {
                let mut state = inner.state();
                let idle = state.last_message.elapsed() >= interval * IDLE_INTERVALS;
                if state.pending.is_empty() && idle {
                    state.timer = None;
                    debug!(job_id = %inner.job_id, "Log flush timer idle, stopping");
                    return;
                }
                !state.pending.is_empty() && state.last_flush.elapsed() >= interval
            };

            if has_pending {
                flush_inner(&inner).await;
            }
        }
    })
}

async fn flush_inner(inner: &Inner) {
    let _guard = inner.flush_lock.lock().await;

    let batch = {
        let mut state = inner.state();
        state.last_flush = Instant::now();
        std::mem::take(&mut state.pending)
    };
    if batch.is_empty() {
        return;
    }

    let values: Vec<Value> = batch
        .iter()
        .filter_map(|entry| serde_json::to_value(entry).ok())
        .collect();

    match write_merged(inner, values).await {
        Ok(()) => debug!(job_id = %inner.job_id, "Flushed {} log entries", batch.len()),
        Err(e) => {
            warn!(job_id = %inner.job_id, "Failed to flush {} log entries: {:#}", batch.len(), e);

            let reduced = reduce_for_fallback(&batch);
            if reduced.is_empty() {
                return;
            }
            if let Err(e) = inner
                .jobs
                .append_logs(inner.job_id, reduced, inner.settings.max_entries)
                .await
            {
                error!(job_id = %inner.job_id, "Fallback log write failed: {:#}", e);
            }
        }
    }
}

async fn write_merged(inner: &Inner, batch: Vec<Value>) -> Result<()> {
    let existing = inner.jobs.fetch_logs(inner.job_id).await?;
    let merged = merge_truncated(existing, batch, inner.settings.max_entries);
    inner.jobs.replace_logs(inner.job_id, merged).await
}

/// Keeps only the most severe recent entries
fn reduce_for_fallback(batch: &[LogEntry]) -> Vec<Value> {
    let severe: Vec<&LogEntry> = batch
        .iter()
        .filter(|entry| entry.level >= LogLevel::Warning)
        .collect();
    let start = severe.len().saturating_sub(FALLBACK_ENTRIES);
    severe[start..]
        .iter()
        .filter_map(|entry| serde_json::to_value(entry).ok())
        .collect()
}

/// Appends `batch` to `existing` and keeps the last `max` items in order
pub fn merge_truncated<T>(mut existing: Vec<T>, batch: Vec<T>, max: usize) -> Vec<T> {
    existing.extend(batch);
    if existing.len() > max {
        let excess = existing.len() - max;
        existing.drain(..excess);
    }
    existing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryStore;

    fn logger_with(store: Arc<InMemoryStore>, dir: &Path, settings: LogSettings) -> JobLogger {
        JobLogger::new(
            Uuid::new_v4(),
            store,
            Arc::new(DailyLogFile::new(dir)),
            settings,
        )
    }

    fn settings(flush_ms: u64, batch_size: usize, max_entries: usize) -> LogSettings {
        LogSettings {
            flush_interval: Duration::from_millis(flush_ms),
            batch_size,
            max_entries,
        }
    }

    fn messages(store: &InMemoryStore, job_id: Uuid) -> Vec<String> {
        store
            .logs(job_id)
            .iter()
            .filter_map(|v| v["msg"].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_merge_truncated_keeps_most_recent_in_order() {
        let merged = merge_truncated(vec![1, 2, 3], vec![4, 5], 4);
        assert_eq!(merged, vec![2, 3, 4, 5]);

        let merged = merge_truncated(vec![1], vec![2], 10);
        assert_eq!(merged, vec![1, 2]);
    }

    #[test]
    fn test_merge_truncated_never_exceeds_max() {
        let mut persisted: Vec<u32> = Vec::new();
        let mut next = 0;
        for batch_len in [3, 7, 1, 12, 5, 9] {
            let batch: Vec<u32> = (next..next + batch_len).collect();
            next += batch_len;
            persisted = merge_truncated(persisted, batch, 8);
            assert!(persisted.len() <= 8);
            assert_eq!(*persisted.last().unwrap(), next - 1);
            assert!(persisted.windows(2).all(|w| w[1] == w[0] + 1));
        }
    }

    #[tokio::test]
    async fn test_error_entries_flush_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let logger = logger_with(store.clone(), dir.path(), settings(60_000, 20, 500));

        logger.info(phase::SETUP, "starting").await;
        assert_eq!(logger.pending(), 1);
        assert!(store.logs(logger.job_id()).is_empty());

        logger.error(phase::SUBPROCESS_ERROR, "boom").await;
        assert_eq!(logger.pending(), 0);
        assert_eq!(messages(&store, logger.job_id()), vec!["starting", "boom"]);

        logger.shutdown().await;
    }

    #[tokio::test]
    async fn test_important_phase_and_batch_size_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let logger = logger_with(store.clone(), dir.path(), settings(60_000, 3, 500));

        logger.info(phase::JOB_CLAIM, "claimed").await;
        assert_eq!(messages(&store, logger.job_id()).len(), 1);

        logger.info(phase::SCRIPT_STDOUT, "a").await;
        logger.info(phase::SCRIPT_STDOUT, "b").await;
        assert_eq!(messages(&store, logger.job_id()).len(), 1);
        logger.info(phase::SCRIPT_STDOUT, "c").await;
        assert_eq!(messages(&store, logger.job_id()), vec!["claimed", "a", "b", "c"]);

        logger.shutdown().await;
    }

    #[tokio::test]
    async fn test_timer_flushes_then_goes_idle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let logger = logger_with(store.clone(), dir.path(), settings(20, 100, 500));

        logger.info(phase::SCRIPT_STDOUT, "quiet").await;
        assert!(logger.has_timer());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(messages(&store, logger.job_id()), vec!["quiet"]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!logger.has_timer());
    }

    #[tokio::test]
    async fn test_persisted_log_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let logger = logger_with(store.clone(), dir.path(), settings(60_000, 2, 5));

        for i in 0..13 {
            logger.info(phase::SCRIPT_STDOUT, format!("line {}", i)).await;
            assert!(store.logs(logger.job_id()).len() <= 5);
        }
        logger.shutdown().await;

        assert_eq!(
            messages(&store, logger.job_id()),
            vec!["line 8", "line 9", "line 10", "line 11", "line 12"]
        );
    }

    #[tokio::test]
    async fn test_failed_flush_falls_back_to_severe_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let logger = logger_with(store.clone(), dir.path(), settings(60_000, 100, 500));
        store.fail_log_writes(true);

        logger.info(phase::SCRIPT_STDOUT, "chatter").await;
        logger.warn(phase::DB_INSERT, "slow insert").await;
        logger.error(phase::SUBPROCESS_ERROR, "crashed").await;

        assert_eq!(messages(&store, logger.job_id()), vec!["slow insert", "crashed"]);
        logger.shutdown().await;
    }

    #[tokio::test]
    async fn test_entries_reach_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let file = Arc::new(DailyLogFile::new(dir.path().join("logs")));
        let logger = JobLogger::new(Uuid::new_v4(), store, file.clone(), settings(60_000, 20, 500));

        logger.info(phase::SETUP, "to disk").await;
        logger.shutdown().await;

        let path = file.path_for(chrono::Utc::now().date_naive());
        let contents = std::fs::read_to_string(path).unwrap();
        let line: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["msg"], "to disk");
        assert_eq!(line["job_id"], logger.job_id().to_string());
    }
}
