//! Result persistence
//!
//! Writes a batch of scraped records in fixed-size chunks. Each chunk is
//! retried a few times with a fixed delay; a chunk that keeps failing is
//! reported to the caller, which decides whether the job survives it.

use harvest_core::domain::log::{LogLevel, phase};
use harvest_core::domain::record::ScrapedRecord;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::repository::{ResultRepository, ResultScope};
use crate::service::log_batcher::JobLogger;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to insert chunk {chunk} after {attempts} attempts: {reason}")]
    ChunkExhausted {
        chunk: usize,
        attempts: u32,
        reason: String,
        /// Records stored by earlier chunks of the same batch
        inserted: usize,
    },
}

pub struct ResultPersister {
    results: Arc<dyn ResultRepository>,
    chunk_size: usize,
    max_retries: u32,
    retry_delay: Duration,
}

impl ResultPersister {
    pub fn new(
        results: Arc<dyn ResultRepository>,
        chunk_size: usize,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            results,
            chunk_size: chunk_size.max(1),
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    /// Stores `batch`, returning the number of records written
    pub async fn persist(
        &self,
        scope: &ResultScope,
        batch: &[ScrapedRecord],
        logger: &JobLogger,
    ) -> Result<usize, PersistError> {
        if batch.is_empty() {
            return Ok(0);
        }
        logger
            .log(
                LogLevel::Debug,
                phase::DB_INSERT,
                format!("Attempting to save {} products", batch.len()),
            )
            .await;

        let mut inserted = 0;
        for (index, chunk) in batch.chunks(self.chunk_size).enumerate() {
            let chunk_number = index + 1;
            let mut attempt = 0;

            loop {
                attempt += 1;
                match self.results.insert_records(scope, chunk).await {
                    Ok(_) => {
                        inserted += chunk.len();
                        logger
                            .log(
                                LogLevel::Debug,
                                phase::DB_INSERT,
                                format!(
                                    "Inserted chunk {} ({} products), {} so far",
                                    chunk_number,
                                    chunk.len(),
                                    inserted
                                ),
                            )
                            .await;
                        break;
                    }
                    Err(e) => {
                        logger
                            .warn(
                                phase::DB_INSERT,
                                format!(
                                    "Attempt {}/{} failed for chunk {}: {:#}",
                                    attempt, self.max_retries, chunk_number, e
                                ),
                            )
                            .await;

                        if attempt >= self.max_retries {
                            return Err(PersistError::ChunkExhausted {
                                chunk: chunk_number,
                                attempts: attempt,
                                reason: format!("{:#}", e),
                                inserted,
                            });
                        }
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryStore;
    use crate::service::log_batcher::{DailyLogFile, LogSettings};
    use uuid::Uuid;

    fn records(n: usize) -> Vec<ScrapedRecord> {
        (0..n)
            .map(|i| ScrapedRecord::from_line(&format!(r#"{{"name":"item {}","price":{}}}"#, i, i)).unwrap())
            .collect()
    }

    fn setup(dir: &std::path::Path) -> (Arc<InMemoryStore>, JobLogger, ResultScope) {
        let store = Arc::new(InMemoryStore::new());
        let logger = JobLogger::new(
            Uuid::new_v4(),
            store.clone(),
            Arc::new(DailyLogFile::new(dir)),
            LogSettings {
                flush_interval: Duration::from_secs(60),
                batch_size: 1000,
                max_entries: 500,
            },
        );
        let scope = ResultScope {
            run_id: logger.job_id(),
            user_id: Uuid::new_v4(),
            competitor_id: None,
        };
        (store, logger, scope)
    }

    #[tokio::test]
    async fn test_batch_is_split_into_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (store, logger, scope) = setup(dir.path());
        let persister = ResultPersister::new(store.clone(), 40, 3, Duration::from_millis(1));

        let inserted = persister.persist(&scope, &records(100), &logger).await.unwrap();

        assert_eq!(inserted, 100);
        assert_eq!(store.insert_call_sizes(), vec![40, 40, 20]);
        assert_eq!(store.records()[99].name, "item 99");
        logger.shutdown().await;
    }

    #[tokio::test]
    async fn test_chunk_retries_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (store, logger, scope) = setup(dir.path());
        let persister = ResultPersister::new(store.clone(), 50, 3, Duration::from_millis(1));
        store.fail_next_inserts(2);

        let inserted = persister.persist(&scope, &records(10), &logger).await.unwrap();

        assert_eq!(inserted, 10);
        assert_eq!(store.insert_call_sizes(), vec![10]);
        logger.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_chunk_reports_progress_so_far() {
        let dir = tempfile::tempdir().unwrap();
        let (store, logger, scope) = setup(dir.path());
        let persister = ResultPersister::new(store.clone(), 5, 2, Duration::from_millis(1));

        persister.persist(&scope, &records(5), &logger).await.unwrap();
        store.fail_next_inserts(2);
        let err = persister.persist(&scope, &records(10), &logger).await.unwrap_err();

        match err {
            PersistError::ChunkExhausted { chunk, attempts, inserted, .. } => {
                assert_eq!(chunk, 1);
                assert_eq!(attempts, 2);
                assert_eq!(inserted, 0);
            }
        }
        assert_eq!(store.records().len(), 5);
        logger.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (store, logger, scope) = setup(dir.path());
        let persister = ResultPersister::new(store.clone(), 5, 2, Duration::from_millis(1));

        assert_eq!(persister.persist(&scope, &[], &logger).await.unwrap(), 0);
        assert!(store.insert_call_sizes().is_empty());
    }
}
