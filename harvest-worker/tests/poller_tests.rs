//! Integration tests for the job poller.
//!
//! Jobs run end to end against the in-memory store. Scripts are plain shell:
//! the toolchain "installs" with `true`, "transforms" with `cp` and runs the
//! artifact with `sh`, so no JS toolchain is needed.
//!
//! Tests verify:
//! - completed, failed and timed-out runs end with the right status
//! - test runs tolerate stderr errors on a clean exit
//! - only one job is processed at a time
//! - result batching and progress counters
//! - the script context reaches the subprocess
//! - undecodable output and catalog failures are handled
//! - workspaces are removed whatever the outcome

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harvest_core::domain::job::{Job, JobStatus, ScraperDefinition};
use harvest_core::domain::log::phase;
use harvest_core::domain::script::ScriptContext;
use harvest_worker::config::{Config, Toolchain};
use harvest_worker::repository::{Brand, InMemoryStore, OwnProduct};
use harvest_worker::scheduler::{JobPoller, TickOutcome};
use harvest_worker::service::{
    Compiler, DailyLogFile, DebugLog, MemoryGovernor, ProcessMemorySampler,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WORKER_TYPE: &str = "typescript";

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    store: Arc<InMemoryStore>,
    poller: Arc<JobPoller>,
    user_id: Uuid,
    workspaces: TempDir,
    _logs: TempDir,
}

fn sh_toolchain() -> Toolchain {
    Toolchain {
        install: "true".parse().unwrap(),
        transform: "cp scraper.ts scraper.js".parse().unwrap(),
        runtime: "sh".to_string(),
        source_file: "scraper.ts".to_string(),
        artifact_file: "scraper.js".to_string(),
    }
}

fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
    let workspaces = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();

    let mut config = Config::new(
        "test-worker".to_string(),
        "postgres://unused@localhost/harvest".to_string(),
    );
    config.poll_interval = Duration::from_millis(50);
    config.health_interval = Duration::from_secs(3600);
    config.script_timeout = Duration::from_secs(20);
    config.kill_grace_period = Duration::from_millis(500);
    config.compile_timeout = Duration::from_secs(20);
    config.result_chunk_size = 100;
    config.result_retry_delay = Duration::from_millis(1);
    config.log_flush_interval = Duration::from_millis(50);
    config.log_dir = logs.path().to_path_buf();
    config.workspace_root = workspaces.path().to_path_buf();
    config.toolchain = sh_toolchain();
    configure(&mut config);

    let store = Arc::new(InMemoryStore::new());
    let compiler = Arc::new(Compiler::new(
        config.workspace_root.clone(),
        config.toolchain.clone(),
        config.compile_timeout,
        Arc::new(DebugLog::disabled()),
    ));
    let poller = Arc::new(JobPoller::new(
        config.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        compiler,
        Arc::new(MemoryGovernor::new(ProcessMemorySampler)),
        Arc::new(DailyLogFile::new(&config.log_dir)),
    ));

    Harness {
        store,
        poller,
        user_id: Uuid::new_v4(),
        workspaces,
        _logs: logs,
    }
}

impl Harness {
    fn scraper(&self, script: Option<&str>) -> ScraperDefinition {
        let scraper = ScraperDefinition {
            id: Uuid::new_v4(),
            scraper_type: WORKER_TYPE.to_string(),
            script: script.map(str::to_string),
            filter_by_active_brands: false,
            scrape_only_own_products: false,
        };
        self.store.insert_scraper(scraper.clone());
        scraper
    }

    fn enqueue(&self, scraper: &ScraperDefinition, adjust: impl FnOnce(&mut Job)) -> Uuid {
        let mut job = InMemoryStore::pending_job(self.user_id, scraper.id);
        adjust(&mut job);
        self.store.enqueue(job, WORKER_TYPE)
    }

    fn add_job(&self, script: &str) -> Uuid {
        let scraper = self.scraper(Some(script));
        self.enqueue(&scraper, |_| {})
    }

    fn job(&self, job_id: Uuid) -> Job {
        self.store.job(job_id).unwrap()
    }

    fn log_phases(&self, job_id: Uuid) -> Vec<String> {
        self.store
            .logs(job_id)
            .iter()
            .filter_map(|entry| entry["phase"].as_str().map(str::to_string))
            .collect()
    }

    /// Structured payload of the first entry logged under `phase` that has one
    fn entry_data(&self, job_id: Uuid, phase: &str) -> Option<Value> {
        self.store
            .logs(job_id)
            .into_iter()
            .filter(|entry| entry["phase"] == phase)
            .map(|entry| entry["data"].clone())
            .find(|data| !data.is_null())
    }

    fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.workspaces.path()).unwrap().count()
    }
}

fn shell_path(path: &Path) -> String {
    path.display().to_string()
}

// ============================================================================
// Status Tests
// ============================================================================

#[tokio::test]
async fn test_successful_run_completes_and_stores_results() {
    let h = harness(|_| {});
    let job_id = h.add_job(
        r#"echo 'INFO starting crawl'
echo '{"name":"Widget","price":9.99,"currency":"EUR","sku":"W-1"}'
echo 'not a record, just chatter'
echo '{"name":"Gadget","competitor_price":19.5}'
echo 'PROGRESS: Phase 1: 1/2 pages' >&2
"#,
    );

    assert_eq!(h.poller.tick().await, TickOutcome::Processed(job_id));

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.product_count, 2);
    assert!(job.completed_at.is_some());
    assert!(job.execution_time_ms.is_some());
    assert!(job.error_message.is_none());

    let records = h.store.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name, "Widget");
    assert_eq!(records[1].price, 19.5);

    let phases = h.log_phases(job_id);
    assert_eq!(phases.first().map(String::as_str), Some(phase::JOB_CLAIM));
    assert!(phases.iter().any(|p| p == phase::JOB_COMPLETION));

    assert_eq!(h.leftover_workspaces(), 0);
    assert_eq!(h.poller.active_job(), None);
}

#[tokio::test]
async fn test_idle_tick_when_queue_is_empty() {
    let h = harness(|_| {});
    assert_eq!(h.poller.tick().await, TickOutcome::Idle);
}

#[tokio::test]
async fn test_test_run_tolerates_stderr_errors_on_clean_exit() {
    let h = harness(|_| {});
    let script = r#"echo '{"name":"A","price":1}'
echo 'ERROR: selector missing' >&2
exit 0
"#;
    let scraper = h.scraper(Some(script));
    let normal = h.enqueue(&scraper, |_| {});
    let test_run = h.enqueue(&scraper, |job| job.is_test_run = true);

    assert!(matches!(h.poller.tick().await, TickOutcome::Processed(_)));
    assert!(matches!(h.poller.tick().await, TickOutcome::Processed(_)));

    let normal = h.job(normal);
    assert_eq!(normal.status, JobStatus::Failed);
    assert_eq!(normal.error_message.as_deref(), Some("selector missing"));

    let test_run = h.job(test_run);
    assert_eq!(test_run.status, JobStatus::Completed);
    assert_eq!(test_run.product_count, 1);
}

#[tokio::test]
async fn test_non_zero_exit_reports_generic_message() {
    let h = harness(|_| {});
    let job_id = h.add_job("echo 'something went sideways' >&2\nexit 3\n");

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Script exited with non-zero exit code 3")
    );
    let details = job.error_details.unwrap();
    assert!(details.contains("Exit code: 3"));
    assert!(details.contains("something went sideways"));

    let logged = h.entry_data(job_id, phase::SUBPROCESS_ERROR).unwrap();
    assert_eq!(logged["details"].as_str(), Some(details.as_str()));
}

#[tokio::test]
async fn test_non_zero_exit_prefers_detected_error() {
    let h = harness(|_| {});
    let job_id = h.add_job("echo 'loading page' >&2\necho 'TypeError: x is not a function' >&2\nexit 1\n");

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("TypeError: x is not a function")
    );
}

#[tokio::test]
async fn test_spawn_failure_fails_job() {
    let h = harness(|config| {
        config.toolchain.runtime = "/nonexistent/harvest-runtime".to_string();
    });
    let job_id = h.add_job("echo never runs\n");

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.error_message
            .unwrap()
            .starts_with("Failed to start subprocess")
    );
    assert_eq!(h.leftover_workspaces(), 0);
}

// ============================================================================
// Timeout Tests
// ============================================================================

#[tokio::test]
async fn test_timeout_terminates_script() {
    let h = harness(|config| {
        config.script_timeout = Duration::from_secs(1);
    });
    let job_id = h.add_job("echo 'INFO waiting'\nsleep 30\n");

    let started = Instant::now();
    h.poller.tick().await;

    assert!(started.elapsed() < Duration::from_secs(10));
    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Script execution timed out after 1 seconds")
    );
    assert!(h.log_phases(job_id).iter().any(|p| p == phase::JOB_TIMEOUT));
    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_timeout_force_kills_script_ignoring_sigterm() {
    let h = harness(|config| {
        config.script_timeout = Duration::from_secs(1);
        config.kill_grace_period = Duration::from_millis(300);
    });
    let job_id = h.add_job("trap '' TERM\nsleep 30\n");

    let started = Instant::now();
    h.poller.tick().await;

    assert!(started.elapsed() < Duration::from_secs(10));
    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("timed out"));
}

// ============================================================================
// Pipeline Tests
// ============================================================================

#[tokio::test]
async fn test_compile_failure_fails_job_and_removes_workspace() {
    let h = harness(|config| {
        config.toolchain.transform = "false".parse().unwrap();
    });
    let job_id = h.add_job("echo hello\n");

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.error_message
            .unwrap()
            .starts_with("Compilation failed: transform failed")
    );
    assert_eq!(h.leftover_workspaces(), 0);
    assert!(h.log_phases(job_id).iter().any(|p| p == phase::COMPILATION));
}

#[tokio::test]
async fn test_compile_output_is_attached_to_the_log() {
    let h = harness(|config| {
        config.toolchain.install = "ls no-such-dependency".parse().unwrap();
    });
    let job_id = h.add_job("echo hello\n");

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.error_message
            .unwrap()
            .starts_with("Compilation failed: dependency install failed")
    );
    let data = h.entry_data(job_id, phase::COMPILATION).unwrap();
    assert!(
        data["output"]
            .as_str()
            .unwrap()
            .contains("no-such-dependency")
    );
}

#[tokio::test]
async fn test_missing_script_fails_job() {
    let h = harness(|_| {});
    let scraper = h.scraper(None);
    let job_id = h.enqueue(&scraper, |_| {});

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Failed to fetch scraper script")
    );
    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_catalog_failure_fails_job_before_running() {
    let h = harness(|_| {});
    let out = tempfile::tempdir().unwrap();
    let marker = out.path().join("ran");
    let scraper = ScraperDefinition {
        id: Uuid::new_v4(),
        scraper_type: WORKER_TYPE.to_string(),
        script: Some(format!(
            "touch '{}'\necho '{{\"name\":\"A\",\"price\":1}}'\n",
            shell_path(&marker)
        )),
        filter_by_active_brands: true,
        scrape_only_own_products: true,
    };
    h.store.insert_scraper(scraper.clone());
    let job_id = h.enqueue(&scraper, |_| {});
    h.store.fail_catalog_reads(true);

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Failed to fetch catalog filter data")
    );
    assert!(job.error_details.unwrap().contains("catalog unavailable"));
    assert!(!marker.exists());
    assert!(h.store.records().is_empty());
    assert!(!h.log_phases(job_id).iter().any(|p| p == phase::COMPILATION));
    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_concurrent_ticks_process_one_job() {
    let h = harness(|_| {});
    let first = h.add_job("sleep 0.3\necho '{\"name\":\"A\",\"price\":1}'\n");
    let second = h.add_job("echo '{\"name\":\"B\",\"price\":2}'\n");

    let (a, b) = tokio::join!(h.poller.tick(), h.poller.tick());

    let outcomes = [a, b];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, TickOutcome::Processed(_)))
            .count(),
        1
    );
    assert!(outcomes.contains(&TickOutcome::Busy));
    assert_eq!(h.job(first).status, JobStatus::Completed);
    assert_eq!(h.job(second).status, JobStatus::Pending);
}

#[tokio::test]
async fn test_results_are_persisted_in_batches() {
    let h = harness(|config| {
        config.result_batch_size = 100;
        config.result_chunk_size = 100;
    });
    let job_id = h.add_job(
        r#"i=0
while [ $i -lt 250 ]; do
  echo "{\"name\":\"item $i\",\"price\":$i}"
  i=$((i+1))
done
"#,
    );

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.product_count, 250);

    let mut sizes = h.store.insert_call_sizes();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![50, 100, 100]);
    assert_eq!(h.store.records().len(), 250);
}

#[tokio::test]
async fn test_full_batch_is_written_once() {
    let h = harness(|config| {
        config.result_batch_size = 100;
        config.result_chunk_size = 100;
    });
    let job_id = h.add_job(
        r#"i=0
while [ $i -lt 100 ]; do
  echo "{\"name\":\"item $i\",\"price\":$i}"
  i=$((i+1))
done
"#,
    );

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.product_count, 100);
    assert_eq!(h.store.insert_call_sizes(), vec![100]);
}

#[tokio::test]
async fn test_running_count_is_reported_every_ten_records() {
    let h = harness(|_| {});
    let job_id = h.add_job(
        r#"i=0
while [ $i -lt 25 ]; do
  echo "{\"name\":\"item $i\",\"price\":$i}"
  i=$((i+1))
done
"#,
    );

    h.poller.tick().await;

    let counts: Vec<i64> = h
        .store
        .updates(job_id)
        .iter()
        .filter(|update| update.status.is_none())
        .filter_map(|update| update.product_count)
        .collect();
    assert_eq!(counts, vec![10, 20]);
    assert_eq!(h.job(job_id).product_count, 25);
}

#[tokio::test]
async fn test_undecodable_output_lines_do_not_end_the_stream() {
    let h = harness(|_| {});
    let job_id = h.add_job(
        r#"printf 'caf\351 page\n'
printf 'caf\351 page loaded\n' >&2
sleep 0.3
echo '{"name":"A","price":1}'
echo '{"name":"B","price":2}'
echo '{"name":"C","price":3}'
"#,
    );

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.product_count, 3);
    assert_eq!(h.store.records().len(), 3);
}

#[tokio::test]
async fn test_progress_markers_update_counters() {
    let h = harness(|_| {});
    let job_id = h.add_job(
        r#"echo 'PROGRESS: Phase 1: 1/4 categories' >&2
echo 'PROGRESS: Phase 2: 3/7 products' >&2
echo '[PROGRESS] 5/7 products' >&2
"#,
    );

    h.poller.tick().await;

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.current_phase, Some(2));
    assert_eq!(job.current_batch, Some(5));
    assert_eq!(job.total_batches, Some(7));
    assert!(
        h.log_phases(job_id)
            .iter()
            .any(|p| p == phase::PHASE_TRANSITION)
    );
}

#[tokio::test]
async fn test_context_reaches_subprocess() {
    let h = harness(|_| {});
    let out = tempfile::tempdir().unwrap();
    let context_file = out.path().join("context.txt");

    let brand_id = Uuid::new_v4();
    h.store.add_brand(
        h.user_id,
        Brand {
            id: brand_id,
            name: "Acme".to_string(),
        },
    );
    h.store.add_product(
        h.user_id,
        OwnProduct {
            ean: Some("4006381333931".to_string()),
            sku: Some("AC-1".to_string()),
            brand: Some("Acme".to_string()),
            brand_id: Some(brand_id),
        },
    );
    h.store.add_product(
        h.user_id,
        OwnProduct {
            sku: Some("NO-BRAND".to_string()),
            ..OwnProduct::default()
        },
    );

    let script = format!(
        "[ \"$1\" = scrape ] || exit 9\nprintf '%s' \"$2\" > '{}'\n",
        shell_path(&context_file)
    );
    let scraper = ScraperDefinition {
        id: Uuid::new_v4(),
        scraper_type: WORKER_TYPE.to_string(),
        script: Some(script),
        filter_by_active_brands: true,
        scrape_only_own_products: true,
    };
    h.store.insert_scraper(scraper.clone());
    let job_id = h.enqueue(&scraper, |job| job.is_validation_run = true);

    h.poller.tick().await;
    assert_eq!(h.job(job_id).status, JobStatus::Completed);

    let flag = std::fs::read_to_string(&context_file).unwrap();
    let encoded = flag.strip_prefix("--context=").unwrap();
    let context = ScriptContext::decode(encoded).unwrap();

    assert_eq!(context.run_id, job_id);
    assert_eq!(context.user_id, h.user_id);
    assert!(context.is_validation_run);
    assert!(!context.is_test_run);
    assert_eq!(context.active_brand_names, vec!["Acme".to_string()]);
    assert_eq!(context.active_brand_ids, vec![brand_id]);
    assert_eq!(context.own_product_eans, vec!["4006381333931".to_string()]);
    assert_eq!(context.own_product_sku_brands.len(), 1);
    assert_eq!(context.own_product_sku_brands[0].sku, "AC-1");
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_lets_active_job_finish() {
    let h = harness(|_| {});
    let job_id = h.add_job("sleep 0.5\necho '{\"name\":\"A\",\"price\":1}'\n");

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(h.poller.clone().run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();

    let job = h.job(job_id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.product_count, 1);
}
