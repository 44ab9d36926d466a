//! Worker configuration
//!
//! Defines all configurable parameters for the worker including polling and
//! health intervals, subprocess and compilation budgets, batching thresholds
//! and the toolchain used to build and run scraper scripts.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// A program plus its fixed arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl FromStr for CommandSpec {
    type Err = anyhow::Error;

    /// Parses a whitespace separated command line (no quoting)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("command cannot be empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

/// Tools used to turn script source into a runnable artifact
#[derive(Debug, Clone)]
pub struct Toolchain {
    /// Installs the fixed dependency manifest inside the workspace
    pub install: CommandSpec,
    /// Transforms the source file into the artifact
    pub transform: CommandSpec,
    /// Command that runs the artifact
    pub runtime: String,
    /// File name the script source is written to
    pub source_file: String,
    /// File name the transform is expected to produce
    pub artifact_file: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            install: CommandSpec::new("npm", &["install", "--no-package-lock", "--no-save"]),
            transform: CommandSpec::new("npx", &["tsc", "--project", "tsconfig.json"]),
            runtime: "node".to_string(),
            source_file: "scraper.ts".to_string(),
            artifact_file: "scraper.js".to_string(),
        }
    }
}

/// What to do with a job whose result batches could not be stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFailurePolicy {
    /// Log lost batches and leave the job status alone
    BestEffort,
    /// Fail the job once this many batches were lost
    FailAfter(usize),
}

impl FromStr for ResultFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "best-effort" {
            return Ok(Self::BestEffort);
        }
        match s.strip_prefix("fail-after:").map(str::parse::<usize>) {
            Some(Ok(n)) if n > 0 => Ok(Self::FailAfter(n)),
            _ => anyhow::bail!(
                "invalid result failure policy '{}', expected 'best-effort' or 'fail-after:N'",
                s
            ),
        }
    }
}

/// Worker configuration
///
/// All timeouts and intervals are configurable so tests can run the full
/// pipeline in milliseconds.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this worker instance
    pub worker_id: String,

    /// Postgres connection string for the job store
    pub database_url: String,

    /// Scraper type this worker claims jobs for
    pub worker_type: String,

    /// How often to poll for a new job
    pub poll_interval: Duration,

    /// How often to report health and force a memory cleanup
    pub health_interval: Duration,

    /// Maximum time a scraper subprocess may run
    pub script_timeout: Duration,

    /// Time between SIGTERM and SIGKILL on timeout
    pub kill_grace_period: Duration,

    /// Budget for dependency install; the transform gets half of what is left
    pub compile_timeout: Duration,

    /// Records buffered before a batch is handed to the persister
    pub result_batch_size: usize,

    /// Rows per insert statement
    pub result_chunk_size: usize,

    /// Attempts per chunk before giving up
    pub result_max_retries: u32,

    /// Fixed delay between chunk attempts
    pub result_retry_delay: Duration,

    pub result_failure_policy: ResultFailurePolicy,

    /// How often pending log entries are flushed to the job store
    pub log_flush_interval: Duration,

    /// Pending log entries that force an immediate flush
    pub log_batch_size: usize,

    /// Maximum length of a job's persisted log array
    pub log_max_entries: usize,

    /// Directory for local log files
    pub log_dir: PathBuf,

    /// Parent directory of per-job workspaces
    pub workspace_root: PathBuf,

    pub toolchain: Toolchain,

    /// Create the tables this worker touches on startup
    pub run_migrations: bool,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, database_url: String) -> Self {
        Self {
            worker_id,
            database_url,
            worker_type: "typescript".to_string(),
            poll_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(60),
            script_timeout: Duration::from_secs(900), // 15 minutes
            kill_grace_period: Duration::from_millis(2000),
            compile_timeout: Duration::from_secs(300),
            result_batch_size: 100,
            result_chunk_size: 50,
            result_max_retries: 3,
            result_retry_delay: Duration::from_millis(1000),
            result_failure_policy: ResultFailurePolicy::BestEffort,
            log_flush_interval: Duration::from_secs(5),
            log_batch_size: 20,
            log_max_entries: 500,
            log_dir: PathBuf::from("logs"),
            workspace_root: std::env::temp_dir(),
            toolchain: Toolchain::default(),
            run_migrations: false,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - DATABASE_URL (required)
    /// - WORKER_ID (optional, default: random uuid)
    /// - WORKER_TYPE (optional, default: typescript)
    /// - POLL_INTERVAL, HEALTH_INTERVAL, SCRIPT_TIMEOUT, COMPILE_TIMEOUT,
    ///   LOG_FLUSH_INTERVAL (optional, seconds)
    /// - KILL_GRACE_PERIOD_MS, RESULT_RETRY_DELAY_MS (optional, milliseconds)
    /// - RESULT_BATCH_SIZE, RESULT_CHUNK_SIZE, RESULT_MAX_RETRIES,
    ///   LOG_BATCH_SIZE, LOG_MAX_ENTRIES (optional)
    /// - RESULT_FAILURE_POLICY (optional, `best-effort` or `fail-after:N`)
    /// - LOG_DIR, WORKSPACE_ROOT (optional, paths)
    /// - TOOLCHAIN_INSTALL, TOOLCHAIN_TRANSFORM, TOOLCHAIN_RUNTIME (optional)
    /// - RUN_MIGRATIONS (optional, `true`/`1`)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable not set"))?;
        let worker_id = lookup("WORKER_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut config = Self::new(worker_id, database_url);

        let secs = |key: &str| {
            lookup(key)
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
        };
        let millis = |key: &str| {
            lookup(key)
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let count = |key: &str| lookup(key).and_then(|s| s.parse::<usize>().ok());

        if let Some(worker_type) = lookup("WORKER_TYPE") {
            config.worker_type = worker_type;
        }
        if let Some(v) = secs("POLL_INTERVAL") {
            config.poll_interval = v;
        }
        if let Some(v) = secs("HEALTH_INTERVAL") {
            config.health_interval = v;
        }
        if let Some(v) = secs("SCRIPT_TIMEOUT") {
            config.script_timeout = v;
        }
        if let Some(v) = millis("KILL_GRACE_PERIOD_MS") {
            config.kill_grace_period = v;
        }
        if let Some(v) = secs("COMPILE_TIMEOUT") {
            config.compile_timeout = v;
        }
        if let Some(v) = count("RESULT_BATCH_SIZE") {
            config.result_batch_size = v;
        }
        if let Some(v) = count("RESULT_CHUNK_SIZE") {
            config.result_chunk_size = v;
        }
        if let Some(v) = lookup("RESULT_MAX_RETRIES").and_then(|s| s.parse::<u32>().ok()) {
            config.result_max_retries = v;
        }
        if let Some(v) = millis("RESULT_RETRY_DELAY_MS") {
            config.result_retry_delay = v;
        }
        if let Some(v) = lookup("RESULT_FAILURE_POLICY") {
            config.result_failure_policy = v.parse()?;
        }
        if let Some(v) = secs("LOG_FLUSH_INTERVAL") {
            config.log_flush_interval = v;
        }
        if let Some(v) = count("LOG_BATCH_SIZE") {
            config.log_batch_size = v;
        }
        if let Some(v) = count("LOG_MAX_ENTRIES") {
            config.log_max_entries = v;
        }
        if let Some(v) = lookup("LOG_DIR") {
            config.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOOLCHAIN_INSTALL") {
            config.toolchain.install = v.parse()?;
        }
        if let Some(v) = lookup("TOOLCHAIN_TRANSFORM") {
            config.toolchain.transform = v.parse()?;
        }
        if let Some(v) = lookup("TOOLCHAIN_RUNTIME") {
            config.toolchain.runtime = v;
        }
        if let Some(v) = lookup("RUN_MIGRATIONS") {
            config.run_migrations = matches!(v.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            anyhow::bail!("database_url must start with postgres:// or postgresql://");
        }

        if self.worker_type.is_empty() {
            anyhow::bail!("worker_type cannot be empty");
        }

        if self.poll_interval.is_zero() || self.health_interval.is_zero() {
            anyhow::bail!("poll_interval and health_interval must be greater than 0");
        }

        if self.script_timeout.is_zero() || self.compile_timeout.is_zero() {
            anyhow::bail!("script_timeout and compile_timeout must be greater than 0");
        }

        if self.result_batch_size == 0 || self.result_chunk_size == 0 {
            anyhow::bail!("result_batch_size and result_chunk_size must be greater than 0");
        }

        if self.result_max_retries == 0 {
            anyhow::bail!("result_max_retries must be greater than 0");
        }

        if self.log_flush_interval.is_zero() {
            anyhow::bail!("log_flush_interval must be greater than 0");
        }

        if self.log_batch_size == 0 || self.log_max_entries == 0 {
            anyhow::bail!("log_batch_size and log_max_entries must be greater than 0");
        }

        if self.toolchain.runtime.is_empty() {
            anyhow::bail!("toolchain runtime cannot be empty");
        }

        Ok(())
    }
}
