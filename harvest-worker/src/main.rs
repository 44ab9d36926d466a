//! Harvest Worker
//!
//! Claims scraper jobs from the shared job store and executes them one at a
//! time. See the library crate for the architecture.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harvest_worker::config::Config;
use harvest_worker::db;
use harvest_worker::repository::{PgCatalogRepository, PgJobRepository, PgResultRepository};
use harvest_worker::scheduler::JobPoller;
use harvest_worker::service::{
    Compiler, DailyLogFile, DebugLog, MemoryGovernor, ProcessMemorySampler,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harvest_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Harvest Worker");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    info!(
        "Loaded configuration: worker_id={}, worker_type={}",
        config.worker_id, config.worker_type
    );

    let pool = connect_with_retry(&config.database_url).await?;
    if config.run_migrations {
        db::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations applied");
    }

    let debug_log = match DebugLog::init(&config.log_dir) {
        Ok(log) => log,
        Err(e) => {
            warn!("Failed to open debug log in {}: {}", config.log_dir.display(), e);
            DebugLog::disabled()
        }
    };
    let log_file = Arc::new(DailyLogFile::new(&config.log_dir));
    info!("Job logs written to {}", log_file.dir().display());

    let compiler = Arc::new(Compiler::new(
        config.workspace_root.clone(),
        config.toolchain.clone(),
        config.compile_timeout,
        Arc::new(debug_log),
    ));
    match compiler.spawn_sweep().await {
        Ok(swept) if swept > 0 => info!("Removed {} stale workspace(s) at startup", swept),
        Ok(_) => {}
        Err(e) => warn!("Startup workspace sweep did not finish: {}", e),
    }

    let governor = Arc::new(MemoryGovernor::new(ProcessMemorySampler));
    {
        let compiler = Arc::clone(&compiler);
        // Runs from async contexts; the sweep itself touches the filesystem
        governor.on_cleanup(move || {
            drop(compiler.spawn_sweep());
        });
    }

    let poller = Arc::new(JobPoller::new(
        config.clone(),
        Arc::new(PgJobRepository::new(pool.clone())),
        Arc::new(PgCatalogRepository::new(pool.clone())),
        Arc::new(PgResultRepository::new(pool.clone())),
        compiler,
        governor,
        log_file,
    ));

    info!("Worker initialized successfully");
    info!(
        "Poll interval: {:?}, health interval: {:?}, script timeout: {:?}",
        config.poll_interval, config.health_interval, config.script_timeout
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    poller.run(shutdown).await;
    pool.close().await;
    info!("Harvest Worker stopped");

    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}

/// Connect to the job store with retry logic and exponential backoff
///
/// The database may not be ready yet when the worker starts (common in
/// container environments).
async fn connect_with_retry(database_url: &str) -> Result<PgPool> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match db::create_pool(database_url).await {
            Ok(pool) => {
                if attempt > 1 {
                    info!("Connected to database after {} attempt(s)", attempt);
                } else {
                    info!("Database connection pool created");
                }
                return Ok(pool);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to connect to database after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Failed to connect to database: {}", e));
                }

                warn!(
                    "Failed to connect to database (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
