//! Periodic health report
//!
//! Runs independently of job activity so a wedged worker still reports how
//! long it has been idle and where its memory stands.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scheduler::JobPoller;

pub async fn run(poller: Arc<JobPoller>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => report(&poller),
        }
    }
    debug!("Health loop stopped");
}

/// Logs activity and memory, then forces a cleanup pass
pub fn report(poller: &JobPoller) {
    let governor = poller.governor();
    let status = governor.status();

    match poller.active_job() {
        Some(job_id) => info!(
            "Health: processing job {} (rss {} MB, avg {:.0} MB, trend {}, band {})",
            job_id, status.current.rss_mb, status.average_mb, status.trend, status.band
        ),
        None => info!(
            "Health: idle for {}s (rss {} MB, avg {:.0} MB, trend {}, band {})",
            poller.idle_for().as_secs(),
            status.current.rss_mb,
            status.average_mb,
            status.trend,
            status.band
        ),
    }

    let after = governor.force_cleanup("health check");
    if governor.should_restart() {
        warn!(
            "Memory still at {} MB after cleanup, an external restart is recommended",
            after.rss_mb
        );
    }
}
