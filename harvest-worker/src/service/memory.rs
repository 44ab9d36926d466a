//! Memory governance
//!
//! Samples resident memory of the worker process, keeps a short rolling
//! history and escalates through fixed pressure bands. The worker never
//! terminates itself; at the restart band it runs cleanup hooks and, if that
//! does not help, recommends an external restart.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

pub const WARNING_THRESHOLD_MB: u64 = 800;
pub const CRITICAL_THRESHOLD_MB: u64 = 1200;
pub const RESTART_THRESHOLD_MB: u64 = 1400;

const HISTORY_SIZE: usize = 10;
const MAX_CLEANUP_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryBand {
    Normal,
    Warning,
    Critical,
    Restart,
}

impl MemoryBand {
    /// Thresholds are exclusive: exactly 800 MB is still normal
    pub fn classify(rss_mb: u64) -> Self {
        if rss_mb > RESTART_THRESHOLD_MB {
            MemoryBand::Restart
        } else if rss_mb > CRITICAL_THRESHOLD_MB {
            MemoryBand::Critical
        } else if rss_mb > WARNING_THRESHOLD_MB {
            MemoryBand::Warning
        } else {
            MemoryBand::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryBand::Normal => "normal",
            MemoryBand::Warning => "warning",
            MemoryBand::Critical => "critical",
            MemoryBand::Restart => "restart",
        }
    }
}

impl fmt::Display for MemoryBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Rising,
    Falling,
    Flat,
}

impl Trend {
    /// Strictly monotonic over the last three samples, otherwise flat
    pub fn from_history(history: &[u64]) -> Self {
        match history {
            [.., a, b, c] if c > b && b > a => Trend::Rising,
            [.., a, b, c] if c < b && b < a => Trend::Falling,
            _ => Trend::Flat,
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trend::Rising => "rising",
            Trend::Falling => "falling",
            Trend::Flat => "flat",
        })
    }
}

/// Memory figures in megabytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub rss_mb: u64,
    pub virtual_mb: u64,
}

pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> MemoryStats;
}

/// Reads this process's memory from procfs
pub struct ProcessMemorySampler;

impl MemorySampler for ProcessMemorySampler {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> MemoryStats {
        const MB: u64 = 1024 * 1024;
        match procfs::process::Process::myself().and_then(|p| p.stat()) {
            Ok(stat) => MemoryStats {
                rss_mb: stat.rss * procfs::page_size() / MB,
                virtual_mb: stat.vsize / MB,
            },
            Err(e) => {
                debug!("Failed to read process memory: {}", e);
                MemoryStats::default()
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> MemoryStats {
        MemoryStats::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryStatus {
    pub current: MemoryStats,
    pub average_mb: f64,
    pub trend: Trend,
    pub band: MemoryBand,
}

type CleanupHook = Box<dyn Fn() + Send + Sync>;

struct GovernorState {
    history: VecDeque<u64>,
    cleanup_attempts: u32,
}

pub struct MemoryGovernor {
    sampler: Box<dyn MemorySampler>,
    state: Mutex<GovernorState>,
    hooks: Mutex<Vec<CleanupHook>>,
}

impl MemoryGovernor {
    pub fn new(sampler: impl MemorySampler + 'static) -> Self {
        Self {
            sampler: Box::new(sampler),
            state: Mutex::new(GovernorState {
                history: VecDeque::with_capacity(HISTORY_SIZE),
                cleanup_attempts: 0,
            }),
            hooks: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers work to run on every cleanup pass
    pub fn on_cleanup(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    /// Samples, records and classifies memory, escalating at the restart band
    pub fn check(&self, context: &str) -> MemoryBand {
        let (_, band) = self.record(context);
        match band {
            MemoryBand::Restart => self.escalate(),
            MemoryBand::Normal => self.state().cleanup_attempts = 0,
            _ => {}
        }
        band
    }

    /// Runs the cleanup hooks and records a fresh sample
    pub fn force_cleanup(&self, context: &str) -> MemoryStats {
        debug!("Forcing memory cleanup: {}", context);
        self.run_hooks();
        let (stats, _) = self.record(&format!("After cleanup - {}", context));
        stats
    }

    pub fn status(&self) -> MemoryStatus {
        let current = self.sampler.sample();
        MemoryStatus {
            current,
            average_mb: self.average(),
            trend: self.trend(),
            band: MemoryBand::classify(current.rss_mb),
        }
    }

    pub fn average(&self) -> f64 {
        let state = self.state();
        if state.history.is_empty() {
            return 0.0;
        }
        state.history.iter().sum::<u64>() as f64 / state.history.len() as f64
    }

    pub fn trend(&self) -> Trend {
        let state = self.state();
        let (front, back) = state.history.as_slices();
        let history: Vec<u64> = front.iter().chain(back).copied().collect();
        Trend::from_history(&history)
    }

    /// True when memory is past the restart threshold, or consistently high
    /// and still rising
    pub fn should_restart(&self) -> bool {
        let current = self.sampler.sample();
        current.rss_mb > RESTART_THRESHOLD_MB
            || (self.average() > CRITICAL_THRESHOLD_MB as f64 && self.trend() == Trend::Rising)
    }

    pub fn history(&self) -> Vec<u64> {
        self.state().history.iter().copied().collect()
    }

    fn record(&self, context: &str) -> (MemoryStats, MemoryBand) {
        let stats = self.sampler.sample();
        {
            let mut state = self.state();
            state.history.push_back(stats.rss_mb);
            while state.history.len() > HISTORY_SIZE {
                state.history.pop_front();
            }
        }

        let band = MemoryBand::classify(stats.rss_mb);
        match band {
            MemoryBand::Restart => error!(
                "Memory usage {}MB exceeds restart threshold {}MB ({})",
                stats.rss_mb, RESTART_THRESHOLD_MB, context
            ),
            MemoryBand::Critical => warn!(
                "Critical memory usage: {}MB RSS (threshold {}MB, {})",
                stats.rss_mb, CRITICAL_THRESHOLD_MB, context
            ),
            MemoryBand::Warning => warn!(
                "High memory usage: {}MB RSS (threshold {}MB, {})",
                stats.rss_mb, WARNING_THRESHOLD_MB, context
            ),
            MemoryBand::Normal => debug!(
                "Memory {}: RSS={}MB, virtual={}MB",
                context, stats.rss_mb, stats.virtual_mb
            ),
        }
        (stats, band)
    }

    fn escalate(&self) {
        let attempt = {
            let mut state = self.state();
            if state.cleanup_attempts >= MAX_CLEANUP_ATTEMPTS {
                None
            } else {
                state.cleanup_attempts += 1;
                Some(state.cleanup_attempts)
            }
        };

        let Some(attempt) = attempt else {
            error!(
                "Maximum cleanup attempts ({}) reached; worker continues but may be unstable",
                MAX_CLEANUP_ATTEMPTS
            );
            return;
        };

        info!(
            "Running aggressive memory cleanup (attempt {}/{})",
            attempt, MAX_CLEANUP_ATTEMPTS
        );
        let stats = self.force_cleanup("Critical memory cleanup");
        if stats.rss_mb > RESTART_THRESHOLD_MB {
            error!(
                "Memory still at {}MB after cleanup; restart of the worker process recommended",
                stats.rss_mb
            );
        }
    }

    fn run_hooks(&self) {
        let hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        for hook in hooks.iter() {
            hook();
        }
    }
}
