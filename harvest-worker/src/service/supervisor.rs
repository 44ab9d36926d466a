//! Subprocess supervision
//!
//! Runs a compiled artifact, turns its output streams into records, progress
//! updates and log entries, enforces the execution timeout and classifies how
//! the process ended.

use harvest_core::domain::job::{Job, JobStatus, JobUpdate};
use harvest_core::domain::log::{LogLevel, phase};
use harvest_core::domain::record::ScrapedRecord;
use harvest_core::domain::script::ScriptContext;
use nix::sys::signal::{Signal, killpg};
use serde_json::json;
use nix::unistd::Pid;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::repository::{JobRepository, ResultScope};
use crate::service::log_batcher::JobLogger;
use crate::service::output::{
    ErrorSummary, Progress, StderrLine, StdoutLine, classify_stderr, classify_stdout,
};
use crate::service::persister::{PersistError, ResultPersister};

/// Records between running product-count updates
const PRODUCT_COUNT_INTERVAL: i64 = 10;

/// Result batches being stored at once; reading stdout pauses beyond this
const MAX_IN_FLIGHT_PERSISTS: usize = 4;

/// How long to keep reading after exit when a stream stays open
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Literal mode argument passed to every artifact
pub const SCRAPE_MODE: &str = "scrape";

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub batch_size: usize,
}

/// How the subprocess ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
    TimedOut { secs: u64 },
    SpawnFailed(String),
}

/// Latest progress counters reported by the script
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub phase: Option<i32>,
    pub current_batch: Option<i32>,
    pub total_batches: Option<i32>,
}

impl ProgressState {
    /// Applies a marker, returning the job update it implies
    fn apply(&mut self, progress: &Progress) -> Option<JobUpdate> {
        if let Some(phase) = progress.phase {
            self.phase = Some(phase);
        }
        match progress.batch {
            Some((current, total)) => {
                self.current_batch = Some(current);
                self.total_batches = Some(total);
                Some(JobUpdate::default().progress(progress.phase, current, total))
            }
            None => progress.phase.map(|phase| JobUpdate {
                current_phase: Some(phase),
                ..JobUpdate::default()
            }),
        }
    }

    /// Adds the counters to a final job update
    pub fn fill(&self, mut update: JobUpdate) -> JobUpdate {
        update.current_phase = self.phase.or(update.current_phase);
        update.current_batch = self.current_batch.or(update.current_batch);
        update.total_batches = self.total_batches.or(update.total_batches);
        update
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub exit: ExitKind,
    pub product_count: i64,
    pub progress: ProgressState,
    /// Result batches that could not be stored
    pub failed_batches: usize,
}

/// Maps how the process ended to a job status and error texts
///
/// Diagnostic runs (test or validation) that exit 0 complete even when
/// stderr carried errors.
pub fn classify_exit(
    exit: &ExitKind,
    summary: &ErrorSummary,
    is_diagnostic: bool,
) -> (JobStatus, Option<String>, Option<String>) {
    let errors = summary.has_errors().then(|| summary.all_errors());
    match exit {
        ExitKind::SpawnFailed(reason) => (
            JobStatus::Failed,
            Some(format!("Failed to start subprocess: {}", reason)),
            None,
        ),
        ExitKind::TimedOut { secs } => (
            JobStatus::Failed,
            Some(format!("Script execution timed out after {} seconds", secs)),
            errors,
        ),
        ExitKind::Exited(0) if !summary.has_errors() => (JobStatus::Completed, None, None),
        ExitKind::Exited(0) if is_diagnostic => (JobStatus::Completed, None, errors),
        ExitKind::Exited(0) => (
            JobStatus::Failed,
            summary.first_error().map(str::to_string),
            errors,
        ),
        ExitKind::Exited(code) => (
            JobStatus::Failed,
            Some(summary.failure_message(*code)),
            Some(summary.exit_details(*code)),
        ),
        ExitKind::Signaled(signal) => (
            JobStatus::Failed,
            Some(
                summary
                    .first_error()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Script was terminated by signal {}", signal)),
            ),
            errors,
        ),
    }
}

fn exit_kind(status: ExitStatus) -> ExitKind {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitKind::Exited(code),
        None => ExitKind::Signaled(status.signal().unwrap_or_default()),
    }
}

/// Mutable bookkeeping of one run
struct RunState {
    buffer: Vec<ScrapedRecord>,
    product_count: i64,
    summary: ErrorSummary,
    progress: ProgressState,
    failed_batches: usize,
}

pub struct Supervisor {
    runtime: String,
    settings: SupervisorSettings,
    persister: Arc<ResultPersister>,
    jobs: Arc<dyn JobRepository>,
}

impl Supervisor {
    pub fn new(
        runtime: String,
        settings: SupervisorSettings,
        persister: Arc<ResultPersister>,
        jobs: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            runtime,
            settings,
            persister,
            jobs,
        }
    }

    pub async fn run(
        &self,
        artifact: &Path,
        job: &Job,
        context: &ScriptContext,
        logger: &JobLogger,
    ) -> ExecutionOutcome {
        let mut state = RunState {
            buffer: Vec::with_capacity(self.settings.batch_size),
            product_count: 0,
            summary: ErrorSummary::new(),
            progress: ProgressState::default(),
            failed_batches: 0,
        };

        let exit = match self.spawn(artifact, context) {
            Ok(child) => {
                logger
                    .info(
                        phase::SUBPROCESS_EXEC,
                        format!("Executing {} with {}", artifact.display(), self.runtime),
                    )
                    .await;
                self.supervise(child, job, logger, &mut state).await
            }
            Err(reason) => {
                logger
                    .error(
                        phase::SUBPROCESS_ERROR,
                        format!("Failed to start subprocess: {}", reason),
                    )
                    .await;
                ExitKind::SpawnFailed(reason)
            }
        };

        let (status, error_message, error_details) =
            classify_exit(&exit, &state.summary, job.is_diagnostic());
        if status == JobStatus::Failed
            && let Some(details) = &error_details
        {
            logger
                .log_with(
                    LogLevel::Error,
                    phase::SUBPROCESS_ERROR,
                    error_message.as_deref().unwrap_or("Script failed"),
                    json!({ "details": details }),
                )
                .await;
        }

        ExecutionOutcome {
            status,
            error_message,
            error_details,
            exit,
            product_count: state.product_count,
            progress: state.progress,
            failed_batches: state.failed_batches,
        }
    }

    fn spawn(&self, artifact: &Path, context: &ScriptContext) -> Result<Child, String> {
        let encoded = context
            .encode()
            .map_err(|e| format!("failed to encode script context: {}", e))?;
        let workdir = artifact.parent().unwrap_or_else(|| Path::new("."));

        Command::new(&self.runtime)
            .arg(artifact)
            .arg(SCRAPE_MODE)
            .arg(format!("--context={}", encoded))
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| e.to_string())
    }

    async fn supervise(
        &self,
        mut child: Child,
        job: &Job,
        logger: &JobLogger,
        state: &mut RunState,
    ) -> ExitKind {
        let scope = ResultScope {
            run_id: job.id,
            user_id: job.user_id,
            competitor_id: job.competitor_id,
        };

        // The script gets no input; closing stdin signals EOF
        drop(child.stdin.take());
        let pid = child.id();

        let mut stdout = child.stdout.take().map(LineReader::new);
        let mut stderr = child.stderr.take().map(LineReader::new);

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let updater = tokio::spawn(apply_updates(
            self.jobs.clone(),
            job.id,
            update_rx,
            logger.clone(),
        ));
        let mut persists: JoinSet<Result<usize, PersistError>> = JoinSet::new();

        let deadline = tokio::time::sleep(self.settings.timeout);
        tokio::pin!(deadline);
        let drain = tokio::time::sleep(Duration::MAX);
        tokio::pin!(drain);

        let mut exit: Option<ExitKind> = None;

        loop {
            if exit.is_some() && stdout.is_none() && stderr.is_none() {
                break;
            }

            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => {
                        self.on_stdout(&line, scope, logger, state, &update_tx, &mut persists)
                            .await
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => self.on_stderr(&line, logger, state, &update_tx).await,
                    None => stderr = None,
                },
                status = child.wait(), if exit.is_none() => {
                    exit = Some(match status {
                        Ok(status) => exit_kind(status),
                        Err(e) => ExitKind::SpawnFailed(e.to_string()),
                    });
                    drain.as_mut().reset(Instant::now() + DRAIN_TIMEOUT);
                },
                _ = &mut deadline, if exit.is_none() => {
                    let secs = self.settings.timeout.as_secs();
                    logger
                        .error(
                            phase::JOB_TIMEOUT,
                            format!("Script execution timed out after {} seconds", secs),
                        )
                        .await;
                    self.terminate(&mut child, pid).await;
                    exit = Some(ExitKind::TimedOut { secs });
                    drain.as_mut().reset(Instant::now() + DRAIN_TIMEOUT);
                },
                _ = &mut drain, if exit.is_some() => {
                    warn!(job_id = %job.id, "Output streams still open after exit, abandoning them");
                    break;
                },
                Some(result) = persists.join_next(), if !persists.is_empty() => {
                    record_persist(result, state);
                },
            }
        }

        if let Some(exit) = &exit {
            let message = match exit {
                ExitKind::Exited(code) => format!("Script finished with exit code: {}", code),
                ExitKind::Signaled(signal) => format!("Script terminated by signal {}", signal),
                ExitKind::TimedOut { .. } => "Script terminated after timeout".to_string(),
                ExitKind::SpawnFailed(reason) => format!("Failed waiting for script: {}", reason),
            };
            logger.info(phase::SUBPROCESS_EXEC, message).await;
        }

        if !state.buffer.is_empty() {
            wait_for_slot(&mut persists, MAX_IN_FLIGHT_PERSISTS, |result| {
                record_persist(result, state)
            })
            .await;
            let batch = std::mem::take(&mut state.buffer);
            logger
                .info(
                    phase::DB_BATCH_SAVE,
                    format!("Saving final batch of {} products", batch.len()),
                )
                .await;
            self.spawn_persist(batch, scope, logger, &mut persists);
        }
        while let Some(result) = persists.join_next().await {
            record_persist(result, state);
        }

        drop(update_tx);
        if let Err(e) = updater.await {
            warn!(job_id = %job.id, "Progress updater ended abnormally: {}", e);
        }

        exit.unwrap_or_else(|| ExitKind::SpawnFailed("process exit status unknown".to_string()))
    }

    async fn on_stdout(
        &self,
        line: &str,
        scope: ResultScope,
        logger: &JobLogger,
        state: &mut RunState,
        updates: &mpsc::UnboundedSender<JobUpdate>,
        persists: &mut JoinSet<Result<usize, PersistError>>,
    ) {
        match classify_stdout(line) {
            None => {}
            Some(StdoutLine::Record(record)) => {
                state.buffer.push(record);
                state.product_count += 1;

                if state.product_count % PRODUCT_COUNT_INTERVAL == 0 {
                    let _ = updates.send(JobUpdate::default().product_count(state.product_count));
                }
                if state.buffer.len() >= self.settings.batch_size {
                    wait_for_slot(persists, MAX_IN_FLIGHT_PERSISTS, |result| {
                        record_persist(result, state)
                    })
                    .await;
                    let batch = std::mem::take(&mut state.buffer);
                    logger
                        .info(
                            phase::DB_BATCH_SAVE,
                            format!("Saving batch of {} products", batch.len()),
                        )
                        .await;
                    self.spawn_persist(batch, scope, logger, persists);
                }
            }
            Some(StdoutLine::Invalid(raw)) => {
                let preview: String = raw.chars().take(100).collect();
                logger
                    .warn(
                        phase::SCRIPT_STDOUT,
                        format!("Skipping invalid product JSON: {}", preview),
                    )
                    .await;
            }
            Some(StdoutLine::Log { level, message }) => {
                logger.log(level, phase::SCRIPT_STDOUT, message).await;
            }
            Some(StdoutLine::Noise(message)) => {
                logger.log(LogLevel::Debug, phase::SCRIPT_STDOUT, message).await;
            }
        }
    }

    async fn on_stderr(
        &self,
        line: &str,
        logger: &JobLogger,
        state: &mut RunState,
        updates: &mpsc::UnboundedSender<JobUpdate>,
    ) {
        let Some(classified) = classify_stderr(line) else {
            return;
        };
        state.summary.observe(line, &classified);

        match classified {
            StderrLine::Progress(progress) => {
                if let Some(number) = progress.phase
                    && state.progress.phase != Some(number)
                {
                    logger
                        .info(phase::PHASE_TRANSITION, format!("Entering phase {}", number))
                        .await;
                }
                if let Some(update) = state.progress.apply(&progress) {
                    let _ = updates.send(update);
                }
                logger.info(phase::SCRIPT_PROGRESS, progress.message).await;
            }
            StderrLine::ScriptError(message) => {
                logger.error(phase::SCRIPT_LOG, message).await;
            }
            StderrLine::ErrorLike(message) => {
                logger.warn(phase::SCRIPT_STDERR, message).await;
            }
            StderrLine::Debug(message) => {
                logger.log(LogLevel::Debug, phase::SCRIPT_STDERR, message).await;
            }
        }
    }

    fn spawn_persist(
        &self,
        batch: Vec<ScrapedRecord>,
        scope: ResultScope,
        logger: &JobLogger,
        persists: &mut JoinSet<Result<usize, PersistError>>,
    ) {
        let persister = self.persister.clone();
        let logger = logger.clone();
        persists.spawn(async move {
            let result = persister.persist(&scope, &batch, &logger).await;
            match &result {
                Ok(inserted) => {
                    logger
                        .info(
                            phase::DB_BATCH_SAVE,
                            format!("Successfully inserted batch of {} products", inserted),
                        )
                        .await
                }
                Err(e) => {
                    logger
                        .error(
                            phase::DB_BATCH_SAVE,
                            format!("Failed to save product batch: {}", e),
                        )
                        .await
                }
            }
            result
        });
    }

    /// SIGTERM to the process group, then SIGKILL once the grace period ends
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGTERM);
        }

        match tokio::time::timeout(self.settings.kill_grace, child.wait()).await {
            Ok(Ok(status)) => debug!("Script exited after SIGTERM: {}", status),
            _ => {
                if let Some(pid) = pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                if let Err(e) = child.start_kill() {
                    debug!("start_kill after SIGKILL: {}", e);
                }
                if let Err(e) = child.wait().await {
                    warn!("Failed to reap killed script: {}", e);
                }
            }
        }
    }
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        debug!("Failed to send {} to process group {}: {}", signal, raw, e);
    }
}

/// Newline-delimited reader that never rejects a line for its encoding
///
/// Invalid UTF-8 is replaced rather than treated as a read error, so one
/// badly encoded line does not close the pipe. Bytes of a partially read line
/// stay in `buf`, which keeps `next_line` usable inside `select!`.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator; `None` at end of stream
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}

/// Next line of an open stream; read errors end the stream
async fn next_line<R>(lines: &mut Option<LineReader<R>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                debug!("Stream read failed: {}", e);
                None
            }
        },
        None => std::future::pending().await,
    }
}

/// Reaps finished tasks until fewer than `limit` are running
async fn wait_for_slot<T: 'static>(
    set: &mut JoinSet<T>,
    limit: usize,
    mut on_done: impl FnMut(Result<T, tokio::task::JoinError>),
) {
    while set.len() >= limit.max(1) {
        match set.join_next().await {
            Some(result) => on_done(result),
            None => break,
        }
    }
}

fn record_persist(
    result: Result<Result<usize, PersistError>, tokio::task::JoinError>,
    state: &mut RunState,
) {
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => state.failed_batches += 1,
        Err(e) => {
            warn!("Persist task ended abnormally: {}", e);
            state.failed_batches += 1;
        }
    }
}

async fn apply_updates(
    jobs: Arc<dyn JobRepository>,
    job_id: uuid::Uuid,
    mut updates: mpsc::UnboundedReceiver<JobUpdate>,
    logger: JobLogger,
) {
    while let Some(update) = updates.recv().await {
        if let Err(e) = jobs.update_job(job_id, update).await {
            logger
                .warn(
                    phase::PROGRESS_UPDATE,
                    format!("Failed to update progress: {:#}", e),
                )
                .await;
        }
    }
}
