//! Script compilation
//!
//! Every job is built in its own workspace directory with the same pinned
//! dependency manifest. The toolchain installs the manifest, transforms the
//! source file and must leave the expected artifact behind.

use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CommandSpec, Toolchain};
use crate::service::debug_log::DebugLog;

/// Prefix of every workspace directory created under the workspace root
pub const WORKSPACE_PREFIX: &str = "harvest-ws-";

/// Characters of tool output kept in error details
const MAX_TOOL_OUTPUT: usize = 4000;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to prepare workspace: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("dependency install failed: {summary}")]
    InstallFailed { summary: String, output: String },

    #[error("dependency install timed out after {0} seconds")]
    InstallTimeout(u64),

    #[error("transform failed: {summary}")]
    TransformFailed { summary: String, output: String },

    #[error("transform timed out after {0} seconds")]
    TransformTimeout(u64),

    #[error("expected artifact {} was not produced", .0.display())]
    MissingArtifact(PathBuf),
}

impl CompileError {
    /// Raw tool output, when a tool ran and failed
    pub fn output(&self) -> Option<&str> {
        match self {
            CompileError::InstallFailed { output, .. }
            | CompileError::TransformFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Outcome of compiling one script
#[derive(Debug, Clone)]
pub struct CompilationResult {
    pub success: bool,
    /// Runnable artifact, present only on success
    pub artifact: Option<PathBuf>,
    /// Always set so the caller can remove it
    pub workspace: PathBuf,
    pub error: Option<String>,
    /// Tool output retained for diagnosis
    pub details: Option<String>,
}

enum StepFailure {
    Failed { summary: String, output: String },
    TimedOut(u64),
}

pub struct Compiler {
    workspace_root: PathBuf,
    toolchain: Toolchain,
    timeout: Duration,
    debug_log: Arc<DebugLog>,
    live: Mutex<HashSet<PathBuf>>,
}

impl Compiler {
    pub fn new(
        workspace_root: PathBuf,
        toolchain: Toolchain,
        timeout: Duration,
        debug_log: Arc<DebugLog>,
    ) -> Self {
        Self {
            workspace_root,
            toolchain,
            timeout,
            debug_log,
            live: Mutex::new(HashSet::new()),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds `source` into an artifact inside a fresh workspace
    ///
    /// On failure the workspace has already been removed.
    pub async fn compile(&self, source: &str) -> CompilationResult {
        let workspace = self
            .workspace_root
            .join(format!("{}{}", WORKSPACE_PREFIX, Uuid::new_v4().simple()));
        self.debug_log
            .write(format!("Compiling script in {}", workspace.display()));

        match self.build(&workspace, source).await {
            Ok(artifact) => {
                self.debug_log
                    .write(format!("Compiled artifact {}", artifact.display()));
                CompilationResult {
                    success: true,
                    artifact: Some(artifact),
                    workspace,
                    error: None,
                    details: None,
                }
            }
            Err(e) => {
                self.debug_log.write(format!("Compilation failed: {}", e));
                self.cleanup(&workspace).await;
                CompilationResult {
                    success: false,
                    artifact: None,
                    workspace,
                    error: Some(e.to_string()),
                    details: e.output().map(str::to_string),
                }
            }
        }
    }

    async fn build(&self, workspace: &Path, source: &str) -> Result<PathBuf, CompileError> {
        tokio::fs::create_dir_all(&self.workspace_root).await?;
        self.live().insert(workspace.to_path_buf());
        tokio::fs::create_dir(workspace).await?;

        tokio::fs::write(workspace.join(&self.toolchain.source_file), source).await?;
        tokio::fs::write(workspace.join("package.json"), package_manifest()).await?;
        tokio::fs::write(
            workspace.join("tsconfig.json"),
            transform_config(&self.toolchain.source_file),
        )
        .await?;

        let started = Instant::now();
        run_step(&self.toolchain.install, workspace, self.timeout)
            .await
            .map_err(|failure| match failure {
                StepFailure::Failed { summary, output } => {
                    CompileError::InstallFailed { summary, output }
                }
                StepFailure::TimedOut(secs) => CompileError::InstallTimeout(secs),
            })?;
        debug!("Dependencies installed in {:?}", started.elapsed());

        let transform_budget = self.timeout.saturating_sub(started.elapsed()) / 2;
        run_step(&self.toolchain.transform, workspace, transform_budget)
            .await
            .map_err(|failure| match failure {
                StepFailure::Failed { summary, output } => {
                    CompileError::TransformFailed { summary, output }
                }
                StepFailure::TimedOut(secs) => CompileError::TransformTimeout(secs),
            })?;

        let artifact = workspace.join(&self.toolchain.artifact_file);
        if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            return Err(CompileError::MissingArtifact(artifact));
        }
        Ok(artifact)
    }

    /// Removes a workspace; missing directories are fine
    pub async fn cleanup(&self, workspace: &Path) {
        self.live().remove(workspace);
        match tokio::fs::remove_dir_all(workspace).await {
            Ok(()) => self
                .debug_log
                .write(format!("Removed workspace {}", workspace.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", workspace.display(), e),
        }
    }

    /// Removes leftover workspaces that no running job owns
    pub fn sweep_stale(&self) -> usize {
        let entries = match std::fs::read_dir(&self.workspace_root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(
                    "Cannot scan workspace root {}: {}",
                    self.workspace_root.display(),
                    e
                );
                return 0;
            }
        };

        let live = self.live().clone();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_workspace = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(WORKSPACE_PREFIX));
            if !is_workspace || !path.is_dir() || live.contains(&path) {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove stale workspace {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!("Removed {} stale workspace(s)", removed);
            self.debug_log
                .write(format!("Swept {} stale workspace(s)", removed));
        }
        removed
    }

    /// Runs [`Compiler::sweep_stale`] on the blocking pool
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<usize> {
        let compiler = Arc::clone(self);
        tokio::task::spawn_blocking(move || compiler.sweep_stale())
    }
}

async fn run_step(spec: &CommandSpec, dir: &Path, budget: Duration) -> Result<Output, StepFailure> {
    debug!(
        "Running {} {} in {} (budget {:?})",
        spec.program,
        spec.args.join(" "),
        dir.display(),
        budget
    );

    let child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(budget, child).await {
        Ok(Ok(output)) if output.status.success() => Ok(output),
        Ok(Ok(output)) => {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            let summary = String::from_utf8_lossy(&output.stderr)
                .lines()
                .chain(String::from_utf8_lossy(&output.stdout).lines())
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| match output.status.code() {
                    Some(code) => format!("{} exited with code {}", spec.program, code),
                    None => format!("{} was terminated by a signal", spec.program),
                });
            Err(StepFailure::Failed {
                summary,
                output: tail_chars(&combined, MAX_TOOL_OUTPUT),
            })
        }
        Ok(Err(e)) => Err(StepFailure::Failed {
            summary: format!("failed to run {}: {}", spec.program, e),
            output: String::new(),
        }),
        Err(_) => Err(StepFailure::TimedOut(budget.as_secs())),
    }
}

/// Keeps the last `max` characters, where tool errors usually are
fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

/// Dependency manifest written into every workspace
fn package_manifest() -> String {
    json!({
        "name": "harvest-scraper",
        "version": "1.0.0",
        "private": true,
        "dependencies": {
            "crawlee": "3.13.3",
            "playwright": "1.52.0",
            "node-fetch": "2.7.0",
            "jsdom": "21.1.2",
            "yargs": "17.7.2",
            "fast-xml-parser": "5.2.3",
            "typescript": "5.8.3",
            "@types/node": "18.19.100"
        }
    })
    .to_string()
}

/// Permissive transform settings; type errors do not block emitting
fn transform_config(source_file: &str) -> String {
    json!({
        "compilerOptions": {
            "target": "ES2020",
            "module": "CommonJS",
            "moduleResolution": "Node",
            "esModuleInterop": true,
            "skipLibCheck": true,
            "resolveJsonModule": true,
            "outDir": ".",
            "allowJs": true,
            "strict": false,
            "noEmitOnError": false,
            "sourceMap": false
        },
        "include": [source_file],
        "exclude": ["node_modules"]
    })
    .to_string()
}
