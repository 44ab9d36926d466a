//! Startup debug log
//!
//! A plain-text file truncated at every start that records compiler and
//! cleanup diagnostics, useful when the job store itself is unreachable.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

pub const DEBUG_LOG_FILE: &str = "worker-debug.log";

pub struct DebugLog {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl DebugLog {
    /// Creates `dir` if needed and truncates the debug log inside it
    pub fn init(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DEBUG_LOG_FILE);
        let mut file = File::create(&path)?;
        writeln!(
            file,
            "Worker debug log started at {}",
            chrono::Utc::now().to_rfc3339()
        )?;

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path: Some(path),
            file: Mutex::new(Some(file)),
        })
    }

    /// A debug log that only forwards to tracing
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn write(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!("{}", message);

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = file.as_mut() {
            let line = format!("{} - {}\n", chrono::Utc::now().to_rfc3339(), message);
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!("Failed to write to debug log: {}", e);
            }
        }
    }
}
