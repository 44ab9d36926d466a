//! Subprocess output classification
//!
//! Scraper scripts interleave result records with framework chatter on stdout
//! and use stderr for progress markers, explicit errors and everything else.
//! Each stream gets a small classifier so the heuristics can be tested one
//! pattern at a time.

use harvest_core::domain::log::LogLevel;
use harvest_core::domain::record::ScrapedRecord;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::LazyLock;

// Pre-compiled patterns for stderr progress markers
static RE_PHASE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Phase\s+(\d+)\b").unwrap());
static RE_BATCH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s*/\s*(\d+)").unwrap());

// Heuristics for error-like stderr text, checked in order
static ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"is not defined",
        r"(?i)cannot find module",
        r"^(TypeError|ReferenceError|SyntaxError|RangeError)\b",
        r"(?i)unhandled(\s*promise)?\s*rejection",
        r"^\s*at\s+.*\(?[^\s()]+:\d+:\d+\)?$",
        r"^Traceback \(most recent call last\)",
        r"^[A-Z][A-Za-z]*(Error|Exception):",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

// Runtime-error phrases looked for in the raw stderr buffer on non-zero exit
static RE_RUNTIME_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Error:|Exception|panic|Traceback").unwrap());

/// Raw stderr lines kept for failure reports
const STDERR_TAIL_LINES: usize = 200;

/// Accumulated error lines kept per kind
const MAX_ACCUMULATED_ERRORS: usize = 100;

/// Stderr lines quoted in non-zero exit details
const DETAIL_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum StdoutLine {
    Record(ScrapedRecord),
    /// JSON object that is not a valid record
    Invalid(String),
    Log { level: LogLevel, message: String },
    Noise(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub phase: Option<i32>,
    pub batch: Option<(i32, i32)>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StderrLine {
    Progress(Progress),
    /// Error reported by the script itself with an `ERROR:` prefix
    ScriptError(String),
    /// Text that looks like a runtime error
    ErrorLike(String),
    Debug(String),
}

/// Classifies one stdout line; blank lines yield `None`
pub fn classify_stdout(line: &str) -> Option<StdoutLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.starts_with('{') {
        return Some(match ScrapedRecord::from_line(line) {
            Some(record) => StdoutLine::Record(record),
            None => StdoutLine::Invalid(line.to_string()),
        });
    }

    let level = if line.starts_with("DEBUG") {
        Some(LogLevel::Debug)
    } else if line.starts_with("INFO") || line.starts_with("PROGRESS:") {
        Some(LogLevel::Info)
    } else if line.starts_with("WARN") {
        Some(LogLevel::Warning)
    } else if line.starts_with("ERROR") {
        Some(LogLevel::Error)
    } else {
        None
    };

    Some(match level {
        Some(level) => StdoutLine::Log {
            level,
            message: line.to_string(),
        },
        None => StdoutLine::Noise(line.to_string()),
    })
}

/// Classifies one stderr line; blank lines yield `None`
pub fn classify_stderr(line: &str) -> Option<StderrLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line
        .strip_prefix("PROGRESS:")
        .or_else(|| line.strip_prefix("[PROGRESS]"))
    {
        return Some(StderrLine::Progress(parse_progress(rest.trim())));
    }

    if let Some(rest) = line.strip_prefix("ERROR:") {
        return Some(StderrLine::ScriptError(rest.trim().to_string()));
    }

    if is_error_like(line) {
        return Some(StderrLine::ErrorLike(line.to_string()));
    }

    Some(StderrLine::Debug(line.to_string()))
}

pub fn is_error_like(line: &str) -> bool {
    ERROR_PATTERNS.iter().any(|re| re.is_match(line))
}

fn parse_progress(message: &str) -> Progress {
    let phase = RE_PHASE
        .captures(message)
        .and_then(|c| c[1].parse::<i32>().ok());
    let batch = RE_BATCH.captures(message).and_then(|c| {
        let current = c[1].parse::<i32>().ok()?;
        let total = c[2].parse::<i32>().ok()?;
        Some((current, total))
    });
    Progress {
        phase,
        batch,
        message: message.to_string(),
    }
}

/// Error evidence gathered from a run's stderr
#[derive(Debug, Clone, Default)]
pub struct ErrorSummary {
    script_errors: Vec<String>,
    heuristic_errors: Vec<String>,
    stderr_tail: VecDeque<String>,
}

impl ErrorSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a raw stderr line together with its classification
    pub fn observe(&mut self, raw: &str, line: &StderrLine) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }

        self.stderr_tail.push_back(raw.to_string());
        if self.stderr_tail.len() > STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }

        match line {
            StderrLine::ScriptError(message) if self.script_errors.len() < MAX_ACCUMULATED_ERRORS => {
                self.script_errors.push(message.clone())
            }
            StderrLine::ErrorLike(message)
                if self.heuristic_errors.len() < MAX_ACCUMULATED_ERRORS =>
            {
                self.heuristic_errors.push(message.clone())
            }
            _ => {}
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.script_errors.is_empty() || !self.heuristic_errors.is_empty()
    }

    /// First script-reported error, else first heuristic match
    pub fn first_error(&self) -> Option<&str> {
        self.script_errors
            .first()
            .or_else(|| self.heuristic_errors.first())
            .map(String::as_str)
    }

    /// Every accumulated error, script-reported first
    pub fn all_errors(&self) -> String {
        self.script_errors
            .iter()
            .chain(&self.heuristic_errors)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Primary message for a non-zero exit
    ///
    /// Precedence: first script-reported error, first heuristic match, first
    /// raw stderr line containing a runtime-error phrase, generic message.
    pub fn failure_message(&self, exit_code: i32) -> String {
        if let Some(error) = self.first_error() {
            return error.to_string();
        }
        if let Some(line) = self.stderr_tail.iter().find(|l| RE_RUNTIME_ERROR.is_match(l)) {
            return line.clone();
        }
        format!("Script exited with non-zero exit code {}", exit_code)
    }

    /// Accumulated errors followed by the last few raw stderr lines
    pub fn exit_details(&self, exit_code: i32) -> String {
        let start = self.stderr_tail.len().saturating_sub(DETAIL_TAIL_LINES);
        let tail: Vec<&str> = self
            .stderr_tail
            .iter()
            .skip(start)
            .map(String::as_str)
            .collect();

        let mut details = format!("Exit code: {}", exit_code);
        if self.has_errors() {
            details.push_str("\n---\nErrors:\n");
            details.push_str(&self.all_errors());
        }
        if !tail.is_empty() {
            details.push_str("\n---\nLast stderr lines:\n");
            details.push_str(&tail.join("\n"));
        }
        details
    }
}
