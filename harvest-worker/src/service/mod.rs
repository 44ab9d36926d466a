//! Service layer
//!
//! Services contain the business logic of the worker: building scripts,
//! supervising their subprocess, classifying its output, persisting results,
//! batching job logs and watching memory.

pub mod compiler;
pub mod debug_log;
pub mod log_batcher;
pub mod memory;
pub mod output;
pub mod persister;
pub mod supervisor;

pub use compiler::{CompilationResult, CompileError, Compiler};
pub use debug_log::DebugLog;
pub use log_batcher::{DailyLogFile, JobLogger, LogSettings};
pub use memory::{MemoryBand, MemoryGovernor, MemorySampler, MemoryStats, ProcessMemorySampler};
pub use persister::{PersistError, ResultPersister};
pub use supervisor::{ExecutionOutcome, ExitKind, Supervisor, SupervisorSettings};
