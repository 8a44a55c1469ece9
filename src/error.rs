//! Error taxonomy for sluice
//!
//! Fatal errors (`SourceRead`, `Storage`, `Aborted`, `Config`) propagate and
//! end the run. Per-item failures are carried as data in
//! [`TaskResult::Failure`](crate::parallel::TaskResult) using [`TaskError`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single work item (or of the batch that contained it)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{0}")]
    Worker(String),

    #[error("timed out after {}", fmt_duration(.0))]
    Timeout(Duration),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("cancelled before completion")]
    Cancelled,

    #[error("batch worker returned {actual} outputs for {expected} inputs")]
    BatchShape { expected: usize, actual: usize },
}

fn fmt_duration(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

impl TaskError {
    pub fn from_worker(err: anyhow::Error) -> Self {
        TaskError::Worker(format!("{:#}", err))
    }

    /// Timeouts count as worker failures; this only distinguishes them for reporting
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum SluiceError {
    #[error("failed to read work source '{}': {source}", path.display())]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid work source pattern '{pattern}': {message}")]
    SourcePattern { pattern: String, message: String },

    #[error("run aborted at item {index} after {completed} results: {error}")]
    Aborted {
        index: usize,
        completed: usize,
        error: TaskError,
    },

    #[error("result sink failed")]
    Sink(#[source] anyhow::Error),

    #[error("storage error for '{key}': {message}")]
    Storage { key: String, message: String },

    #[error("stored snapshot '{key}' is corrupt")]
    CorruptSnapshot {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("notification to '{recipient}' failed: {message}")]
    Notification { recipient: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("batcher is closed")]
    BatcherClosed,
}

impl SluiceError {
    pub fn storage(key: &str, message: impl std::fmt::Display) -> Self {
        SluiceError::Storage {
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether the error ends the whole run rather than one reconciliation step
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SluiceError::Notification { .. })
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;
