//! Type definitions for parallel processing
//!
//! Contains data structures for work items, batches, results, messages, and
//! configuration.

use std::time::Duration;

use crate::error::{SluiceError, TaskError};

/// One unit of input, tagged with its position in the submitted sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    pub index: usize,
    pub payload: T,
}

/// An ordered group of work items dispatched together to a batch worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    pub id: u64,
    pub items: Vec<WorkItem<T>>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.items.iter().map(|item| item.index).collect()
    }
}

/// Outcome for exactly one submitted work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult<O> {
    Success { index: usize, output: O },
    Failure { index: usize, error: TaskError },
}

impl<O> TaskResult<O> {
    pub fn index(&self) -> usize {
        match self {
            TaskResult::Success { index, .. } | TaskResult::Failure { index, .. } => *index,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success { .. })
    }

    pub fn output(&self) -> Option<&O> {
        match self {
            TaskResult::Success { output, .. } => Some(output),
            TaskResult::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskResult::Success { .. } => None,
            TaskResult::Failure { error, .. } => Some(error),
        }
    }

    pub fn into_output(self) -> Option<O> {
        match self {
            TaskResult::Success { output, .. } => Some(output),
            TaskResult::Failure { .. } => None,
        }
    }
}

/// Size/time bounds for grouping items before a batch worker call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    /// Measured from the first item entering an empty batch. Zero closes the
    /// batch as soon as the items already queued have been drained.
    pub wait: Duration,
}

impl BatchConfig {
    pub fn new(max_batch_size: usize, wait: Duration) -> Self {
        Self {
            max_batch_size,
            wait,
        }
    }

    pub fn validate(&self) -> Result<(), SluiceError> {
        if self.max_batch_size == 0 {
            return Err(SluiceError::Config(
                "max batch size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 4,
            wait: Duration::from_millis(1000),
        }
    }
}

/// Configuration for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub concurrency_limit: usize,
    pub order_preserving: bool,
    pub tolerate_failures: bool,
    /// Per-invocation limit; a timeout is reported like any other worker failure
    pub timeout: Option<Duration>,
    /// Capacity of the queue between the feeder and the worker pool
    pub buffer_size: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: num_cpus::get(),
            order_preserving: true,
            tolerate_failures: false,
            timeout: None,
            buffer_size: None,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), SluiceError> {
        if self.concurrency_limit == 0 {
            return Err(SluiceError::Config(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(SluiceError::Config(
                "worker timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn queue_bound(&self) -> usize {
        self.buffer_size
            .unwrap_or(self.concurrency_limit * 2)
            .max(1)
    }
}

/// Message type for distributing work to workers
#[derive(Debug)]
pub(crate) enum WorkMessage<T> {
    Single(WorkItem<T>),
    Batch(Batch<T>),
}

impl<T> WorkMessage<T> {
    pub fn indices(&self) -> Vec<usize> {
        match self {
            WorkMessage::Single(item) => vec![item.index],
            WorkMessage::Batch(batch) => batch.indices(),
        }
    }
}

/// Results of one worker invocation, sent from a worker thread to the collector
#[derive(Debug)]
pub(crate) struct UnitResult<O> {
    pub results: Vec<TaskResult<O>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_result_accessors() {
        let ok: TaskResult<u32> = TaskResult::Success {
            index: 3,
            output: 9,
        };
        assert_eq!(ok.index(), 3);
        assert!(ok.is_success());
        assert_eq!(ok.output(), Some(&9));
        assert!(ok.error().is_none());

        let failed: TaskResult<u32> = TaskResult::Failure {
            index: 4,
            error: TaskError::Cancelled,
        };
        assert_eq!(failed.index(), 4);
        assert!(!failed.is_success());
        assert_eq!(failed.error(), Some(&TaskError::Cancelled));
        assert_eq!(failed.into_output(), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(BatchConfig::new(0, Duration::ZERO).validate().is_err());
        assert!(BatchConfig::new(1, Duration::ZERO).validate().is_ok());

        let mut config = DispatchConfig {
            concurrency_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.concurrency_limit = 2;
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_bound(), 4);
        config.timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
