//! Parallel processing module for sluice
//!
//! Bounded concurrent execution of a worker over a list of items, with
//! optional size/time batching in front of batch-shaped workers.
//!
//! # Module Structure
//!
//! - `types`: Work items, batches, results, and configuration
//! - `batching`: Size/time-bounded batcher thread
//! - `worker`: Worker capability, worker pool threads, timeouts, cancellation
//! - `tracker`: Thread-safe run counters
//! - `sink`: Result sinks and ordered delivery
//! - `processor`: Main `Dispatcher` orchestration

mod batching;
mod processor;
mod sink;
mod tracker;
mod types;
mod worker;

// Re-export public types
pub use batching::{Batcher, BatcherStats, ItemHandle};
pub use processor::{run, Dispatcher};
pub use sink::{CollectingSink, ProgressSink, ResultSink};
pub use tracker::{RunSummary, RunTracker};
pub use types::{Batch, BatchConfig, DispatchConfig, TaskResult, WorkItem};
pub use worker::{BatchFn, BatchWorker, CancelToken, SingleItemWorker, Worker};
