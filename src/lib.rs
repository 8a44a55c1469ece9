// Core library for Sluice: bounded concurrent dispatch and snapshot reconciliation

pub mod cli;
pub mod config;
pub mod config_file;
pub mod error;
pub mod logging;
pub mod parallel;
pub mod platform;
pub mod reconcile;
pub mod source;
pub mod workers;

pub use config::{CommitOrder, RunContext, SluiceConfig, WorkerKind};
pub use error::{Result, SluiceError, TaskError};
pub use parallel::{
    run, Batch, BatchConfig, BatchWorker, Batcher, CancelToken, DispatchConfig, Dispatcher,
    ResultSink, RunSummary, SingleItemWorker, TaskResult, WorkItem, Worker,
};
pub use reconcile::{reconcile, Delta, KeyDeriver, Reconciler, Snapshot, Watchlist};
pub use source::{DirectorySource, WorkSource};
