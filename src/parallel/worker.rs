//! Worker capability and worker pool threads
//!
//! A worker either handles one item per call ([`SingleItemWorker`]) or a
//! whole batch per call ([`BatchWorker`]). The pool threads pull units of
//! work from a shared queue, so a finished invocation immediately frees its
//! slot for the next unit. A timed-out invocation is reported at once but
//! keeps its slot until the call actually returns.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::TaskError;

use super::tracker::RunTracker;
use super::types::{BatchConfig, TaskResult, UnitResult, WorkItem, WorkMessage};

/// Cooperative cancellation flag handed to every worker invocation
///
/// A token is cancelled when the whole run is cancelled (fail-fast abort or
/// shutdown) or when its own invocation timed out.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    run: Arc<AtomicBool>,
    local: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for one invocation: cancelled with its parent, or on its own
    pub fn child(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
            local: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancel_run(&self) {
        self.run.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.load(Ordering::SeqCst) || self.local.load(Ordering::SeqCst)
    }
}

/// Processes one item per invocation
pub trait SingleItemWorker<T, O>: Send + Sync {
    fn process(&self, item: T, cancel: &CancelToken) -> Result<O>;
}

/// Processes a whole batch per invocation; must return one output per input,
/// in input order
pub trait BatchWorker<T, O>: Send + Sync {
    fn process_batch(&self, items: Vec<T>, cancel: &CancelToken) -> Result<Vec<O>>;
}

impl<T, O, F> SingleItemWorker<T, O> for F
where
    F: Fn(T) -> Result<O> + Send + Sync,
{
    fn process(&self, item: T, _cancel: &CancelToken) -> Result<O> {
        self(item)
    }
}

/// Closure adapter for batch-shaped work; a plain `Fn(Vec<T>)` closure would
/// also satisfy the single-item blanket impl
pub struct BatchFn<F>(pub F);

impl<T, O, F> BatchWorker<T, O> for BatchFn<F>
where
    F: Fn(Vec<T>) -> Result<Vec<O>> + Send + Sync,
{
    fn process_batch(&self, items: Vec<T>, _cancel: &CancelToken) -> Result<Vec<O>> {
        (self.0)(items)
    }
}

/// The granularity the dispatcher hands to the worker
pub enum Worker<T, O> {
    Single(Arc<dyn SingleItemWorker<T, O>>),
    Batch {
        worker: Arc<dyn BatchWorker<T, O>>,
        batching: BatchConfig,
    },
}

impl<T, O> Clone for Worker<T, O> {
    fn clone(&self) -> Self {
        match self {
            Worker::Single(worker) => Worker::Single(Arc::clone(worker)),
            Worker::Batch { worker, batching } => Worker::Batch {
                worker: Arc::clone(worker),
                batching: batching.clone(),
            },
        }
    }
}

impl<T, O> Worker<T, O> {
    pub fn single(worker: impl SingleItemWorker<T, O> + 'static) -> Self {
        Worker::Single(Arc::new(worker))
    }

    pub fn batched(worker: impl BatchWorker<T, O> + 'static, batching: BatchConfig) -> Self {
        Worker::Batch {
            worker: Arc::new(worker),
            batching,
        }
    }

    pub fn batching(&self) -> Option<&BatchConfig> {
        match self {
            Worker::Single(_) => None,
            Worker::Batch { batching, .. } => Some(batching),
        }
    }
}

/// Per-thread settings for the worker pool
pub(crate) struct WorkerThreadConfig<T, O> {
    pub worker: Worker<T, O>,
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
    pub tracker: RunTracker,
    /// Cancel the whole run as soon as one invocation fails
    pub fail_fast: bool,
}

/// Worker thread: pulls units of work until the queue closes
pub(crate) fn worker_thread<T, O>(
    worker_id: usize,
    work_receiver: Receiver<WorkMessage<T>>,
    result_sender: Sender<UnitResult<O>>,
    config: WorkerThreadConfig<T, O>,
) -> Result<()>
where
    T: Send + 'static,
    O: Send + 'static,
{
    while let Ok(message) = work_receiver.recv() {
        if config.cancel.is_cancelled() {
            let results = cancelled_results(message.indices());
            if result_sender.send(UnitResult { results }).is_err() {
                break;
            }
            continue;
        }

        config.tracker.invocation_started();
        let (results, straggler) = match message {
            WorkMessage::Single(item) => run_single(&config, item),
            WorkMessage::Batch(batch) => run_batch(&config, batch.items),
        };
        if config.fail_fast && results.iter().any(is_hard_failure) {
            config.cancel.cancel_run();
        }
        let delivered = result_sender.send(UnitResult { results }).is_ok();

        if let Some(straggler) = straggler {
            tracing::debug!(worker_id, "waiting for timed-out invocation to return");
            straggler.wait();
        }
        config.tracker.invocation_finished();

        if !delivered {
            // Collector has gone away; nothing left to report to
            break;
        }
    }

    tracing::trace!(worker_id, "worker exiting");
    Ok(())
}

/// A failure that aborts a fail-fast run; cancellations are a consequence, not a cause
pub(crate) fn is_hard_failure<O>(result: &TaskResult<O>) -> bool {
    matches!(result, TaskResult::Failure { error, .. } if *error != TaskError::Cancelled)
}

pub(crate) fn cancelled_results<O>(indices: Vec<usize>) -> Vec<TaskResult<O>> {
    indices
        .into_iter()
        .map(|index| TaskResult::Failure {
            index,
            error: TaskError::Cancelled,
        })
        .collect()
}

fn failed_results<O>(indices: &[usize], error: &TaskError) -> Vec<TaskResult<O>> {
    indices
        .iter()
        .map(|&index| TaskResult::Failure {
            index,
            error: error.clone(),
        })
        .collect()
}

/// Results of one unit, plus the invocation still running if it timed out
type UnitOutcome<O> = (Vec<TaskResult<O>>, Option<Straggler>);

fn run_single<T, O>(config: &WorkerThreadConfig<T, O>, item: WorkItem<T>) -> UnitOutcome<O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    let Worker::Single(worker) = &config.worker else {
        let error = TaskError::Worker("single item sent to a batch worker".to_string());
        return (failed_results(&[item.index], &error), None);
    };

    let worker = Arc::clone(worker);
    let index = item.index;
    let payload = item.payload;
    let (outcome, straggler) = invoke(config.timeout, &config.cancel, move |cancel| {
        worker.process(payload, cancel)
    });

    let results = match outcome {
        Ok(output) => vec![TaskResult::Success { index, output }],
        Err(error) => {
            tracing::warn!(index, error = %error, "work item failed");
            vec![TaskResult::Failure { index, error }]
        }
    };
    (results, straggler)
}

fn run_batch<T, O>(config: &WorkerThreadConfig<T, O>, items: Vec<WorkItem<T>>) -> UnitOutcome<O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    let indices: Vec<usize> = items.iter().map(|item| item.index).collect();
    let Worker::Batch { worker, .. } = &config.worker else {
        let error = TaskError::Worker("batch sent to a single-item worker".to_string());
        return (failed_results(&indices, &error), None);
    };

    let worker = Arc::clone(worker);
    let payloads: Vec<T> = items.into_iter().map(|item| item.payload).collect();
    let (outcome, straggler) = invoke(config.timeout, &config.cancel, move |cancel| {
        worker.process_batch(payloads, cancel)
    });

    let results = match outcome {
        Ok(outputs) if outputs.len() == indices.len() => indices
            .into_iter()
            .zip(outputs)
            .map(|(index, output)| TaskResult::Success { index, output })
            .collect(),
        Ok(outputs) => {
            let error = TaskError::BatchShape {
                expected: indices.len(),
                actual: outputs.len(),
            };
            tracing::warn!(first_index = indices.first().copied(), error = %error, "batch failed");
            failed_results(&indices, &error)
        }
        Err(error) => {
            tracing::warn!(
                first_index = indices.first().copied(),
                size = indices.len(),
                error = %error,
                "batch failed"
            );
            failed_results(&indices, &error)
        }
    };
    (results, straggler)
}

/// An invocation that outlived its timeout and is still running
pub(crate) struct Straggler {
    finished: Receiver<()>,
}

impl Straggler {
    /// Block until the invocation thread has exited
    fn wait(self) {
        // Never sent on; disconnects when the thread drops its sender
        let _ = self.finished.recv();
    }
}

/// Run one invocation, converting errors, panics and timeouts into `TaskError`
///
/// With a timeout the call runs on its own thread. When the deadline passes
/// the invocation's token is cancelled and the still-running call comes back
/// as a [`Straggler`] alongside the timeout error.
fn invoke<O, F>(
    timeout: Option<Duration>,
    run_cancel: &CancelToken,
    call: F,
) -> (Result<O, TaskError>, Option<Straggler>)
where
    O: Send + 'static,
    F: FnOnce(&CancelToken) -> Result<O> + Send + 'static,
{
    let cancel = run_cancel.child();

    let Some(timeout) = timeout else {
        return (settle(panic::catch_unwind(AssertUnwindSafe(|| call(&cancel)))), None);
    };

    let (done_tx, done_rx) = bounded(1);
    let (finished_tx, finished_rx) = bounded::<()>(0);
    let thread_cancel = cancel.clone();
    let spawned = thread::Builder::new()
        .name("sluice-invocation".to_string())
        .spawn(move || {
            let _finished = finished_tx;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(&thread_cancel)));
            let _ = done_tx.send(outcome);
        });
    if let Err(e) = spawned {
        let error = TaskError::Worker(format!("failed to spawn invocation thread: {}", e));
        return (Err(error), None);
    }

    match done_rx.recv_timeout(timeout) {
        Ok(outcome) => (settle(outcome), None),
        Err(RecvTimeoutError::Timeout) => {
            cancel.cancel();
            let straggler = Straggler {
                finished: finished_rx,
            };
            (Err(TaskError::Timeout(timeout)), Some(straggler))
        }
        Err(RecvTimeoutError::Disconnected) => (
            Err(TaskError::Panicked("invocation thread exited without a result".to_string())),
            None,
        ),
    }
}

fn settle<O>(outcome: std::thread::Result<Result<O>>) -> Result<O, TaskError> {
    match outcome {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(TaskError::from_worker(err)),
        Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[test]
    fn test_cancel_token_child_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert!(!parent.is_cancelled());

        parent.cancel_run();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn test_invoke_maps_errors_and_panics() {
        let cancel = CancelToken::new();

        let (ok, _) = invoke(None, &cancel, |_| Ok(5u32));
        assert_eq!(ok, Ok(5));

        let (failed, _) = invoke(None, &cancel, |_| -> Result<u32> { bail!("bad clip") });
        assert_eq!(failed, Err(TaskError::Worker("bad clip".to_string())));

        let (panicked, straggler) = invoke(None, &cancel, |_| -> Result<u32> { panic!("boom") });
        assert_eq!(panicked, Err(TaskError::Panicked("boom".to_string())));
        assert!(straggler.is_none());
    }

    #[test]
    fn test_invoke_timeout_cancels_invocation_token() {
        let cancel = CancelToken::new();
        let (seen_tx, seen_rx) = bounded(1);
        let (outcome, straggler) =
            invoke(Some(Duration::from_millis(20)), &cancel, move |token| {
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(2));
                }
                let _ = seen_tx.send(());
                Ok(1u32)
            });

        assert_eq!(outcome, Err(TaskError::Timeout(Duration::from_millis(20))));
        seen_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timed-out invocation should observe cancellation");
        assert!(!cancel.is_cancelled());
        straggler.expect("timed-out call is still tracked").wait();
    }

    #[test]
    fn test_straggler_waits_for_uncooperative_call() {
        let cancel = CancelToken::new();
        let returned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&returned);
        let (outcome, straggler) = invoke(Some(Duration::from_millis(10)), &cancel, move |_| {
            thread::sleep(Duration::from_millis(80));
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(outcome, Err(TaskError::Timeout(Duration::from_millis(10))));
        assert!(!returned.load(Ordering::SeqCst));
        straggler.expect("timed-out call is still tracked").wait();
        assert!(returned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_invoke_within_timeout_returns_output() {
        let cancel = CancelToken::new();
        let (outcome, straggler) = invoke(Some(Duration::from_secs(5)), &cancel, |_| Ok("done"));
        assert_eq!(outcome, Ok("done"));
        assert!(straggler.is_none());
    }

    #[test]
    fn test_closures_are_single_item_workers() {
        let worker: Worker<u32, u32> = Worker::single(|x: u32| -> Result<u32> { Ok(x * 2) });
        assert!(worker.batching().is_none());

        let batch: Worker<u32, u32> = Worker::batched(
            BatchFn(|xs: Vec<u32>| -> Result<Vec<u32>> { Ok(xs.into_iter().rev().collect()) }),
            BatchConfig::default(),
        );
        assert_eq!(batch.batching(), Some(&BatchConfig::default()));
    }
}
