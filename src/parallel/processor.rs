//! Main parallel processor
//!
//! [`Dispatcher`] wires the pipeline together:
//!
//! ```text
//! feeder ──▶ (batcher ──▶ converter) ──▶ work queue ──▶ N workers ──▶ collector ──▶ sink
//! ```
//!
//! The worker pool pulls from a bounded queue, so at most `concurrency_limit`
//! invocations run at once and each completion frees a slot for the next unit.
//! The collector runs on the calling thread and owns the sink.

use anyhow::Result;
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{SluiceError, TaskError};
use crate::platform::Ctrl;

use super::batching::Batcher;
use super::sink::{CollectingSink, Delivery, ResultSink};
use super::tracker::{RunSummary, RunTracker};
use super::types::{DispatchConfig, TaskResult, UnitResult, WorkItem, WorkMessage};
use super::worker::{
    cancelled_results, is_hard_failure, worker_thread, CancelToken, Worker, WorkerThreadConfig,
};

/// Concurrency-bounded execution of a worker over a list of items
pub struct Dispatcher {
    config: DispatchConfig,
    ctrl_rx: Receiver<Ctrl>,
}

/// Why the collector stopped delivering failures
enum Halt {
    Aborted { index: usize, error: TaskError },
    SinkFailed(anyhow::Error),
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            ctrl_rx: never(),
        }
    }

    /// React to shutdown requests: graceful stops feeding new items, immediate
    /// also cancels in-flight work
    pub fn with_ctrl(mut self, ctrl_rx: Receiver<Ctrl>) -> Self {
        self.ctrl_rx = ctrl_rx;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run `worker` over `items`, delivering one result per item to `sink`
    ///
    /// With `tolerate_failures` every item yields exactly one result. Without
    /// it, the first failure cancels the remaining work and the run ends with
    /// [`SluiceError::Aborted`]; results that completed successfully before
    /// that point have already been delivered.
    pub fn run<T, O, S>(
        &self,
        items: Vec<T>,
        worker: Worker<T, O>,
        sink: &mut S,
    ) -> Result<RunSummary, SluiceError>
    where
        T: Send + 'static,
        O: Send + 'static,
        S: ResultSink<O>,
    {
        self.config.validate()?;
        if let Some(batching) = worker.batching() {
            batching.validate()?;
        }

        let total = items.len();
        let tracker = RunTracker::new(total);
        let cancel = CancelToken::new();
        let stop_feeding = Arc::new(AtomicBool::new(false));

        tracing::debug!(
            total,
            concurrency = self.config.concurrency_limit,
            ordered = self.config.order_preserving,
            tolerate_failures = self.config.tolerate_failures,
            batched = worker.batching().is_some(),
            "starting dispatch"
        );

        let (work_sender, work_receiver) = bounded(self.config.queue_bound());
        let (result_sender, result_receiver) = unbounded();

        let mut handles: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

        // Feeder (and, for batch workers, batcher + converter)
        let feed = FeedControl {
            stop: Arc::clone(&stop_feeding),
            cancel: cancel.clone(),
            result_sender: result_sender.clone(),
        };
        match worker.batching() {
            None => {
                let handle = spawn_named("sluice-feeder", move || {
                    feed_single(items, work_sender, feed)
                })?;
                handles.push(("feeder", handle));
            }
            Some(batching) => {
                let (batch_sender, batch_receiver) = unbounded();
                let batcher = Batcher::spawn(batching.clone(), batch_sender)?;

                let converter = spawn_named("sluice-converter", move || -> Result<()> {
                    while let Ok(batch) = batch_receiver.recv() {
                        tracing::debug!(batch_id = batch.id, size = batch.len(), "dispatching batch");
                        if work_sender.send(WorkMessage::Batch(batch)).is_err() {
                            break;
                        }
                    }
                    Ok(())
                })?;
                handles.push(("converter", converter));

                let feeder = spawn_named("sluice-feeder", move || {
                    feed_batched(items, batcher, feed)
                })?;
                handles.push(("feeder", feeder));
            }
        }

        // Start worker threads
        for worker_id in 0..self.config.concurrency_limit {
            let work_receiver = work_receiver.clone();
            let result_sender = result_sender.clone();
            let thread_config = WorkerThreadConfig {
                worker: worker.clone(),
                timeout: self.config.timeout,
                cancel: cancel.clone(),
                tracker: tracker.clone(),
                fail_fast: !self.config.tolerate_failures,
            };
            let handle = spawn_named(&format!("sluice-worker-{}", worker_id), move || {
                worker_thread(worker_id, work_receiver, result_sender, thread_config)
            })?;
            handles.push(("worker", handle));
        }

        // Drop our copies so the result channel closes when the pipeline drains
        drop(work_receiver);
        drop(result_sender);

        let collected = self.collect_results(
            result_receiver,
            sink,
            &tracker,
            &cancel,
            &stop_feeding,
        );

        for (role, handle) in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(role, error = %format!("{:#}", e), "pipeline thread failed"),
                Err(_) => tracing::error!(role, "pipeline thread panicked"),
            }
        }

        let (delivery, halt) = collected;
        let finished = sink.finish();

        match halt {
            Some(Halt::SinkFailed(e)) => return Err(SluiceError::Sink(e)),
            Some(Halt::Aborted { index, error }) => {
                tracing::warn!(index, error = %error, delivered = delivery.delivered(), "run aborted");
                return Err(SluiceError::Aborted {
                    index,
                    completed: delivery.delivered(),
                    error,
                });
            }
            None => {}
        }
        finished.map_err(SluiceError::Sink)?;

        if delivery.pending() > 0 || delivery.delivered() != total {
            tracing::error!(
                delivered = delivery.delivered(),
                pending = delivery.pending(),
                total,
                "dispatch finished with undelivered results"
            );
        }

        let summary = tracker.summary();
        tracing::debug!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            peak_in_flight = summary.peak_in_flight,
            "dispatch complete"
        );
        Ok(summary)
    }

    /// Run and return every result, in delivery order
    pub fn collect<T, O>(
        &self,
        items: Vec<T>,
        worker: Worker<T, O>,
    ) -> Result<Vec<TaskResult<O>>, SluiceError>
    where
        T: Send + 'static,
        O: Send + 'static,
    {
        let mut sink = CollectingSink::new();
        self.run(items, worker, &mut sink)?;
        Ok(sink.into_results())
    }

    /// Collector loop: runs until every worker and the feeder have hung up
    fn collect_results<O, S: ResultSink<O>>(
        &self,
        result_receiver: Receiver<UnitResult<O>>,
        sink: &mut S,
        tracker: &RunTracker,
        cancel: &CancelToken,
        stop_feeding: &AtomicBool,
    ) -> (Delivery<O>, Option<Halt>) {
        let mut delivery = Delivery::new(self.config.order_preserving);
        let mut halt: Option<Halt> = None;
        let mut ctrl_open = true;

        loop {
            let ctrl = if ctrl_open {
                self.ctrl_rx.clone()
            } else {
                never()
            };

            select! {
                recv(result_receiver) -> msg => match msg {
                    Ok(unit) => {
                        for result in unit.results {
                            if halt.is_some() {
                                // Keep draining; only completed work is still delivered
                                if result.is_success() {
                                    let _ = delivery.accept(result, sink, tracker);
                                }
                                continue;
                            }

                            if !self.config.tolerate_failures && is_hard_failure(&result) {
                                if let TaskResult::Failure { index, error } = result {
                                    cancel.cancel_run();
                                    stop_feeding.store(true, Ordering::SeqCst);
                                    halt = Some(Halt::Aborted { index, error });
                                }
                                continue;
                            }

                            if let Err(e) = delivery.accept(result, sink, tracker) {
                                cancel.cancel_run();
                                stop_feeding.store(true, Ordering::SeqCst);
                                halt = Some(Halt::SinkFailed(e));
                            }
                        }
                    }
                    Err(_) => break,
                },
                recv(ctrl) -> msg => match msg {
                    Ok(Ctrl::Shutdown { immediate }) => {
                        tracing::info!(immediate, "shutdown requested, no new items will start");
                        stop_feeding.store(true, Ordering::SeqCst);
                        if immediate {
                            cancel.cancel_run();
                        }
                    }
                    Ok(Ctrl::PrintStats) => {
                        tracing::info!("{}", tracker.summary().format_summary());
                    }
                    Err(_) => ctrl_open = false,
                },
            }
        }

        (delivery, halt)
    }
}

/// Run `worker` over `items` with the given bounds and collect every result
pub fn run<T, O>(
    items: Vec<T>,
    worker: Worker<T, O>,
    concurrency_limit: usize,
    order_preserving: bool,
    tolerate_failures: bool,
) -> Result<Vec<TaskResult<O>>, SluiceError>
where
    T: Send + 'static,
    O: Send + 'static,
{
    Dispatcher::new(DispatchConfig {
        concurrency_limit,
        order_preserving,
        tolerate_failures,
        ..Default::default()
    })
    .collect(items, worker)
}

struct FeedControl<O> {
    stop: Arc<AtomicBool>,
    cancel: CancelToken,
    result_sender: Sender<UnitResult<O>>,
}

impl<O> FeedControl<O> {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// Items that were never handed to a worker still get exactly one result
    fn cancel_remaining(&self, from: usize, total: usize) {
        if from >= total {
            return;
        }
        tracing::info!(skipped = total - from, "not starting remaining items");
        let _ = self.result_sender.send(UnitResult {
            results: cancelled_results((from..total).collect()),
        });
    }
}

fn feed_single<T, O>(
    items: Vec<T>,
    work_sender: Sender<WorkMessage<T>>,
    control: FeedControl<O>,
) -> Result<()> {
    let total = items.len();
    let mut fed = 0;
    for (index, payload) in items.into_iter().enumerate() {
        if control.should_stop() {
            break;
        }
        if work_sender
            .send(WorkMessage::Single(WorkItem { index, payload }))
            .is_err()
        {
            break;
        }
        fed += 1;
    }
    control.cancel_remaining(fed, total);
    Ok(())
}

fn feed_batched<T: Send + 'static, O>(
    items: Vec<T>,
    batcher: Batcher<T>,
    control: FeedControl<O>,
) -> Result<()> {
    let total = items.len();
    for payload in items {
        if control.should_stop() || batcher.submit(payload).is_err() {
            break;
        }
    }
    let fed = batcher.submitted();
    control.cancel_remaining(fed, total);

    // Flush the open batch so every submitted item reaches a worker
    let stats = batcher.shutdown()?;
    tracing::debug!(
        batches = stats.batches,
        size_triggered = stats.size_triggered,
        time_triggered = stats.time_triggered,
        "batcher finished"
    );
    Ok(())
}

fn spawn_named<F>(name: &str, body: F) -> Result<JoinHandle<Result<()>>, SluiceError>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| SluiceError::Config(format!("failed to spawn {} thread: {}", name, e)))
}
