//! Batcher thread logic for parallel processing
//!
//! Groups submitted items into batches that close on whichever comes first:
//! the size bound or the wait deadline measured from the first item in the
//! batch. Closing the batcher (explicitly, by drop, or by a graceful shutdown
//! request) flushes the open batch.

use anyhow::{anyhow, Result};
use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::SluiceError;
use crate::platform::Ctrl;

use super::types::{Batch, BatchConfig, WorkItem};

/// Returned by [`Batcher::submit`]; identifies the item in the output batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemHandle {
    pub index: usize,
}

/// Counters reported by the batcher thread when it exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub items: usize,
    pub batches: usize,
    pub size_triggered: usize,
    pub time_triggered: usize,
    pub flushed_on_close: usize,
    pub dropped_on_immediate_shutdown: usize,
}

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    SizeLimit,
    Deadline,
    Close,
}

/// Shared by submitters and the batcher thread. `sender` is `None` once the
/// batcher stops accepting items; it is cleared under the same lock `submit`
/// holds, so an accepted item is always in the queue the thread drains last.
struct SubmitState<T> {
    next_index: usize,
    sender: Option<Sender<WorkItem<T>>>,
}

fn lock_submit<T>(state: &Mutex<SubmitState<T>>) -> MutexGuard<'_, SubmitState<T>> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Reject further submissions; returns once no `submit` is mid-send
fn close_submissions<T>(state: &Mutex<SubmitState<T>>) {
    lock_submit(state).sender = None;
}

/// Size/time-bounded batcher backed by a dedicated thread
///
/// `submit` may be called concurrently from several threads; membership order
/// within a batch follows submission order.
pub struct Batcher<T: Send + 'static> {
    state: Arc<Mutex<SubmitState<T>>>,
    handle: Option<JoinHandle<Result<BatcherStats>>>,
}

/// Configuration for batcher thread
pub(crate) struct BatcherThreadConfig<T> {
    pub batch_sender: Sender<Batch<T>>,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl<T: Send + 'static> Batcher<T> {
    /// Start a batcher that forwards closed batches to `batch_sender`
    pub fn spawn(config: BatchConfig, batch_sender: Sender<Batch<T>>) -> Result<Self, SluiceError> {
        Self::spawn_with_ctrl(config, batch_sender, never())
    }

    /// Start a batcher that also reacts to shutdown requests on `ctrl_rx`
    pub fn spawn_with_ctrl(
        config: BatchConfig,
        batch_sender: Sender<Batch<T>>,
        ctrl_rx: Receiver<Ctrl>,
    ) -> Result<Self, SluiceError> {
        config.validate()?;

        let (item_sender, item_receiver) = unbounded();
        let state = Arc::new(Mutex::new(SubmitState {
            next_index: 0,
            sender: Some(item_sender),
        }));
        let thread_state = Arc::clone(&state);
        let thread_config = BatcherThreadConfig {
            batch_sender,
            batch_size: config.max_batch_size,
            batch_timeout: config.wait,
        };
        let handle = thread::Builder::new()
            .name("sluice-batcher".to_string())
            .spawn(move || batcher_thread(item_receiver, thread_config, ctrl_rx, &thread_state))
            .map_err(|e| SluiceError::Config(format!("failed to spawn batcher thread: {}", e)))?;

        Ok(Self {
            state,
            handle: Some(handle),
        })
    }

    /// Convenience constructor returning the receiving end of the batch channel
    pub fn channel(config: BatchConfig) -> Result<(Self, Receiver<Batch<T>>), SluiceError> {
        let (batch_sender, batch_receiver) = unbounded();
        let batcher = Self::spawn(config, batch_sender)?;
        Ok((batcher, batch_receiver))
    }

    /// Add an item to the open batch
    pub fn submit(&self, payload: T) -> Result<ItemHandle, SluiceError> {
        let mut state = self.lock_state();
        let index = state.next_index;
        let sender = state.sender.as_ref().ok_or(SluiceError::BatcherClosed)?;
        sender
            .send(WorkItem { index, payload })
            .map_err(|_| SluiceError::BatcherClosed)?;
        state.next_index += 1;
        Ok(ItemHandle { index })
    }

    /// Number of items accepted so far
    pub fn submitted(&self) -> usize {
        self.lock_state().next_index
    }

    /// Stop accepting items, flush the open batch and wait for the batcher thread
    pub fn shutdown(mut self) -> Result<BatcherStats> {
        self.close_and_join()
    }

    fn close_and_join(&mut self) -> Result<BatcherStats> {
        close_submissions(&self.state);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("batcher thread panicked"))?,
            None => Ok(BatcherStats::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SubmitState<T>> {
        lock_submit(&self.state)
    }
}

impl<T: Send + 'static> Drop for Batcher<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.close_and_join() {
                tracing::warn!(error = %e, "batcher did not shut down cleanly");
            }
        }
    }
}

/// Open batch plus the bookkeeping shared by every branch of the select loop
struct OpenBatch<T> {
    items: Vec<WorkItem<T>>,
    next_batch_id: u64,
    deadline: Option<Instant>,
    stats: BatcherStats,
}

impl<T> OpenBatch<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            next_batch_id: 0,
            deadline: None,
            stats: BatcherStats::default(),
        }
    }

    fn flush(&mut self, config: &BatcherThreadConfig<T>, reason: FlushReason) -> Result<()> {
        self.deadline = None;
        if self.items.is_empty() {
            return Ok(());
        }

        let items = std::mem::replace(&mut self.items, Vec::with_capacity(config.batch_size));
        let batch = Batch {
            id: self.next_batch_id,
            items,
        };
        tracing::debug!(
            batch_id = batch.id,
            size = batch.len(),
            reason = ?reason,
            "closing batch"
        );

        self.stats.batches += 1;
        match reason {
            FlushReason::SizeLimit => self.stats.size_triggered += 1,
            FlushReason::Deadline => self.stats.time_triggered += 1,
            FlushReason::Close => self.stats.flushed_on_close += 1,
        }
        self.next_batch_id += 1;

        config
            .batch_sender
            .send(batch)
            .map_err(|_| anyhow!("batch receiver disconnected"))
    }

    fn push(&mut self, item: WorkItem<T>, config: &BatcherThreadConfig<T>) -> Result<()> {
        if self.items.is_empty() {
            self.deadline = Some(Instant::now() + config.batch_timeout);
        }
        self.items.push(item);
        self.stats.items += 1;

        if self.items.len() >= config.batch_size {
            self.flush(config, FlushReason::SizeLimit)?;
        }
        Ok(())
    }

    /// Move everything already queued into batches without waiting
    fn drain_queued(
        &mut self,
        item_receiver: &Receiver<WorkItem<T>>,
        config: &BatcherThreadConfig<T>,
    ) -> Result<()> {
        while let Ok(item) = item_receiver.try_recv() {
            self.push(item, config)?;
        }
        Ok(())
    }
}

/// Batcher thread - collects submitted items into batches
///
/// Submissions are closed on every exit path, so `submit` either lands in a
/// batch or returns `BatcherClosed`.
fn batcher_thread<T>(
    item_receiver: Receiver<WorkItem<T>>,
    config: BatcherThreadConfig<T>,
    ctrl_rx: Receiver<Ctrl>,
    submit_state: &Mutex<SubmitState<T>>,
) -> Result<BatcherStats> {
    let outcome = batch_loop(&item_receiver, &config, &ctrl_rx, submit_state);
    close_submissions(submit_state);
    outcome
}

fn batch_loop<T>(
    item_receiver: &Receiver<WorkItem<T>>,
    config: &BatcherThreadConfig<T>,
    ctrl_rx: &Receiver<Ctrl>,
    submit_state: &Mutex<SubmitState<T>>,
) -> Result<BatcherStats> {
    let mut open = OpenBatch::new(config.batch_size);
    let mut ctrl_open = true;

    loop {
        let timeout = match open.deadline {
            Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
            None => never(),
        };
        let ctrl = if ctrl_open { ctrl_rx.clone() } else { never() };

        select! {
            recv(ctrl) -> msg => {
                match msg {
                    Ok(Ctrl::Shutdown { immediate }) => {
                        close_submissions(submit_state);
                        if immediate {
                            let dropped = open.items.len() + item_receiver.len();
                            open.stats.dropped_on_immediate_shutdown = dropped;
                            if dropped > 0 {
                                tracing::warn!(dropped, "immediate shutdown discarded queued items");
                            }
                        } else {
                            open.drain_queued(item_receiver, config)?;
                            open.flush(config, FlushReason::Close)?;
                        }
                        break;
                    }
                    Ok(Ctrl::PrintStats) => {
                        // Batcher thread doesn't have stats to print, ignore
                    }
                    Err(_) => {
                        // Control channel closed; keep batching without it
                        ctrl_open = false;
                    }
                }
            }
            recv(item_receiver) -> msg => {
                match msg {
                    Ok(item) => {
                        open.push(item, config)?;
                        if config.batch_timeout.is_zero() {
                            open.drain_queued(item_receiver, config)?;
                            open.flush(config, FlushReason::Deadline)?;
                        }
                    }
                    Err(_) => {
                        open.flush(config, FlushReason::Close)?;
                        break;
                    }
                }
            }
            recv(timeout) -> _ => {
                open.flush(config, FlushReason::Deadline)?;
            }
        }
    }

    Ok(open.stats)
}
