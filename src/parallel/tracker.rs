//! Thread-safe state tracking for parallel processing
//!
//! Workers report invocation start/finish (for in-flight accounting) and the
//! collector records every delivered result. The final [`RunSummary`] is what
//! the CLI prints at the end of a run.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::TaskError;

use super::types::TaskResult;

#[derive(Debug, Default)]
struct TrackerState {
    total: usize,
    delivered: usize,
    succeeded: usize,
    failed: usize,
    timed_out: usize,
    cancelled: usize,
    in_flight: usize,
    peak_in_flight: usize,
    invocations: usize,
}

/// Thread-safe counters shared by the worker pool and the collector
#[derive(Debug, Clone)]
pub struct RunTracker {
    state: Arc<Mutex<TrackerState>>,
    start_time: Instant,
}

impl RunTracker {
    pub fn new(total: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                total,
                ..Default::default()
            })),
            start_time: Instant::now(),
        }
    }

    /// Lock tracker state with poison recovery
    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("worker thread panicked, recovering run statistics");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn invocation_started(&self) {
        let mut state = self.lock_state();
        state.in_flight += 1;
        state.invocations += 1;
        state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
    }

    pub(crate) fn invocation_finished(&self) {
        let mut state = self.lock_state();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    pub fn record<O>(&self, result: &TaskResult<O>) {
        let mut state = self.lock_state();
        state.delivered += 1;
        match result {
            TaskResult::Success { .. } => state.succeeded += 1,
            TaskResult::Failure { error, .. } => {
                state.failed += 1;
                match error {
                    TaskError::Timeout(_) => state.timed_out += 1,
                    TaskError::Cancelled => state.cancelled += 1,
                    _ => {}
                }
            }
        }
    }

    pub fn summary(&self) -> RunSummary {
        let state = self.lock_state();
        RunSummary {
            total: state.total,
            delivered: state.delivered,
            succeeded: state.succeeded,
            failed: state.failed,
            timed_out: state.timed_out,
            cancelled: state.cancelled,
            peak_in_flight: state.peak_in_flight,
            invocations: state.invocations,
            elapsed: self.start_time.elapsed(),
        }
    }
}

/// End-of-run counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub delivered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub peak_in_flight: usize,
    pub invocations: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_full_success(&self) -> bool {
        self.failed == 0 && self.delivered == self.total
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn format_summary(&self) -> String {
        let mut output = format!(
            "Processed {} items: {} succeeded, {} failed",
            self.total, self.succeeded, self.failed
        );

        if self.timed_out > 0 || self.cancelled > 0 {
            let mut details = Vec::new();
            if self.timed_out > 0 {
                details.push(format!("{} timed out", self.timed_out));
            }
            if self.cancelled > 0 {
                details.push(format!("{} cancelled", self.cancelled));
            }
            output.push_str(&format!(" ({})", details.join(", ")));
        }

        if self.delivered < self.total {
            output.push_str(&format!(", {} not run", self.total - self.delivered));
        }

        output.push_str(&format!(" in {:.2}s", self.elapsed.as_secs_f64()));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_outcomes() {
        let tracker = RunTracker::new(4);
        tracker.record(&TaskResult::Success {
            index: 0,
            output: (),
        });
        tracker.record::<()>(&TaskResult::Failure {
            index: 1,
            error: TaskError::Timeout(Duration::from_secs(1)),
        });
        tracker.record::<()>(&TaskResult::Failure {
            index: 2,
            error: TaskError::Cancelled,
        });

        let summary = tracker.summary();
        assert_eq!(summary.delivered, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.cancelled, 1);
        assert!(!summary.is_full_success());
        assert!(summary.has_failures());
    }

    #[test]
    fn test_peak_in_flight() {
        let tracker = RunTracker::new(0);
        tracker.invocation_started();
        tracker.invocation_started();
        tracker.invocation_finished();
        tracker.invocation_started();
        tracker.invocation_finished();
        tracker.invocation_finished();

        let summary = tracker.summary();
        assert_eq!(summary.peak_in_flight, 2);
        assert_eq!(summary.invocations, 3);
    }

    #[test]
    fn test_format_summary() {
        let summary = RunSummary {
            total: 128,
            delivered: 128,
            succeeded: 125,
            failed: 3,
            timed_out: 1,
            elapsed: Duration::from_millis(1234),
            ..Default::default()
        };
        assert_eq!(
            summary.format_summary(),
            "Processed 128 items: 125 succeeded, 3 failed (1 timed out) in 1.23s"
        );

        let partial = RunSummary {
            total: 5,
            delivered: 2,
            succeeded: 2,
            ..Default::default()
        };
        assert_eq!(
            partial.format_summary(),
            "Processed 5 items: 2 succeeded, 0 failed, 3 not run in 0.00s"
        );
        assert!(!partial.is_full_success());
    }
}
