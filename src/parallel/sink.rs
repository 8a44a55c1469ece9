//! Result delivery for parallel processing
//!
//! Handles output ordering: with order preservation, out-of-order completions
//! are held back until every earlier index has been delivered.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::Write;

use super::tracker::RunTracker;
use super::types::TaskResult;

/// Receives exactly one result per item, in delivery order
pub trait ResultSink<O> {
    fn deliver(&mut self, result: TaskResult<O>) -> Result<()>;

    /// Called once after the last delivery
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<O, F> ResultSink<O> for F
where
    F: FnMut(TaskResult<O>) -> Result<()>,
{
    fn deliver(&mut self, result: TaskResult<O>) -> Result<()> {
        self(result)
    }
}

/// Keeps every result in delivery order
#[derive(Debug)]
pub struct CollectingSink<O> {
    results: Vec<TaskResult<O>>,
}

impl<O> Default for CollectingSink<O> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
        }
    }
}

impl<O> CollectingSink<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> &[TaskResult<O>] {
        &self.results
    }

    pub fn into_results(self) -> Vec<TaskResult<O>> {
        self.results
    }
}

impl<O> ResultSink<O> for CollectingSink<O> {
    fn deliver(&mut self, result: TaskResult<O>) -> Result<()> {
        self.results.push(result);
        Ok(())
    }
}

/// Prints one `i/n` line per delivered result, then hands it to the inner sink
pub struct ProgressSink<W: Write, S> {
    inner: S,
    output: W,
    total: usize,
    seen: usize,
    quiet: bool,
    emoji: bool,
}

impl<W: Write, S> ProgressSink<W, S> {
    pub fn new(inner: S, output: W, total: usize) -> Self {
        Self {
            inner,
            output,
            total,
            seen: 0,
            quiet: false,
            emoji: true,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn emoji(mut self, emoji: bool) -> Self {
        self.emoji = emoji;
        self
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn progress_line<O>(&self, result: &TaskResult<O>) -> String {
        let status = match (result, self.emoji) {
            (TaskResult::Success { .. }, true) => "✅ Success".to_string(),
            (TaskResult::Success { .. }, false) => "Success".to_string(),
            (TaskResult::Failure { error, .. }, true) => format!("🚨 Error: {}", error),
            (TaskResult::Failure { error, .. }, false) => format!("Error: {}", error),
        };
        format!("{}/{} - {}", self.seen, self.total, status)
    }
}

impl<O, W: Write, S: ResultSink<O>> ResultSink<O> for ProgressSink<W, S> {
    fn deliver(&mut self, result: TaskResult<O>) -> Result<()> {
        self.seen += 1;
        if !self.quiet {
            let line = self.progress_line(&result);
            writeln!(self.output, "{}", line).context("failed to write progress line")?;
        }
        self.inner.deliver(result)
    }

    fn finish(&mut self) -> Result<()> {
        self.output.flush().context("failed to flush progress output")?;
        self.inner.finish()
    }
}

/// Ordered or completion-order delivery into a sink
pub(crate) struct Delivery<O> {
    preserve_order: bool,
    pending: BTreeMap<usize, TaskResult<O>>,
    next_expected: usize,
    delivered: usize,
}

impl<O> Delivery<O> {
    pub fn new(preserve_order: bool) -> Self {
        Self {
            preserve_order,
            pending: BTreeMap::new(),
            next_expected: 0,
            delivered: 0,
        }
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn accept<S: ResultSink<O>>(
        &mut self,
        result: TaskResult<O>,
        sink: &mut S,
        tracker: &RunTracker,
    ) -> Result<()> {
        if !self.preserve_order {
            return self.emit(result, sink, tracker);
        }

        self.pending.insert(result.index(), result);

        // Output all consecutive results starting from next_expected
        while let Some(ready) = self.pending.remove(&self.next_expected) {
            self.next_expected += 1;
            self.emit(ready, sink, tracker)?;
        }
        Ok(())
    }

    fn emit<S: ResultSink<O>>(
        &mut self,
        result: TaskResult<O>,
        sink: &mut S,
        tracker: &RunTracker,
    ) -> Result<()> {
        tracker.record(&result);
        self.delivered += 1;
        sink.deliver(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;

    fn ok(index: usize) -> TaskResult<usize> {
        TaskResult::Success {
            index,
            output: index * 10,
        }
    }

    #[test]
    fn test_ordered_delivery_buffers_early_completions() {
        let tracker = RunTracker::new(4);
        let mut sink = CollectingSink::new();
        let mut delivery = Delivery::new(true);

        delivery.accept(ok(2), &mut sink, &tracker).unwrap();
        delivery.accept(ok(1), &mut sink, &tracker).unwrap();
        assert!(sink.results().is_empty());
        assert_eq!(delivery.pending(), 2);

        delivery.accept(ok(0), &mut sink, &tracker).unwrap();
        delivery.accept(ok(3), &mut sink, &tracker).unwrap();

        let order: Vec<usize> = sink.results().iter().map(|r| r.index()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(delivery.delivered(), 4);
        assert_eq!(delivery.pending(), 0);
        assert_eq!(tracker.summary().succeeded, 4);
    }

    #[test]
    fn test_unordered_delivery_is_completion_order() {
        let tracker = RunTracker::new(3);
        let mut sink = CollectingSink::new();
        let mut delivery = Delivery::new(false);

        for index in [2, 0, 1] {
            delivery.accept(ok(index), &mut sink, &tracker).unwrap();
        }

        let order: Vec<usize> = sink.results().iter().map(|r| r.index()).collect();
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn test_progress_lines() {
        let mut output = Vec::new();
        {
            let mut sink = ProgressSink::new(CollectingSink::new(), &mut output, 2);
            sink.deliver(ok(0)).unwrap();
            sink.deliver(TaskResult::Failure {
                index: 1,
                error: TaskError::Worker("bad clip".to_string()),
            })
            .unwrap();
            ResultSink::<usize>::finish(&mut sink).unwrap();
            assert_eq!(sink.into_inner().results().len(), 2);
        }
        let text = String::from_utf8(output).unwrap();
        assert_eq!(text, "1/2 - ✅ Success\n2/2 - 🚨 Error: bad clip\n");
    }

    #[test]
    fn test_progress_quiet_and_plain() {
        let mut output = Vec::new();
        let mut sink = ProgressSink::new(CollectingSink::new(), &mut output, 1).quiet(true);
        sink.deliver(ok(0)).unwrap();
        drop(sink);
        assert!(output.is_empty());

        let mut output = Vec::new();
        let mut sink = ProgressSink::new(CollectingSink::new(), &mut output, 1).emoji(false);
        sink.deliver(ok(0)).unwrap();
        drop(sink);
        assert_eq!(String::from_utf8(output).unwrap(), "1/1 - Success\n");
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |result: TaskResult<usize>| -> Result<()> {
                seen.push(result.index());
                Ok(())
            };
            sink.deliver(ok(7)).unwrap();
        }
        assert_eq!(seen, vec![7]);
    }
}
