//! Snapshot reconciliation for periodic alert jobs
//!
//! Each cycle compares the freshly observed snapshot of a source against the
//! one persisted by the previous cycle, reports keys that appeared since, and
//! persists the new snapshot. Removals are never reported.
//!
//! - `keys`: record identity (`KeyDeriver`, `EventKeyDeriver`)
//! - `snapshot`: `Snapshot`, `Delta`, `EventRecord`
//! - `store`: durable `KeyValueStore` implementations
//! - `notify`: notification channel and message formatting

pub mod keys;
pub mod notify;
pub mod snapshot;
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::CommitOrder;
use crate::error::SluiceError;

pub use keys::{EventKeyDeriver, KeyDeriver, KeyError};
pub use notify::{AlertMessage, CommandNotifier, DeliveryId, LogNotifier, Notifier};
pub use snapshot::{Delta, EventRecord, SkippedRecord, Snapshot};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreLock};

/// Compare `current` with the previously saved snapshot and persist `current`.
///
/// With no previous snapshot the result is an empty delta. `save` runs on
/// every call, and its failure is returned instead of the delta.
pub fn reconcile<R, L, S>(current: &Snapshot<R>, load_previous: L, save: S) -> Result<Delta<R>, SluiceError>
where
    R: Clone,
    L: FnOnce() -> Result<Option<Snapshot<R>>, SluiceError>,
    S: FnOnce(&Snapshot<R>) -> Result<(), SluiceError>,
{
    let delta = match load_previous()? {
        Some(previous) => current.delta_from(&previous),
        None => Delta::empty(),
    };
    save(current)?;
    Ok(delta)
}

/// Outcome of one [`Reconciler::run_cycle`]
#[derive(Debug)]
pub struct CycleReport<R = EventRecord> {
    pub source: String,
    /// No snapshot was stored for this source before the cycle
    pub first_run: bool,
    pub delta: Delta<R>,
    pub deliveries: Vec<DeliveryId>,
    pub failures: Vec<SluiceError>,
    /// The current snapshot was persisted
    pub committed: bool,
}

impl<R> CycleReport<R> {
    pub fn all_delivered(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs reconcile cycles against a store, one at a time per source
pub struct Reconciler<S> {
    store: S,
    commit_order: CommitOrder,
    sources: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: KeyValueStore> Reconciler<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            commit_order: CommitOrder::default(),
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_commit_order(mut self, commit_order: CommitOrder) -> Self {
        self.commit_order = commit_order;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn commit_order(&self) -> CommitOrder {
        self.commit_order
    }

    fn source_lock(&self, source: &str) -> Arc<Mutex<()>> {
        let mut sources = match self.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sources
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Last snapshot persisted for `source`
    pub fn load<R: DeserializeOwned>(&self, source: &str) -> Result<Option<Snapshot<R>>, SluiceError> {
        match self.store.get(source)? {
            Some(bytes) => Snapshot::from_bytes(source, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save<R: Serialize>(&self, source: &str, snapshot: &Snapshot<R>) -> Result<(), SluiceError> {
        let bytes = snapshot
            .to_bytes()
            .map_err(|e| SluiceError::storage(source, format!("cannot encode snapshot: {}", e)))?;
        self.store.put(source, &bytes)
    }

    /// Reconcile `current` for `source` and notify every recipient of each
    /// new entry. Holds the source lock for the whole cycle.
    pub fn run_cycle<R, N>(
        &self,
        source: &str,
        current: &Snapshot<R>,
        notifier: &N,
        recipients: &[String],
    ) -> Result<CycleReport<R>, SluiceError>
    where
        R: Clone + Serialize + DeserializeOwned + AlertMessage,
        N: Notifier + ?Sized,
    {
        let local = self.source_lock(source);
        let _local_guard = lock_ignoring_poison(&local);
        let _store_guard = self.store.lock(source)?;

        let report = match self.commit_order {
            CommitOrder::SaveThenNotify => {
                let mut first_run = false;
                let delta = reconcile(
                    current,
                    || {
                        let previous = self.load(source)?;
                        first_run = previous.is_none();
                        Ok(previous)
                    },
                    |snapshot| self.save(source, snapshot),
                )?;
                let (deliveries, failures) = deliver(&delta, notifier, recipients);
                CycleReport {
                    source: source.to_string(),
                    first_run,
                    delta,
                    deliveries,
                    failures,
                    committed: true,
                }
            }
            CommitOrder::NotifyThenSave => {
                let previous = self.load(source)?;
                let first_run = previous.is_none();
                let delta = previous
                    .map(|previous| current.delta_from(&previous))
                    .unwrap_or_default();
                let (deliveries, failures) = deliver(&delta, notifier, recipients);

                // A failed delivery leaves the old snapshot in place so the
                // next cycle reports the same entries again
                let committed = failures.is_empty();
                if committed {
                    self.save(source, current)?;
                } else {
                    tracing::warn!(
                        source,
                        failed = failures.len(),
                        "not saving snapshot after failed deliveries"
                    );
                }
                CycleReport {
                    source: source.to_string(),
                    first_run,
                    delta,
                    deliveries,
                    failures,
                    committed,
                }
            }
        };

        tracing::info!(
            source,
            entries = current.len(),
            new = report.delta.len(),
            first_run = report.first_run,
            delivered = report.deliveries.len(),
            failed = report.failures.len(),
            committed = report.committed,
            "reconcile cycle complete"
        );
        Ok(report)
    }
}

fn lock_ignoring_poison(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn deliver<R, N>(delta: &Delta<R>, notifier: &N, recipients: &[String]) -> (Vec<DeliveryId>, Vec<SluiceError>)
where
    R: AlertMessage,
    N: Notifier + ?Sized,
{
    let mut deliveries = Vec::new();
    let mut failures = Vec::new();

    for (key, record) in delta.iter() {
        let message = record.alert_message(key);
        for recipient in recipients {
            match notifier.send(recipient, &message) {
                Ok(id) => {
                    tracing::debug!(key, recipient = %recipient, id = %id, "notification sent");
                    deliveries.push(id);
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "notification failed");
                    failures.push(e);
                }
            }
        }
    }

    (deliveries, failures)
}

/// Names to watch for in a polled availability list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watchlist {
    wanted: Vec<String>,
}

impl Watchlist {
    pub fn new<I, T>(wanted: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            wanted: wanted.into_iter().map(Into::into).collect(),
        }
    }

    pub fn wanted(&self) -> &[String] {
        &self.wanted
    }

    /// Wanted names present in `available`, in watchlist order
    pub fn matches<T: AsRef<str>>(&self, available: &[T]) -> Vec<String> {
        self.wanted
            .iter()
            .filter(|name| available.iter().any(|a| a.as_ref().trim() == name.as_str()))
            .cloned()
            .collect()
    }

    pub fn message(matches: &[String]) -> Option<String> {
        if matches.is_empty() {
            None
        } else {
            Some(format!("The following are available: {}.", matches.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn snapshot(value: Value) -> Snapshot<Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_reconcile_cold_start_saves_and_reports_nothing() {
        let current = snapshot(json!({"a": 1, "b": 2}));
        let mut saved = None;

        let delta = reconcile(&current, || Ok(None), |s| {
            saved = Some(s.clone());
            Ok(())
        })
        .unwrap();

        assert!(delta.is_empty());
        assert_eq!(saved, Some(current));
    }

    #[test]
    fn test_reconcile_saves_even_when_unchanged() {
        let current = snapshot(json!({"a": 1}));
        let mut saves = 0;
        let delta = reconcile(&current, || Ok(Some(current.clone())), |_| {
            saves += 1;
            Ok(())
        })
        .unwrap();
        assert!(delta.is_empty());
        assert_eq!(saves, 1);
    }

    #[test]
    fn test_reconcile_save_failure_withholds_delta() {
        let previous = snapshot(json!({"a": 1}));
        let current = snapshot(json!({"a": 1, "b": 2}));
        let result = reconcile(&current, || Ok(Some(previous)), |_| {
            Err(SluiceError::storage("events", "disk full"))
        });
        assert!(matches!(result, Err(SluiceError::Storage { .. })));
    }

    #[test]
    fn test_run_cycle_with_memory_store() {
        let reconciler = Reconciler::new(MemoryStore::new());
        let notifier = LogNotifier::new();
        let to = vec!["ops".to_string()];

        let first = reconciler
            .run_cycle("events", &snapshot(json!({"a": 1})), &notifier, &to)
            .unwrap();
        assert!(first.first_run);
        assert!(first.delta.is_empty());

        let second = reconciler
            .run_cycle("events", &snapshot(json!({"a": 1, "b": 2})), &notifier, &to)
            .unwrap();
        assert!(!second.first_run);
        assert_eq!(second.delta.keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(second.deliveries.len(), 1);
        assert!(second.committed);

        let stored: Option<Snapshot<Value>> = reconciler.load("events").unwrap();
        assert_eq!(stored, Some(snapshot(json!({"a": 1, "b": 2}))));
    }

    #[test]
    fn test_watchlist() {
        let watchlist = Watchlist::new(["gpu_8x_a100", "gpu_1x_h100_pcie"]);
        let available = vec!["gpu_1x_h100_pcie", "gpu_1x_a10", "gpu_8x_a100 "];
        let found = watchlist.matches(&available);
        assert_eq!(found, vec!["gpu_8x_a100", "gpu_1x_h100_pcie"]);
        assert_eq!(
            Watchlist::message(&found).unwrap(),
            "The following are available: gpu_8x_a100, gpu_1x_h100_pcie."
        );
        assert_eq!(Watchlist::message(&[]), None);
    }
}
