//! Keyed snapshots of observed records and the delta between two of them

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::SluiceError;

use super::keys::{KeyDeriver, KeyError};

/// One scraped event listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(alias = "show_title")]
    pub title: String,
    pub date: String,
    pub time: String,
    #[serde(default, alias = "room", skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A record that could not be keyed and was left out of the snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub position: usize,
    pub error: KeyError,
}

/// Records observed in one cycle, keyed by identity, in observation order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot<R = EventRecord> {
    entries: IndexMap<String, R>,
}

impl<R> Default for Snapshot<R> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }
}

impl<R> Snapshot<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key every record; later records replace earlier ones with the same key
    pub fn from_records<I, D>(records: I, deriver: &D) -> (Self, Vec<SkippedRecord>)
    where
        I: IntoIterator<Item = R>,
        D: KeyDeriver<R> + ?Sized,
    {
        let mut snapshot = Self::new();
        let mut skipped = Vec::new();

        for (position, record) in records.into_iter().enumerate() {
            match deriver.derive_key(&record) {
                Ok(key) => {
                    if snapshot.insert(key.clone(), record).is_some() {
                        tracing::debug!(key = %key, "duplicate record key, keeping the later record");
                    }
                }
                Err(error) => {
                    tracing::warn!(position, error = %error, "skipping record that cannot be keyed");
                    skipped.push(SkippedRecord { position, error });
                }
            }
        }

        (snapshot, skipped)
    }

    pub fn insert(&mut self, key: String, record: R) -> Option<R> {
        self.entries.insert(key, record)
    }

    pub fn get(&self, key: &str) -> Option<&R> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &R)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Entries whose keys are absent from `previous`; removals are not reported
    pub fn delta_from(&self, previous: &Snapshot<R>) -> Delta<R>
    where
        R: Clone,
    {
        let entries = self
            .entries
            .iter()
            .filter(|(key, _)| !previous.entries.contains_key(*key))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        Delta { entries }
    }
}

impl<R: Serialize> Snapshot<R> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

impl<R: for<'de> Deserialize<'de>> Snapshot<R> {
    /// Decode a stored snapshot; `key` names it in the error
    pub fn from_bytes(key: &str, bytes: &[u8]) -> Result<Self, SluiceError> {
        serde_json::from_slice(bytes).map_err(|source| SluiceError::CorruptSnapshot {
            key: key.to_string(),
            source,
        })
    }
}

impl<R> FromIterator<(String, R)> for Snapshot<R> {
    fn from_iter<I: IntoIterator<Item = (String, R)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Newly appeared entries, in the order they appear in the current snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta<R = EventRecord> {
    entries: IndexMap<String, R>,
}

impl<R> Default for Delta<R> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }
}

impl<R> Delta<R> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &R)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&R> {
        self.entries.get(key)
    }
}

impl<R> IntoIterator for Delta<R> {
    type Item = (String, R);
    type IntoIter = indexmap::map::IntoIter<String, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
