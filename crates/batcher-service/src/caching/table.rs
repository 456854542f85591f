use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::snapshot::PersistedEntry;
use super::value::CacheValue;

/// A memoized result.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The value the producer returned.
    pub value: V,
    /// When the value was written, used for freshness checks.
    pub written_at: Instant,
    /// The wall clock time of the write, in milliseconds since the epoch.
    ///
    /// This is what ends up in the cache snapshot.
    pub written_at_ms: i64,
    /// Whether the value is part of the cache snapshot.
    ///
    /// Decided once, when the entry is written.
    pub serializable: bool,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, serializable: bool) -> Self {
        Self {
            value,
            written_at: Instant::now(),
            written_at_ms: chrono::Utc::now().timestamp_millis(),
            serializable,
        }
    }

    pub fn age(&self) -> Duration {
        self.written_at.elapsed()
    }

    /// An entry is fresh as long as it is younger than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// The in-memory table of memoized results.
///
/// This is the authoritative state while the process is running. Entries are overwritten when
/// their key is recomputed, and removed only by [`invalidate`](Self::invalidate) or
/// [`clear`](Self::clear).
#[derive(Debug)]
pub struct CacheTable<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V> Default for CacheTable<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: CacheValue> CacheTable<V> {
    /// Creates a table pre-populated with entries restored from a snapshot.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, CacheEntry<V>)>) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().collect()),
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Returns the value for `key`, unless it is missing or stale.
    pub fn get_fresh(&self, key: &str, ttl: Duration) -> Option<V> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|entry| entry.is_fresh(ttl))
            .map(|entry| entry.value.clone())
    }

    pub fn put(&self, key: &str, value: V, serializable: bool) {
        let entry = CacheEntry::new(value, serializable);
        self.entries.lock().unwrap().insert(key.to_owned(), entry);
    }

    /// Removes the entry for `key`, returning whether there was one.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of all entries, sorted by key.
    pub fn entries(&self) -> Vec<(String, CacheEntry<V>)> {
        let entries = self.entries.lock().unwrap();
        let mut entries: Vec<_> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Collects the serializable subset of the table in its persisted form.
    pub fn persisted_snapshot(&self) -> BTreeMap<String, PersistedEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, entry)| entry.serializable)
            .filter_map(|(key, entry)| {
                let v = entry.value.to_persisted()?;
                Some((
                    key.clone(),
                    PersistedEntry {
                        v,
                        t: entry.written_at_ms,
                    },
                ))
            })
            .collect()
    }
}
