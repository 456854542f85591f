use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// The usage counters, as written to the metrics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedMetrics {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// The number of metrics snapshots written so far.
    pub persisted: u64,
}

impl PersistedMetrics {
    /// Restores the counters from a parsed metrics snapshot.
    ///
    /// Every counter that is missing or not a non-negative integer starts at `0`.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let counter = |name: &str| {
            value
                .get(name)
                .and_then(serde_json::Value::as_u64)
                .unwrap_or_default()
        };
        Self {
            requests: counter("requests"),
            hits: counter("hits"),
            misses: counter("misses"),
            persisted: counter("persisted"),
        }
    }
}

/// A point-in-time view of the scheduler, see [`Scheduler::metrics`](super::Scheduler::metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub persisted: u64,
    /// Producers that are running or waiting for a slot.
    pub inflight: usize,
    /// Units of work waiting for a slot.
    pub queued: usize,
    /// Entries in the cache table, including stale ones.
    pub cache_size: usize,
}

/// Monotonic usage counters.
///
/// The counters continue from the values loaded from the metrics snapshot.
#[derive(Debug, Default)]
pub(super) struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    persisted: AtomicU64,
}

impl Counters {
    pub fn from_persisted(persisted: PersistedMetrics) -> Self {
        Self {
            requests: AtomicU64::new(persisted.requests),
            hits: AtomicU64::new(persisted.hits),
            misses: AtomicU64::new(persisted.misses),
            persisted: AtomicU64::new(persisted.persisted),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        metric!(counter("batcher.requests") += 1);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metric!(counter("batcher.hits") += 1);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metric!(counter("batcher.misses") += 1);
    }

    pub fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_persisted(&self) -> PersistedMetrics {
        PersistedMetrics {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
        }
    }
}
