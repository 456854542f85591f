use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::{BoxFuture, Shared};

use super::call_error::CallResult;

/// The result of a producer execution, shared by every caller waiting for it.
pub(super) type PendingCall<V> = Shared<BoxFuture<'static, CallResult<V>>>;

/// What [`InflightTable::join_or_start`] decided for a caller.
pub(super) enum Admission<V> {
    /// A producer was already running, the caller shares its result.
    Coalesced(PendingCall<V>),
    /// The caller started a new producer.
    Started(PendingCall<V>),
    /// The cache was populated in the meantime.
    Ready(V),
}

/// Tracks the producers that are currently running, or waiting for a slot.
///
/// There is at most one entry per key. It is registered before the producer is dispatched and
/// removed once it settles, no matter whether it succeeded or failed.
pub(super) struct InflightTable<V> {
    calls: Mutex<HashMap<String, PendingCall<V>>>,
}

impl<V> Default for InflightTable<V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> InflightTable<V> {
    /// Joins the pending call for `key`, or registers a new one.
    ///
    /// `recheck` is consulted while the table is locked, right before `start`. A producer for the
    /// same key might have settled between the caller's cache lookup and this point, in which
    /// case the freshly cached value is used instead of starting another producer.
    pub fn join_or_start(
        &self,
        key: &str,
        recheck: impl FnOnce() -> Option<V>,
        start: impl FnOnce() -> PendingCall<V>,
    ) -> Admission<V> {
        let mut calls = self.calls.lock().unwrap();
        if let Some(pending) = calls.get(key) {
            return Admission::Coalesced(pending.clone());
        }
        if let Some(value) = recheck() {
            return Admission::Ready(value);
        }

        let pending = start();
        calls.insert(key.to_owned(), pending.clone());
        Admission::Started(pending)
    }

    pub fn remove(&self, key: &str) {
        self.calls.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}
