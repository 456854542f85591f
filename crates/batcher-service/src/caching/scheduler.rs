use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::config::Config;

use super::call_error::{CallError, CallResult, ConfigError};
use super::counters::{Counters, MetricsSnapshot};
use super::inflight::{Admission, InflightTable, PendingCall};
use super::queue::AdmissionQueue;
use super::snapshot::{SnapshotSource, SnapshotWriter, load_cache, load_metrics};
use super::table::{CacheEntry, CacheTable};
use super::value::{CacheValue, Value};

/// Schedules, coalesces and memoizes calls to expensive producers.
///
/// See the [module level docs](super) for how a call is served.
///
/// A [`Scheduler`] is cheap to clone, clones share all state.
pub struct Scheduler<V: CacheValue = Value> {
    inner: Arc<SchedulerInner<V>>,
}

impl<V: CacheValue> Clone for Scheduler<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SchedulerInner<V: CacheValue> {
    cache: Arc<CacheTable<V>>,
    inflight: InflightTable<V>,
    queue: AdmissionQueue,
    counters: Arc<Counters>,
    /// The default TTL in nanoseconds, always positive.
    default_ttl: AtomicU64,
    /// The snapshot writer, if persistence is enabled.
    snapshots: Option<SnapshotWriter>,
}

impl<V: CacheValue> Scheduler<V> {
    /// Creates a new scheduler.
    ///
    /// If a snapshot directory is configured, the cache and metrics snapshots are loaded from it,
    /// and the background writer and the periodic metrics persistence are started on `runtime`.
    pub fn new(config: &Config, runtime: Handle) -> Result<Self, ConfigError> {
        let default_ttl = ConfigError::check_ttl(config.default_ttl)?;

        let (cache, counters, snapshots) = match config.snapshot_paths() {
            Some(paths) => {
                let cache = Arc::new(CacheTable::from_entries(load_cache(&paths.cache)));
                let counters = Arc::new(Counters::from_persisted(load_metrics(&paths.metrics)));
                let source = SnapshotSource {
                    cache: Arc::clone(&cache),
                    counters: Arc::clone(&counters),
                };
                let writer = SnapshotWriter::spawn(
                    paths,
                    source,
                    config.max_snapshot_queue_size,
                    &runtime,
                );
                (cache, counters, Some(writer))
            }
            None => (Arc::default(), Arc::default(), None),
        };

        let inner = Arc::new(SchedulerInner {
            cache,
            inflight: InflightTable::default(),
            queue: AdmissionQueue::new(config.concurrency, runtime.clone()),
            counters,
            default_ttl: AtomicU64::new(duration_to_nanos(default_ttl)),
            snapshots,
        });

        if inner.snapshots.is_some() && !config.metrics_persist_interval.is_zero() {
            spawn_metrics_timer(
                Arc::downgrade(&inner),
                config.metrics_persist_interval,
                &runtime,
            );
        }

        Ok(Self { inner })
    }

    /// Returns the memoized result for `key`, or computes it with `producer`.
    ///
    /// - A fresh cache entry is returned right away, without invoking `producer`.
    /// - If a producer for `key` is already running or queued, its result is shared, and
    ///   `producer` is not invoked.
    /// - Otherwise `producer` is queued, and runs once a slot is free.
    ///
    /// Entries are fresh as long as they are younger than `ttl`, or the
    /// [default TTL](Self::default_ttl) if none is given.
    ///
    /// A failing or panicking producer fails every caller that is waiting for it. Failures are
    /// not cached, the next call for `key` invokes its producer again.
    pub async fn call<F, Fut>(&self, key: &str, producer: F, ttl: Option<Duration>) -> CallResult<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let inner = &self.inner;
        inner.counters.record_request();

        let ttl = ttl.unwrap_or_else(|| self.default_ttl());
        if let Some(value) = inner.cache.get_fresh(key, ttl) {
            inner.counters.record_hit();
            return Ok(value);
        }

        let mut job = None;
        let admission = inner.inflight.join_or_start(
            key,
            || inner.cache.get_fresh(key, ttl),
            || {
                let (pending, queued) = self.prepare(key, producer);
                job = Some(queued);
                pending
            },
        );
        let pending = match admission {
            Admission::Ready(value) => {
                inner.counters.record_hit();
                return Ok(value);
            }
            Admission::Coalesced(pending) => {
                inner.counters.record_miss();
                metric!(counter("batcher.coalesced") += 1);
                pending
            }
            Admission::Started(pending) => {
                inner.counters.record_miss();
                metric!(gauge("batcher.inflight") = inner.inflight.len() as u64);
                // queued outside of the inflight lock, a runtime that is shutting down drops the
                // job right away, which unregisters it again
                if let Some(job) = job {
                    inner.queue.enqueue(job);
                }
                pending
            }
        };

        pending.await
    }

    /// Wraps `producer` into a job for the admission queue, along with the shared handle to its
    /// result.
    fn prepare<F, Fut>(&self, key: &str, producer: F) -> (PendingCall<V>, BoxFuture<'static, ()>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let registration = InflightRegistration {
            inner: Arc::clone(&self.inner),
            key: key.to_owned(),
        };

        let job = async move {
            let result = match AssertUnwindSafe(async move { producer().await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(CallError::from(err)),
                Err(panic) => Err(CallError::from_panic(panic)),
            };
            registration.inner.settle(&registration.key, &result);
            drop(registration);
            // nobody might be waiting anymore
            result_tx.send(result).ok();
        }
        .boxed();

        let pending = async move { result_rx.await.unwrap_or(Err(CallError::Canceled)) }
            .boxed()
            .shared();
        (pending, job)
    }

    /// Removes the cache entry for `key`.
    ///
    /// The next call for `key` invokes its producer, no matter how fresh the entry was.
    pub fn invalidate(&self, key: &str) {
        self.inner.cache.invalidate(key);
        self.inner.persist_cache();
    }

    /// Removes all cache entries.
    pub fn clear(&self) {
        self.inner.cache.clear();
        self.inner.persist_cache();
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_nanos(self.inner.default_ttl.load(Ordering::Relaxed))
    }

    /// Changes the TTL used by calls that do not specify their own.
    ///
    /// A zero TTL is rejected and the previous one stays in effect.
    pub fn set_default_ttl(&self, ttl: Duration) -> Result<(), ConfigError> {
        let ttl = ConfigError::check_ttl(ttl)?;
        self.inner
            .default_ttl
            .store(duration_to_nanos(ttl), Ordering::Relaxed);
        tracing::debug!("Default TTL set to {}", humantime::format_duration(ttl));
        Ok(())
    }

    /// Like [`set_default_ttl`](Self::set_default_ttl), but with a TTL in milliseconds.
    ///
    /// Zero and negative values are rejected.
    pub fn set_default_ttl_millis(&self, millis: i64) -> Result<(), ConfigError> {
        if millis <= 0 {
            return Err(ConfigError::InvalidTtl(millis));
        }
        self.set_default_ttl(Duration::from_millis(millis as u64))
    }

    /// Returns the usage counters together with the current sizes of all tables.
    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let counters = inner.counters.to_persisted();
        MetricsSnapshot {
            requests: counters.requests,
            hits: counters.hits,
            misses: counters.misses,
            persisted: counters.persisted,
            inflight: inner.inflight.len(),
            queued: inner.queue.queued(),
            cache_size: inner.cache.len(),
        }
    }

    /// Returns all cache entries, including stale ones, sorted by key.
    pub fn cache_entries(&self) -> Vec<(String, CacheEntry<V>)> {
        self.inner.cache.entries()
    }

    /// Writes the usage counters to the metrics snapshot.
    ///
    /// This happens periodically on its own. Does nothing when persistence is disabled.
    pub fn persist_metrics(&self) {
        self.inner.persist_metrics();
    }

    /// Waits until every snapshot requested so far has been written.
    pub async fn flush(&self) {
        if let Some(snapshots) = &self.inner.snapshots {
            snapshots.flush().await;
        }
    }

    /// Persists the cache and the usage counters a final time, and waits for all pending
    /// snapshot writes.
    pub async fn shutdown(&self) {
        self.inner.persist_cache();
        self.inner.persist_metrics();
        self.flush().await;
    }
}

impl<V: CacheValue> SchedulerInner<V> {
    /// Records the outcome of a producer.
    ///
    /// This runs before the inflight entry is removed, so that no caller can miss both the
    /// cached value and the running call.
    fn settle(&self, key: &str, result: &CallResult<V>) {
        match result {
            Ok(value) => {
                let serializable = value.is_serializable();
                self.cache.put(key, value.clone(), serializable);
                metric!(counter("batcher.producer") += 1, "status" => "ok");
                if serializable {
                    self.persist_cache();
                }
            }
            Err(err @ CallError::Panicked(_)) => {
                let stderr: &dyn std::error::Error = err;
                tracing::error!(stderr, key, "Producer panicked");
                metric!(counter("batcher.producer") += 1, "status" => err.metrics_tag());
            }
            Err(err) => {
                tracing::debug!(key, "Producer failed: {}", err);
                metric!(counter("batcher.producer") += 1, "status" => err.metrics_tag());
            }
        }
    }

    fn persist_cache(&self) {
        if let Some(snapshots) = &self.snapshots {
            snapshots.persist_cache();
        }
    }

    fn persist_metrics(&self) {
        if let Some(snapshots) = &self.snapshots {
            snapshots.persist_metrics();
        }
    }
}

/// Keeps the inflight entry of a call registered while its job is alive.
///
/// Dropping the job, whether it finished or was torn down before it could run, unregisters
/// the call, so the next call for the key starts over.
struct InflightRegistration<V: CacheValue> {
    inner: Arc<SchedulerInner<V>>,
    key: String,
}

impl<V: CacheValue> Drop for InflightRegistration<V> {
    fn drop(&mut self) {
        self.inner.inflight.remove(&self.key);
        metric!(gauge("batcher.inflight") = self.inner.inflight.len() as u64);
    }
}

/// Periodically persists the usage counters until the scheduler is dropped.
fn spawn_metrics_timer<V: CacheValue>(
    inner: Weak<SchedulerInner<V>>,
    period: Duration,
    runtime: &Handle,
) {
    let task = async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.persist_metrics();
        }
    };
    runtime.spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
}

fn duration_to_nanos(duration: Duration) -> u64 {
    duration.as_nanos().try_into().unwrap_or(u64::MAX)
}

impl<V: CacheValue> fmt::Debug for Scheduler<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("default_ttl", &self.default_ttl())
            .field("queue", &self.inner.queue)
            .field("metrics", &self.metrics())
            .finish()
    }
}
