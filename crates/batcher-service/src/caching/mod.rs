//! # Batcher call scheduling and caching
//!
//! The [`Scheduler`] sits in front of expensive asynchronous operations, such as lookups against a
//! remote provider. Collaborators hand it a stable key and a producer, and it makes sure that the
//! producer runs as rarely and as politely as possible.
//!
//! ## Layers
//!
//! A call goes through the following steps:
//! - First, the [`CacheTable`] is consulted. A fresh entry is returned immediately.
//! - On miss, the inflight table is consulted. If a producer for the same key is already running
//!   (or waiting for a slot), the caller shares its result. This is request coalescing.
//! - Otherwise, a new unit of work is submitted to the [`AdmissionQueue`], which runs at most
//!   `concurrency` producers at the same time, strictly in submission order.
//! - The result of a successful producer is written to the [`CacheTable`]. Failures are shared
//!   with every coalesced caller, but are never cached.
//!
//! Cache entries become stale after their TTL, which is either given per call or taken from the
//! scheduler default. Stale entries are not evicted. They stay in memory until they are
//! recomputed or invalidated, so memory is bounded by the number of distinct keys ever requested.
//!
//! ## Persistence
//!
//! When a `snapshot_dir` is configured, the serializable subset of the cache and the usage
//! counters are written to `cache.json` and `metrics.json` in that directory, and loaded once on
//! startup. Persistence is purely advisory. Requests only mark a snapshot as out of date, and a
//! single background writer takes the snapshot when it gets to write, so every write contains the
//! latest state and requests piling up during a slow write collapse into one. Any read or write
//! failure is logged and otherwise ignored. The request path never waits for the disk.
//! [`Scheduler::shutdown`] writes both snapshots a final time.
//!
//! Which values can be persisted is decided by [`CacheValue::is_serializable`], which is probed
//! once when an entry is written.
//!
//! ### Metrics
//!
//! The in-process counters are available through [`Scheduler::metrics`]. Additionally, the
//! following statsd metrics are emitted when statsd is configured:
//!
//! - `batcher.requests`: All calls.
//! - `batcher.hits`: Calls served by a fresh cache entry.
//! - `batcher.misses`: Calls not served by the cache.
//! - `batcher.coalesced`: Misses that joined an already running producer.
//! - `batcher.producer`: Settled producers, tagged with `status`.
//! - `batcher.queue.wait`: Time a unit of work waited for a free slot.
//! - `batcher.queue.size` and `batcher.inflight`: Gauges of the current sizes.
//! - `batcher.snapshot.write`: Snapshot writes, tagged with `kind` and `status`.
//! - `batcher.snapshot.coalesced`: Snapshot requests folded into a write that was already pending.
//!
//! ### Limitations
//!
//! There is no cancellation. A producer that never settles permanently occupies one slot of the
//! admission queue and its inflight entry, and every caller for that key waits along with it.
//! Dropping the future returned by [`Scheduler::call`] does not cancel the producer either.

mod call_error;
mod call_key;
mod counters;
mod inflight;
mod queue;
mod scheduler;
mod snapshot;
mod table;
mod value;


pub use call_error::{CallError, CallResult, ConfigError};
pub use call_key::{CallKey, CallKeyBuilder};
pub use counters::{MetricsSnapshot, PersistedMetrics};
pub use queue::AdmissionQueue;
pub use scheduler::Scheduler;
pub use snapshot::{PersistedEntry, SnapshotPaths};
pub use table::{CacheEntry, CacheTable};
pub use value::{CacheValue, Value};
