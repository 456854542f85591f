use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sentry::{Hub, SentryFutureExt};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::counters::{Counters, PersistedMetrics};
use super::table::{CacheEntry, CacheTable};
use super::value::CacheValue;

/// The name of the cache snapshot inside the snapshot directory.
pub const CACHE_SNAPSHOT: &str = "cache.json";
/// The name of the metrics snapshot inside the snapshot directory.
pub const METRICS_SNAPSHOT: &str = "metrics.json";

/// Locations of the two snapshot files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub cache: PathBuf,
    pub metrics: PathBuf,
}

impl SnapshotPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cache: dir.join(CACHE_SNAPSHOT),
            metrics: dir.join(METRICS_SNAPSHOT),
        }
    }
}

/// A single entry of the cache snapshot.
///
/// `t` is the time the value was written, in milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub v: serde_json::Value,
    pub t: i64,
}

fn read_json(path: &Path) -> Option<serde_json::Value> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No snapshot found");
            return None;
        }
        Err(err) => {
            let stderr: &dyn std::error::Error = &err;
            tracing::warn!(stderr, path = %path.display(), "Failed to read snapshot");
            return None;
        }
    };
    match serde_json::from_slice(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            let stderr: &dyn std::error::Error = &err;
            tracing::warn!(stderr, path = %path.display(), "Malformed snapshot, ignoring it");
            None
        }
    }
}

/// Loads the entries of the cache snapshot at `path`.
///
/// Only entries with a numeric timestamp and a value are restored. The age of each entry is
/// derived from its timestamp, so entries that were already stale on disk stay stale. Any problem
/// with the file results in an empty cache.
pub fn load_cache<V: CacheValue>(path: &Path) -> Vec<(String, CacheEntry<V>)> {
    let Some(serde_json::Value::Object(map)) = read_json(path) else {
        return vec![];
    };

    let now = Instant::now();
    let now_ms = chrono::Utc::now().timestamp_millis();

    let mut entries = Vec::with_capacity(map.len());
    for (key, entry) in map {
        let serde_json::Value::Object(mut entry) = entry else {
            continue;
        };
        let Some(t) = entry.get("t").and_then(|t| t.as_i64().or_else(|| Some(t.as_f64()? as i64)))
        else {
            continue;
        };
        let Some(value) = entry.remove("v").and_then(V::from_persisted) else {
            continue;
        };

        // timestamps from the future count as written just now
        let age = Duration::from_millis(now_ms.saturating_sub(t).max(0) as u64);
        let Some(written_at) = now.checked_sub(age) else {
            tracing::debug!(key = %key, "Snapshot entry is too old to be restored");
            continue;
        };

        entries.push((
            key,
            CacheEntry {
                value,
                written_at,
                written_at_ms: t,
                serializable: true,
            },
        ));
    }

    tracing::debug!(path = %path.display(), "Restored {} cache entries", entries.len());
    entries
}

/// Loads the counters of the metrics snapshot at `path`.
pub fn load_metrics(path: &Path) -> PersistedMetrics {
    read_json(path)
        .map(|value| PersistedMetrics::from_json(&value))
        .unwrap_or_default()
}

/// The state a [`SnapshotWriter`] reads from whenever it gets to write.
pub(super) struct SnapshotSource<V> {
    pub cache: Arc<CacheTable<V>>,
    pub counters: Arc<Counters>,
}

/// Which snapshots are out of date.
#[derive(Debug, Default)]
struct PendingSnapshots {
    cache: AtomicBool,
    metrics: AtomicBool,
}

enum SnapshotMessage {
    /// At least one snapshot is out of date.
    Wake,
    /// Reply once everything requested so far has been written.
    Flush(oneshot::Sender<()>),
}

/// Hands snapshots to a background writer.
///
/// Requesting a snapshot only marks it as out of date. The writer takes the snapshot from the
/// [`SnapshotSource`] once it is ready to write, so every write contains the latest state and
/// requests that pile up during a slow write collapse into a single one. Nobody waits for a
/// write to finish, unless they explicitly [`flush`](Self::flush).
#[derive(Debug, Clone)]
pub(super) struct SnapshotWriter {
    pending: Arc<PendingSnapshots>,
    queue_tx: mpsc::Sender<SnapshotMessage>,
}

impl SnapshotWriter {
    pub fn spawn<V: CacheValue>(
        paths: SnapshotPaths,
        source: SnapshotSource<V>,
        max_queue_size: usize,
        runtime: &Handle,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(max_queue_size.max(1));
        let pending = Arc::new(PendingSnapshots::default());
        let worker = Self::write_worker(queue_rx, paths, source, Arc::clone(&pending));
        runtime.spawn(worker.bind_hub(Hub::new_from_top(Hub::current())));
        Self { pending, queue_tx }
    }

    /// Requests a write of the cache snapshot.
    pub fn persist_cache(&self) {
        self.request(&self.pending.cache, "cache");
    }

    /// Requests a write of the metrics snapshot.
    pub fn persist_metrics(&self) {
        self.request(&self.pending.metrics, "metrics");
    }

    fn request(&self, flag: &AtomicBool, kind: &'static str) {
        if flag.swap(true, Ordering::SeqCst) {
            // the writer has not picked up the previous request yet
            metric!(counter("batcher.snapshot.coalesced") += 1, "kind" => kind);
            return;
        }
        match self.queue_tx.try_send(SnapshotMessage::Wake) {
            // a full queue is drained by the writer, which picks up the flag along the way
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Snapshot writer is gone, dropping {} snapshot", kind);
            }
        }
    }

    /// Waits until every snapshot requested before this call has been written (or has failed).
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .queue_tx
            .send(SnapshotMessage::Flush(done_tx))
            .await
            .is_ok()
        {
            done_rx.await.ok();
        }
    }

    async fn write_worker<V: CacheValue>(
        mut queue_rx: mpsc::Receiver<SnapshotMessage>,
        paths: SnapshotPaths,
        source: SnapshotSource<V>,
        pending: Arc<PendingSnapshots>,
    ) {
        while let Some(message) = queue_rx.recv().await {
            if pending.cache.swap(false, Ordering::SeqCst) {
                let entries = source.cache.persisted_snapshot();
                let result = write_json(paths.cache.clone(), entries).await;
                record_write("cache", &paths.cache, result);
            }

            if pending.metrics.swap(false, Ordering::SeqCst) {
                // the snapshot counts itself, but only once it made it to disk
                let mut metrics = source.counters.to_persisted();
                metrics.persisted += 1;
                let result = write_json(paths.metrics.clone(), metrics).await;
                if record_write("metrics", &paths.metrics, result) {
                    source.counters.record_persisted();
                }
            }

            if let SnapshotMessage::Flush(done_tx) = message {
                done_tx.send(()).ok();
            }
        }
        tracing::info!("Snapshot writer terminated");
    }
}

/// Logs and counts the outcome of a snapshot write, returning whether it succeeded.
fn record_write(kind: &'static str, path: &Path, result: io::Result<()>) -> bool {
    match result {
        Ok(()) => {
            metric!(
                counter("batcher.snapshot.write") += 1,
                "kind" => kind,
                "status" => "ok",
            );
            true
        }
        Err(err) => {
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(
                stderr,
                path = %path.display(),
                "Failed to write {} snapshot",
                kind,
            );
            metric!(
                counter("batcher.snapshot.write") += 1,
                "kind" => kind,
                "status" => "error",
            );
            false
        }
    }
}

async fn write_json<T>(path: PathBuf, contents: T) -> io::Result<()>
where
    T: Serialize + Send + 'static,
{
    tokio::task::spawn_blocking(move || write_atomically(&path, &contents))
        .await
        .map_err(io::Error::other)?
}

/// Replaces the file at `path`, so readers never observe a partially written snapshot.
fn write_atomically(path: &Path, contents: &impl Serialize) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist snapshot"))?;
    fs::create_dir_all(parent)?;

    let mut temp_file = NamedTempFile::new_in(parent)?;
    {
        let mut writer = BufWriter::new(temp_file.as_file_mut());
        serde_json::to_writer(&mut writer, contents)?;
        writer.flush()?;
    }
    temp_file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::caching::Value;

    fn source(cache: CacheTable<Value>, counters: Counters) -> SnapshotSource<Value> {
        SnapshotSource {
            cache: Arc::new(cache),
            counters: Arc::new(counters),
        }
    }

    #[tokio::test]
    async fn test_write_and_load_cache() {
        let dir = batcher_test::tempdir();
        let paths = SnapshotPaths::in_dir(&dir.path().join("nested"));

        let written_at = chrono::Utc::now().timestamp_millis() - 1_000;
        let mut answer = BTreeMap::new();
        answer.insert("answer".to_owned(), Value::Int(42));
        let entry = CacheEntry {
            value: Value::Map(answer.clone()),
            written_at: Instant::now(),
            written_at_ms: written_at,
            serializable: true,
        };
        let cache = CacheTable::from_entries([("a".to_owned(), entry)]);
        let source = source(cache, Counters::default());
        let writer = SnapshotWriter::spawn(paths.clone(), source, 4, &Handle::current());

        writer.persist_cache();
        writer.flush().await;

        let loaded = load_cache::<Value>(&paths.cache);
        assert_eq!(loaded.len(), 1);
        let (key, entry) = &loaded[0];
        assert_eq!(key, "a");
        assert_eq!(entry.written_at_ms, written_at);
        assert!(entry.serializable);
        assert!(entry.age() >= Duration::from_millis(1_000));
        assert!(entry.age() < Duration::from_secs(60));
        assert_eq!(entry.value, Value::Map(answer));
    }

    #[tokio::test]
    async fn test_load_filters_entries() {
        let dir = batcher_test::tempdir();
        let path = dir.path().join(CACHE_SNAPSHOT);
        let now = chrono::Utc::now().timestamp_millis();
        let contents = serde_json::json!({
            "ok": {"v": "value", "t": now},
            "float-timestamp": {"v": 1, "t": now as f64},
            "null-value": {"v": null, "t": now},
            "string-timestamp": {"v": "value", "t": "yesterday"},
            "missing-value": {"t": now},
            "missing-timestamp": {"v": "value"},
            "not-an-object": 5,
        });
        fs::write(&path, contents.to_string()).unwrap();

        let loaded = load_cache::<Value>(&path);
        let mut keys: Vec<_> = loaded.iter().map(|(key, _)| key.as_str()).collect();
        keys.sort();
        assert_eq!(keys, ["float-timestamp", "null-value", "ok"]);
    }

    #[test]
    fn test_load_malformed_files() {
        let dir = batcher_test::tempdir();
        let paths = SnapshotPaths::in_dir(dir.path());

        // missing files
        assert!(load_cache::<Value>(&paths.cache).is_empty());
        assert_eq!(load_metrics(&paths.metrics), PersistedMetrics::default());

        fs::write(&paths.cache, "{ not json").unwrap();
        fs::write(&paths.metrics, "[1, 2").unwrap();
        assert!(load_cache::<Value>(&paths.cache).is_empty());
        assert_eq!(load_metrics(&paths.metrics), PersistedMetrics::default());

        fs::write(&paths.cache, "[]").unwrap();
        assert!(load_cache::<Value>(&paths.cache).is_empty());
    }

    #[tokio::test]
    async fn test_write_and_load_metrics() {
        let dir = batcher_test::tempdir();
        let paths = SnapshotPaths::in_dir(dir.path());
        let source = source(
            CacheTable::default(),
            Counters::from_persisted(PersistedMetrics {
                requests: 4,
                hits: 1,
                misses: 3,
                persisted: 9,
            }),
        );
        let counters = Arc::clone(&source.counters);
        let writer = SnapshotWriter::spawn(paths.clone(), source, 4, &Handle::current());

        writer.persist_metrics();
        writer.flush().await;

        let expected = PersistedMetrics {
            requests: 4,
            hits: 1,
            misses: 3,
            persisted: 10,
        };
        assert_eq!(load_metrics(&paths.metrics), expected);
        assert_eq!(counters.to_persisted(), expected);
    }

    #[tokio::test]
    async fn test_latest_state_wins_when_the_queue_is_full() {
        let dir = batcher_test::tempdir();
        let paths = SnapshotPaths::in_dir(dir.path());
        let source = source(CacheTable::default(), Counters::default());
        let cache = Arc::clone(&source.cache);
        let counters = Arc::clone(&source.counters);

        // the worker does not get to run before the test yields
        let writer = SnapshotWriter::spawn(paths.clone(), source, 1, &Handle::current());
        for key in ["a", "b", "c", "d"] {
            cache.put(key, Value::from(key), true);
            writer.persist_cache();
            counters.record_request();
            writer.persist_metrics();
        }
        writer.flush().await;

        let loaded = load_cache::<Value>(&paths.cache);
        let keys: Vec<_> = loaded.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys.len(), 4);
        for key in ["a", "b", "c", "d"] {
            assert!(keys.contains(&key), "{key} is missing");
        }

        // all requests collapsed into a single write
        let metrics = load_metrics(&paths.metrics);
        assert_eq!(metrics.requests, 4);
        assert_eq!(metrics.persisted, 1);
    }

    #[tokio::test]
    async fn test_write_failures_are_swallowed() {
        let dir = batcher_test::tempdir();
        // the snapshot directory is a regular file, so no writes can succeed
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let paths = SnapshotPaths::in_dir(&blocker);
        let source = source(CacheTable::default(), Counters::default());
        let counters = Arc::clone(&source.counters);

        let writer = SnapshotWriter::spawn(paths.clone(), source, 4, &Handle::current());
        writer.persist_metrics();
        writer.persist_cache();
        writer.flush().await;

        assert!(!paths.metrics.exists());
        assert!(!paths.cache.exists());
        // only successful writes are counted
        assert_eq!(counters.to_persisted().persisted, 0);
    }
}
