use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::runtime::Handle;

use batcher_service::caching::{CacheEntry, MetricsSnapshot, Scheduler};
use batcher_service::config::Config;

#[derive(Debug, Serialize)]
struct Report {
    default_ttl: String,
    metrics: MetricsSnapshot,
    entries: Vec<EntryReport>,
}

#[derive(Debug, Serialize)]
struct EntryReport {
    key: String,
    age: String,
    fresh: bool,
    written_at_ms: i64,
    value: serde_json::Value,
}

impl EntryReport {
    fn new(key: String, entry: CacheEntry<serde_json::Value>, ttl: Duration) -> Self {
        // snapshots are only precise to the millisecond
        let age = Duration::from_millis(entry.age().as_millis() as u64);
        Self {
            key,
            age: humantime::format_duration(age).to_string(),
            fresh: entry.is_fresh(ttl),
            written_at_ms: entry.written_at_ms,
            value: entry.value,
        }
    }
}

/// Loads the snapshots from the configured directory and prints them as JSON.
///
/// Entries are judged against the configured default TTL. Nothing is written back.
pub async fn inspect(config: &Config) -> Result<()> {
    let snapshot_dir = config
        .snapshot_dir
        .as_deref()
        .context("no `snapshot_dir` configured")?;
    tracing::debug!("Inspecting snapshots in {}", snapshot_dir.display());

    let config = Config {
        metrics_persist_interval: Duration::ZERO,
        ..config.clone()
    };
    let scheduler = Scheduler::<serde_json::Value>::new(&config, Handle::current())
        .context("invalid scheduler configuration")?;

    let report = build_report(&scheduler);
    let output = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
    println!("{output}");

    Ok(())
}

fn build_report(scheduler: &Scheduler<serde_json::Value>) -> Report {
    let ttl = scheduler.default_ttl();
    Report {
        default_ttl: humantime::format_duration(ttl).to_string(),
        metrics: scheduler.metrics(),
        entries: scheduler
            .cache_entries()
            .into_iter()
            .map(|(key, entry)| EntryReport::new(key, entry, ttl))
            .collect(),
    }
}
