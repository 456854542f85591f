use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use batcher_service::caching::{Scheduler, Value};
use batcher_service::config::Config;
use tokio::runtime::Handle;

use crate::{Producers, read_snapshot, scheduler_in, setup_scheduler, string};

const FAST: Duration = Duration::ZERO;

fn no_metrics_timer(config: &mut Config) {
    config.metrics_persist_interval = Duration::ZERO;
}

#[tokio::test]
async fn test_serializable_values_survive_restart() {
    let (scheduler, snapshot_dir) = setup_scheduler(no_metrics_timer);
    let producers = Producers::new();

    let mut map = BTreeMap::new();
    map.insert("provider".to_owned(), string("openai"));
    map.insert("score".to_owned(), Value::Float(0.5));
    let routed = Value::Map(map);

    scheduler
        .call("route", producers.returning(routed.clone(), FAST), None)
        .await
        .unwrap();
    scheduler
        .call("client", producers.returning(Value::opaque(7u8), FAST), None)
        .await
        .unwrap();
    scheduler
        .call("nan", producers.returning(Value::Float(f64::NAN), FAST), None)
        .await
        .unwrap();
    scheduler.flush().await;

    let persisted = read_snapshot(&snapshot_dir, "cache.json");
    let persisted = persisted.as_object().unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(
        persisted["route"]["v"],
        serde_json::json!({"provider": "openai", "score": 0.5})
    );
    let written_at = persisted["route"]["t"].as_i64().unwrap();
    drop(scheduler);

    let restarted = scheduler_in::<Value>(&snapshot_dir, no_metrics_timer);
    let entries = restarted.cache_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "route");
    assert_eq!(entries[0].1.written_at_ms, written_at);
    assert!(entries[0].1.serializable);

    let restored = Producers::new();
    let value = restarted
        .call("route", restored.returning(Value::Null, FAST), None)
        .await
        .unwrap();
    assert_eq!(value, routed);
    assert_eq!(restored.calls(), 0);

    // non-serializable values are gone after a restart
    restarted
        .call("client", restored.returning(Value::opaque(8u8), FAST), None)
        .await
        .unwrap();
    assert_eq!(restored.calls(), 1);
}

#[tokio::test]
async fn test_restored_entries_keep_their_age() {
    let snapshot_dir = batcher_test::tempdir();
    let now = chrono::Utc::now().timestamp_millis();
    let contents = serde_json::json!({
        "recent": {"v": "cached", "t": now - 1_000},
        "stale": {"v": "cached", "t": now - 10 * 60 * 1_000},
    });
    fs::write(snapshot_dir.path().join("cache.json"), contents.to_string()).unwrap();

    let scheduler = scheduler_in::<Value>(&snapshot_dir, no_metrics_timer);
    let producers = Producers::new();

    let recent = scheduler
        .call("recent", producers.returning(string("fresh"), FAST), None)
        .await
        .unwrap();
    assert_eq!(recent, string("cached"));
    assert_eq!(producers.calls(), 0);

    // older than the default ttl of 5 minutes
    let stale = scheduler
        .call("stale", producers.returning(string("fresh"), FAST), None)
        .await
        .unwrap();
    assert_eq!(stale, string("fresh"));
    assert_eq!(producers.calls(), 1);

    // a per-call ttl can still accept the old entry
    let recent = scheduler
        .call(
            "recent",
            producers.returning(string("fresh"), FAST),
            Some(Duration::from_millis(500)),
        )
        .await
        .unwrap();
    assert_eq!(recent, string("fresh"));
}

#[tokio::test]
async fn test_malformed_snapshots_start_empty() {
    let snapshot_dir = batcher_test::tempdir();
    fs::write(snapshot_dir.path().join("cache.json"), "{\"a\": {\"v\": 1, ").unwrap();
    fs::write(snapshot_dir.path().join("metrics.json"), "not json at all").unwrap();

    let scheduler = scheduler_in::<Value>(&snapshot_dir, no_metrics_timer);
    let metrics = scheduler.metrics();
    assert_eq!(metrics.cache_size, 0);
    assert_eq!(metrics.requests, 0);

    // the broken file is replaced with the next write
    scheduler
        .call("a", || async { Ok(Value::Int(1)) }, None)
        .await
        .unwrap();
    scheduler.flush().await;

    let persisted = read_snapshot(&snapshot_dir, "cache.json");
    assert_eq!(persisted["a"]["v"], 1);
}

#[tokio::test]
async fn test_invalidate_and_clear_are_persisted() {
    let (scheduler, snapshot_dir) = setup_scheduler(no_metrics_timer);
    let producers = Producers::new();

    for key in ["a", "b", "c"] {
        scheduler
            .call(key, producers.returning(string(key), FAST), None)
            .await
            .unwrap();
    }
    scheduler.flush().await;
    assert_eq!(
        read_snapshot(&snapshot_dir, "cache.json")
            .as_object()
            .unwrap()
            .len(),
        3
    );

    scheduler.invalidate("b");
    scheduler.flush().await;
    let persisted = read_snapshot(&snapshot_dir, "cache.json");
    let keys: Vec<_> = persisted.as_object().unwrap().keys().cloned().collect();
    assert_eq!(keys, ["a", "c"]);

    scheduler.clear();
    scheduler.flush().await;
    assert_eq!(
        read_snapshot(&snapshot_dir, "cache.json"),
        serde_json::json!({})
    );
}

#[tokio::test]
async fn test_failures_are_not_persisted() {
    let (scheduler, snapshot_dir) = setup_scheduler(no_metrics_timer);
    let producers = Producers::new();

    let result = scheduler
        .call("x", producers.failing::<Value>("boom", FAST), None)
        .await;
    assert!(result.is_err());
    scheduler.flush().await;

    // nothing cache-affecting happened, so nothing was written
    assert!(!snapshot_dir.path().join("cache.json").exists());
}

#[tokio::test]
async fn test_unwritable_snapshot_dir() {
    let parent = batcher_test::tempdir();
    let blocker = parent.path().join("blocker");
    fs::write(&blocker, "").unwrap();

    let config = Config {
        snapshot_dir: Some(blocker),
        metrics_persist_interval: Duration::ZERO,
        ..Default::default()
    };
    let scheduler = Scheduler::<Value>::new(&config, Handle::current()).unwrap();

    // calls keep working, the failed writes are only logged
    let value = scheduler
        .call("a", || async { Ok(Value::Int(1)) }, None)
        .await
        .unwrap();
    assert_eq!(value, Value::Int(1));
    scheduler.shutdown().await;
    // the metrics snapshot never made it to disk
    assert_eq!(scheduler.metrics().persisted, 0);

    let value = scheduler
        .call("a", || async { Ok(Value::Int(2)) }, None)
        .await
        .unwrap();
    assert_eq!(value, Value::Int(1));
}

#[tokio::test]
async fn test_burst_with_small_snapshot_queue_persists_everything() {
    let (scheduler, snapshot_dir) = setup_scheduler(|config| {
        no_metrics_timer(config);
        config.max_snapshot_queue_size = 1;
    });
    let producers = Producers::new();

    let keys = ["a", "b", "c", "d"];
    let calls = keys.map(|key| scheduler.call(key, producers.returning(string(key), FAST), None));
    let results = futures::future::join_all(calls).await;
    assert!(results.iter().all(Result::is_ok));
    scheduler.shutdown().await;

    let persisted = read_snapshot(&snapshot_dir, "cache.json");
    let persisted: Vec<_> = persisted.as_object().unwrap().keys().cloned().collect();
    assert_eq!(persisted, keys);

    let restarted = scheduler_in::<Value>(&snapshot_dir, no_metrics_timer);
    assert_eq!(restarted.metrics().cache_size, 4);
}

#[tokio::test]
async fn test_shutdown_persists_restored_cache() {
    let snapshot_dir = batcher_test::tempdir();
    let now = chrono::Utc::now().timestamp_millis();
    let contents = serde_json::json!({"kept": {"v": 1, "t": now}});
    fs::write(snapshot_dir.path().join("cache.json"), contents.to_string()).unwrap();

    let scheduler = scheduler_in::<Value>(&snapshot_dir, no_metrics_timer);
    fs::remove_file(snapshot_dir.path().join("cache.json")).unwrap();
    scheduler.shutdown().await;

    let persisted = read_snapshot(&snapshot_dir, "cache.json");
    assert_eq!(persisted["kept"]["v"], 1);
    assert_eq!(persisted["kept"]["t"], now);
}
