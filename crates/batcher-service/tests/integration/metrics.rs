use std::fs;
use std::time::Duration;

use batcher_service::caching::Value;

use crate::{Producers, read_snapshot, scheduler_in, setup_scheduler};

#[tokio::test]
async fn test_counters_continue_from_snapshot() {
    let snapshot_dir = batcher_test::tempdir();
    let contents = serde_json::json!({
        "requests": 10,
        "hits": 4,
        "misses": 6,
        "persisted": 2,
        "unrelated": "ignored",
    });
    fs::write(snapshot_dir.path().join("metrics.json"), contents.to_string()).unwrap();

    let scheduler = scheduler_in::<Value>(&snapshot_dir, |config| {
        config.metrics_persist_interval = Duration::ZERO;
    });
    let metrics = scheduler.metrics();
    assert_eq!(metrics.requests, 10);
    assert_eq!(metrics.hits, 4);
    assert_eq!(metrics.misses, 6);
    assert_eq!(metrics.persisted, 2);

    scheduler
        .call("a", || async { Ok(Value::Null) }, None)
        .await
        .unwrap();
    let metrics = scheduler.metrics();
    assert_eq!(metrics.requests, 11);
    assert_eq!(metrics.misses, 7);
}

#[tokio::test]
async fn test_mistyped_counters_are_dropped() {
    let snapshot_dir = batcher_test::tempdir();
    let contents = serde_json::json!({
        "requests": "ten",
        "hits": 1.5,
        "misses": 3,
        "persisted": null,
    });
    fs::write(snapshot_dir.path().join("metrics.json"), contents.to_string()).unwrap();

    let scheduler = scheduler_in::<Value>(&snapshot_dir, |_| {});
    let metrics = scheduler.metrics();
    assert_eq!(metrics.requests, 0);
    assert_eq!(metrics.hits, 0);
    assert_eq!(metrics.misses, 3);
    assert_eq!(metrics.persisted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_are_persisted_periodically() {
    let (scheduler, snapshot_dir) = setup_scheduler(|_| {});
    let producers = Producers::new();

    scheduler
        .call("a", producers.returning(Value::Int(1), Duration::ZERO), None)
        .await
        .unwrap();
    scheduler
        .call("a", producers.returning(Value::Int(2), Duration::ZERO), None)
        .await
        .unwrap();
    scheduler.flush().await;
    assert!(!snapshot_dir.path().join("metrics.json").exists());

    tokio::time::sleep(Duration::from_secs(31)).await;
    scheduler.flush().await;

    let persisted = read_snapshot(&snapshot_dir, "metrics.json");
    assert_eq!(
        persisted,
        serde_json::json!({
            "requests": 2,
            "hits": 1,
            "misses": 1,
            "persisted": 1,
        })
    );
    assert_eq!(scheduler.metrics().persisted, 1);
}

#[tokio::test]
async fn test_shutdown_persists_metrics() {
    let (scheduler, snapshot_dir) = setup_scheduler(|config| {
        config.metrics_persist_interval = Duration::ZERO;
    });

    scheduler
        .call("a", || async { Ok(Value::Int(1)) }, None)
        .await
        .unwrap();
    scheduler.shutdown().await;

    let persisted = read_snapshot(&snapshot_dir, "metrics.json");
    assert_eq!(persisted["requests"], 1);
    assert_eq!(persisted["persisted"], 1);
    drop(scheduler);

    // the next process picks up where this one left off
    let restarted = scheduler_in::<Value>(&snapshot_dir, |config| {
        config.metrics_persist_interval = Duration::ZERO;
    });
    let metrics = restarted.metrics();
    assert_eq!(metrics.requests, 1);
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.persisted, 1);
    assert_eq!(metrics.cache_size, 1);
}
