use batcher_service::caching::{CacheValue, Scheduler, Value};
use batcher_service::config::Config;
use batcher_test as test;

pub use test::{Producers, TempDir};

/// Setup tests and create a scheduler that persists to a fresh snapshot directory.
///
/// The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as guard until
/// the test has finished. The `update_config` closure can modify any default configuration before
/// the scheduler is created.
pub fn setup_scheduler(update_config: impl FnOnce(&mut Config)) -> (Scheduler, TempDir) {
    let snapshot_dir = test::tempdir();
    let scheduler = scheduler_in(&snapshot_dir, update_config);
    (scheduler, snapshot_dir)
}

/// Creates a scheduler using an existing snapshot directory, as a restarted process would.
pub fn scheduler_in<V: CacheValue>(
    snapshot_dir: &TempDir,
    update_config: impl FnOnce(&mut Config),
) -> Scheduler<V> {
    test::setup();

    let mut config = Config {
        snapshot_dir: Some(snapshot_dir.path().to_owned()),
        ..Default::default()
    };
    update_config(&mut config);

    let handle = tokio::runtime::Handle::current();
    Scheduler::new(&config, handle).unwrap()
}

/// Reads one of the snapshot files as JSON.
#[track_caller]
pub fn read_snapshot(snapshot_dir: &TempDir, name: &str) -> serde_json::Value {
    let contents = std::fs::read(snapshot_dir.path().join(name)).unwrap();
    serde_json::from_slice(&contents).unwrap()
}

pub fn string(s: &str) -> Value {
    Value::from(s)
}
