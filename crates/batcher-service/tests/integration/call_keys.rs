use std::time::Duration;

use batcher_service::caching::CallKey;

use crate::{Producers, read_snapshot, setup_scheduler, string};

#[tokio::test]
async fn test_memoize_provider_queries() {
    let (scheduler, snapshot_dir) = setup_scheduler(|config| {
        config.metrics_persist_interval = Duration::ZERO;
    });
    let producers = Producers::new();

    let key = CallKey::for_query("openai", "what is the capital of france");
    let same_key = CallKey::for_query("openai", "what is the capital of france");
    let other_provider = CallKey::for_query("anthropic", "what is the capital of france");

    for key in [&key, &same_key, &other_provider] {
        let value = scheduler
            .call(
                key.as_str(),
                producers.returning(string("paris"), Duration::ZERO),
                None,
            )
            .await
            .unwrap();
        assert_eq!(value, string("paris"));
    }
    assert_eq!(producers.calls(), 2);

    scheduler.flush().await;
    let persisted = read_snapshot(&snapshot_dir, "cache.json");
    let mut keys: Vec<_> = persisted.as_object().unwrap().keys().cloned().collect();
    keys.sort();
    assert_eq!(keys.len(), 2);
    assert!(keys[0].starts_with("anthropic/"));
    assert!(keys[1].starts_with("openai/"));
    assert_eq!(persisted[key.as_str()]["v"], "paris");
}
