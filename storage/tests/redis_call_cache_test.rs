//! Integration tests for the Redis cache tier.

use relay_core::{CallDirection, CallState};
use std::time::Duration;
use storage::{CallCache, RedisCallCache};
use testing::{redis, unique_call_id, unique_key_prefix};

async fn cache(ttl: Option<Duration>) -> Option<RedisCallCache> {
    let fixture = redis().await?;
    Some(
        RedisCallCache::new(fixture.url(), unique_key_prefix(), ttl)
            .await
            .expect("Failed to connect to Redis")
    )
}

fn call() -> CallState {
    CallState::new(unique_call_id(), "telnyx", CallDirection::Inbound, "+1", "+2")
}

#[tokio::test]
async fn test_put_get_evict() {
    let Some(cache) = cache(None).await else {
        eprintln!("Skipping Redis test: Docker not available");
        return;
    };

    let c = call();
    cache.put(&c).await.unwrap();

    let fetched = cache.get(&c.call_id).await.unwrap().unwrap();
    assert_eq!(fetched, c);

    let by_session = cache.get_by_session(c.session_id).await.unwrap().unwrap();
    assert_eq!(by_session.call_id, c.call_id);

    cache.evict(&c.call_id, c.session_id).await.unwrap();
    assert!(cache.get(&c.call_id).await.unwrap().is_none());
    assert!(cache.get_by_session(c.session_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_entries_expire() {
    let Some(cache) = cache(Some(Duration::from_secs(1))).await else {
        eprintln!("Skipping Redis test: Docker not available");
        return;
    };

    let c = call();
    cache.put(&c).await.unwrap();
    assert!(cache.get(&c.call_id).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(cache.get(&c.call_id).await.unwrap().is_none());
}
