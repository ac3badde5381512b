//! Dual-tier store against real PostgreSQL and Redis.

use relay_core::{CallDirection, CallState, CallStatus};
use std::sync::Arc;
use storage::{CallCache, CallStateStore, PostgresCallStore, RedisCallCache};
use testing::{postgres, redis, unique_call_id, unique_key_prefix};

#[tokio::test]
async fn test_register_end_and_recover() {
    let (Some(pg), Some(rd)) = (postgres().await, redis().await) else {
        eprintln!("Skipping dual-tier test: Docker not available");
        return;
    };

    let durable = PostgresCallStore::new(pg.url()).await.unwrap();
    durable.initialize_schema().await.unwrap();
    let cache = Arc::new(
        RedisCallCache::new(rd.url(), unique_key_prefix(), None)
            .await
            .unwrap()
    );
    let store = CallStateStore::new(Arc::new(durable), Some(cache.clone()));

    let first = CallState::new(unique_call_id(), "twilio", CallDirection::Inbound, "+1", "+2");
    let second = CallState::new(unique_call_id(), "twilio", CallDirection::Inbound, "+1", "+3");
    store.register_call(first.clone()).await.unwrap();
    store.register_call(second.clone()).await.unwrap();

    store
        .end_call(&first.call_id, CallStatus::Completed, None)
        .await
        .unwrap();
    assert!(cache.get(&first.call_id).await.unwrap().is_none());

    cache.evict(&second.call_id, second.session_id).await.unwrap();
    let recovered = store.recover_active_calls().await.unwrap();
    assert!(recovered.iter().any(|c| c.call_id == second.call_id));
    assert!(!recovered.iter().any(|c| c.call_id == first.call_id));
    assert!(cache.get(&second.call_id).await.unwrap().is_some());

    let ended = store.get_call(&first.call_id).await.unwrap().unwrap();
    assert_eq!(ended.status, CallStatus::Completed);
    assert!(ended.ended_at.is_some());
}
