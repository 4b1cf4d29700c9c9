//! Cache-aside behaviour through the full pipeline

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use gateway_core::{ResponseSource, StreamEvent};
use gateway_store::MemoryStore;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

/// Identical query and model twice within the TTL reach the backend once
#[tokio::test]
async fn test_identical_request_served_from_cache() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT));
    let gw = TestGateway::start(test_config(), &[provider.clone()]);

    let first = gw.run(request("user-1", "What is a fox?")).await;
    assert_completed(&first);
    assert_eq!(source(&first), Some(ResponseSource::Direct));
    assert_eq!(chunk_text(&first), provider.full_text());

    let mut again = request("user-2", "  What   is a fox? ");
    again.model = TEST_MODEL.to_uppercase();
    let second = gw.run(again).await;

    assert_completed(&second);
    assert_eq!(source(&second), Some(ResponseSource::Cache));
    assert_eq!(chunk_text(&second), provider.full_text());
    assert_eq!(provider.calls(), 1);

    gw.stop().await;
}

#[tokio::test]
async fn test_uncacheable_request_always_reaches_backend() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT));
    let gw = TestGateway::start(test_config(), &[provider.clone()]);

    for _ in 0..2 {
        let events = gw.run(uncached_request("user-1", "same question")).await;
        assert_completed(&events);
        assert_eq!(source(&events), Some(ResponseSource::Direct));
    }
    assert_eq!(provider.calls(), 2);

    gw.stop().await;
}

#[tokio::test]
async fn test_failed_stream_is_not_cached() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT).with_behavior(MockBehavior::FailAfter(3)));
    let gw = TestGateway::start(test_config(), &[provider.clone()]);

    let failed = gw.run(request("user-1", "flaky")).await;
    assert_single_terminal(&failed);
    assert!(error_kind(&failed).is_some());
    assert_eq!(chunk_indices(&failed), vec![0, 1, 2]);

    provider.set_behavior(MockBehavior::Succeed);
    let retried = gw.run(request("user-1", "flaky")).await;
    assert_completed(&retried);
    assert_eq!(source(&retried), Some(ResponseSource::Direct));
    assert_eq!(provider.calls(), 2);

    gw.stop().await;
}

#[tokio::test]
async fn test_cache_is_shared_between_instances() {
    let memory = Arc::new(MemoryStore::new());
    let provider_a = Arc::new(MockProvider::new("primary", SCRIPT));
    let provider_b = Arc::new(MockProvider::new("primary", SCRIPT));
    let a = TestGateway::start_on(test_config(), &[provider_a.clone()], memory.clone());
    let b = TestGateway::start_on(test_config(), &[provider_b.clone()], memory);

    assert_completed(&a.run(request("user-1", "shared")).await);

    // The shared write happens in the background
    let key = gateway_resilience::CacheManager::request_key(&request("x", "shared"));
    let (cache, key) = (b.gateway.orchestrator().cache(), &key);
    let cached = eventually(Duration::from_secs(2), || async move {
        cache.lookup(key).await.is_some()
    })
    .await;
    assert!(cached);

    let events = b.run(request("user-2", "shared")).await;
    assert_eq!(source(&events), Some(ResponseSource::Cache));
    assert!(matches!(events.last(), Some(StreamEvent::Complete { chunk_count: 1, .. })));
    assert_eq!(provider_b.calls(), 0);

    a.stop().await;
    b.stop().await;
}
