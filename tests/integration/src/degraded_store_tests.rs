//! Serving while the shared store is unreachable

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use gateway_config::TierLimit;
use gateway_core::{ErrorKind, ResponseSource};
use gateway_resilience::CacheManager;
use gateway_store::{KeySpace, SharedStore};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn degraded_config(edit: impl FnOnce(&mut gateway_config::GatewayConfig)) -> gateway_config::GatewayConfig {
    config_with(|c| {
        c.queue.enabled = false;
        edit(c);
    })
}

#[tokio::test]
async fn test_requests_complete_with_store_down() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT));
    let gw = TestGateway::start(degraded_config(|_| {}), &[provider.clone()]);
    gw.switch.set_available(false);

    for i in 0..3 {
        let events = gw.run(uncached_request("user-1", &format!("q{i}"))).await;
        assert_eq!(source(&events), Some(ResponseSource::Direct));
        assert_completed(&events);
    }
    assert_eq!(provider.calls(), 3);
    assert!(gw.switch.rejected_count() > 0);
    assert!(gw.gateway.orchestrator().pool().stats().local_fallbacks >= 3);

    gw.stop().await;
}

#[tokio::test]
async fn test_rate_limit_enforced_locally_with_store_down() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT));
    let config = degraded_config(|c| {
        c.rate_limit.authenticated = TierLimit {
            limit: 3,
            window: Duration::from_secs(3600),
        };
    });
    let gw = TestGateway::start(config, &[provider.clone()]);
    gw.switch.set_available(false);

    for i in 0..3 {
        assert_completed(&gw.run(uncached_request("user-1", &format!("q{i}"))).await);
    }
    let rejected = gw.run(uncached_request("user-1", "q3")).await;
    assert_eq!(error_kind(&rejected), Some(ErrorKind::RateLimitExceeded));
    assert_eq!(provider.calls(), 3);
    assert!(gw.gateway.orchestrator().rate_limiter().stats().sync_failures > 0);

    gw.stop().await;
}

#[tokio::test]
async fn test_identity_cap_enforced_locally_with_store_down() {
    let gate = Gate::closed();
    let provider = Arc::new(MockProvider::new("primary", SCRIPT).with_gate(gate.clone()));
    let config = degraded_config(|c| c.pool.per_identity_capacity = 1);
    let gw = TestGateway::start(config, &[provider.clone()]);
    gw.switch.set_available(false);

    let mut held = gw.handle(uncached_request("alice", "held"));
    assert_eq!(first_source(&mut held).await, Some(ResponseSource::Direct));

    let capped = gw.run(uncached_request("alice", "second")).await;
    assert_eq!(capped.len(), 1);
    assert_eq!(error_kind(&capped), Some(ErrorKind::IdentityAdmissionExceeded));

    let mut other = gw.handle(uncached_request("bob", "other"));
    assert_eq!(first_source(&mut other).await, Some(ResponseSource::Direct));

    gate.open();
    assert_completed(&collect_events(held).await);
    assert_completed(&collect_events(other).await);

    // The local slot was returned, so the identity is admitted again
    assert_completed(&gw.run(uncached_request("alice", "third")).await);

    gw.stop().await;
}

/// The failover queue lives in the store too, so a request the full local
/// pool would divert is rejected as exhaustion instead
#[tokio::test]
async fn test_full_local_pool_with_store_down_is_exhaustion() {
    let gate = Gate::closed();
    let provider = Arc::new(MockProvider::new("primary", SCRIPT).with_gate(gate.clone()));
    let config = config_with(|c| {
        c.pool.global_capacity = 1;
        c.pool.per_identity_capacity = 1;
    });
    assert!(config.queue.enabled);
    let gw = TestGateway::start(config, &[provider.clone()]);
    gw.switch.set_available(false);

    let mut held = gw.handle(uncached_request("alice", "held"));
    assert_eq!(first_source(&mut held).await, Some(ResponseSource::Direct));

    let rejected = gw.run(uncached_request("bob", "diverted")).await;
    assert_eq!(rejected.len(), 1);
    assert_eq!(error_kind(&rejected), Some(ErrorKind::ConnectionPoolExhausted));
    assert_eq!(gw.gateway.orchestrator().stats().queued, 0);

    gate.open();
    assert_completed(&collect_events(held).await);
    assert_eq!(provider.calls(), 1);

    gw.stop().await;
}

/// Responses written while the store is down live in the local tier
#[tokio::test]
async fn test_local_cache_serves_with_store_down() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT));
    let gw = TestGateway::start(degraded_config(|_| {}), &[provider.clone()]);
    gw.switch.set_available(false);

    let first = gw.run(request("user-1", "cache me")).await;
    assert_eq!(source(&first), Some(ResponseSource::Direct));
    assert_completed(&first);

    let second = gw.run(request("user-1", "cache me")).await;
    assert_eq!(source(&second), Some(ResponseSource::Cache));
    assert_eq!(chunk_text(&second), provider.full_text());
    assert_eq!(provider.calls(), 1);

    let stats = gw.gateway.orchestrator().cache().stats();
    assert_eq!(stats.local_hits, 1);

    gw.stop().await;
}

#[tokio::test]
async fn test_shared_state_resumes_after_store_returns() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT));
    let gw = TestGateway::start(degraded_config(|_| {}), &[provider.clone()]);

    gw.switch.set_available(false);
    assert_completed(&gw.run(uncached_request("user-1", "during outage")).await);

    gw.switch.set_available(true);
    let ops_before = gw.switch.op_count();
    let events = gw.run(request("user-1", "after outage")).await;
    assert_completed(&events);
    assert!(gw.switch.op_count() > ops_before);

    // The response reached the shared tier again
    let key = CacheManager::request_key(&request("user-1", "after outage"));
    let (memory, shared_key) = (&gw.memory, &KeySpace::new("it").cache(&key));
    let cached = eventually(Duration::from_secs(2), || async move {
        matches!(memory.get(shared_key).await, Ok(Some(_)))
    })
    .await;
    assert!(cached);

    let gw_ref = &gw;
    let drained = eventually(Duration::from_secs(2), || async move {
        gw_ref.active_slots().await == 0
    })
    .await;
    assert!(drained);

    gw.stop().await;
}
