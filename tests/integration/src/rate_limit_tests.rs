//! Rate limiting through the full pipeline

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use gateway_config::TierLimit;
use gateway_core::{ErrorKind, IdentityTier, StreamEvent};
use gateway_store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

fn limited(limit: u64, window: Duration) -> gateway_config::GatewayConfig {
    config_with(|c| c.rate_limit.authenticated = TierLimit { limit, window })
}

/// Limit 5 per ten minutes: the sixth rapid request is rejected with a retry hint
#[tokio::test]
async fn test_sixth_request_in_window_is_rejected() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT));
    let gw = TestGateway::start(limited(5, Duration::from_secs(600)), &[provider.clone()]);

    for i in 0..5 {
        let events = gw.run(uncached_request("user-1", &format!("q{i}"))).await;
        assert_completed(&events);
    }

    let rejected = gw.run(uncached_request("user-1", "q5")).await;
    assert_eq!(rejected.len(), 1);
    match &rejected[0] {
        StreamEvent::Error { error } => {
            assert_eq!(error.kind, ErrorKind::RateLimitExceeded);
            let retry_after = error.retry_after_ms.expect("retry-after hint");
            assert!(retry_after <= 600_000);
        }
        other => panic!("expected rate limit error, got {other:?}"),
    }
    assert_eq!(provider.calls(), 5);

    gw.stop().await;
}

#[tokio::test]
async fn test_identities_are_limited_independently() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT));
    let gw = TestGateway::start(limited(2, Duration::from_secs(3600)), &[provider.clone()]);

    for i in 0..2 {
        assert_completed(&gw.run(uncached_request("alice", &format!("q{i}"))).await);
    }
    assert_eq!(
        error_kind(&gw.run(uncached_request("alice", "q2")).await),
        Some(ErrorKind::RateLimitExceeded)
    );
    assert_completed(&gw.run(uncached_request("bob", "q0")).await);

    gw.stop().await;
}

#[tokio::test]
async fn test_anonymous_tier_has_its_own_limit() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT));
    let config = config_with(|c| {
        c.rate_limit.anonymous = TierLimit {
            limit: 1,
            window: Duration::from_secs(3600),
        };
    });
    let gw = TestGateway::start(config, &[provider.clone()]);

    let anonymous = |query: &str| {
        let mut request = uncached_request("10.0.0.1", query);
        request.tier = IdentityTier::Anonymous;
        request
    };

    assert_completed(&gw.run(anonymous("a")).await);
    assert_eq!(
        error_kind(&gw.run(anonymous("b")).await),
        Some(ErrorKind::RateLimitExceeded)
    );
    // Same identity string in the authenticated tier is counted separately
    assert_completed(&gw.run(uncached_request("10.0.0.1", "c")).await);

    gw.stop().await;
}

#[tokio::test]
async fn test_cache_hits_do_not_consume_rate() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT));
    let gw = TestGateway::start(limited(1, Duration::from_secs(3600)), &[provider.clone()]);

    assert_completed(&gw.run(request("user-1", "popular")).await);
    for _ in 0..3 {
        assert_completed(&gw.run(request("user-1", "popular")).await);
    }
    assert_eq!(provider.calls(), 1);

    gw.stop().await;
}

/// Two instances sharing one store admit at most the limit plus a bounded overshoot
#[tokio::test]
async fn test_admissions_across_instances_stay_near_limit() {
    const LIMIT: u64 = 20;
    let memory = Arc::new(MemoryStore::new());
    let provider = Arc::new(MockProvider::new("primary", &["ok"]));
    let config = || {
        let mut config = limited(LIMIT, Duration::from_secs(3600));
        config.queue.enabled = false;
        config
    };
    let a = TestGateway::start_on(config(), &[provider.clone()], memory.clone());
    let b = TestGateway::start_on(config(), &[provider.clone()], memory);

    let mut admitted = 0u64;
    for i in 0..60 {
        let gw = if i % 2 == 0 { &a } else { &b };
        let events = gw.run(uncached_request("shared-user", &format!("q{i}"))).await;
        if matches!(events.last(), Some(StreamEvent::Complete { .. })) {
            admitted += 1;
        } else {
            assert_eq!(error_kind(&events), Some(ErrorKind::RateLimitExceeded));
        }
    }

    // Each instance may hold up to (1 - high_water_ratio) * limit unsynced admits
    let ratio = 0.8;
    let overshoot = (2.0 * (1.0 - ratio) * LIMIT as f64).ceil() as u64;
    assert!(admitted >= LIMIT, "admitted {admitted}");
    assert!(admitted <= LIMIT + overshoot, "admitted {admitted}");

    a.stop().await;
    b.stop().await;
}
