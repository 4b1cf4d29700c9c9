//! Circuit breaking and backend failover

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use gateway_core::{BackendErrorKind, ErrorKind};
use gateway_resilience::CircuitState;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const RECOVERY: Duration = Duration::from_millis(300);

fn breaker_config(threshold: u32) -> gateway_config::GatewayConfig {
    config_with(|c| {
        c.breaker.failure_threshold = threshold;
        c.breaker.recovery_timeout = RECOVERY;
        c.queue.enabled = false;
    })
}

async fn state(gw: &TestGateway, backend: &str) -> CircuitState {
    gw.gateway
        .orchestrator()
        .dispatcher()
        .breakers()
        .get_state(backend)
        .await
        .status
}

/// Five failures open the breaker, the sixth request never reaches the
/// backend, and one successful probe after the recovery timeout closes it
#[tokio::test]
async fn test_breaker_opens_and_recovers() {
    let provider = Arc::new(
        MockProvider::new("primary", SCRIPT)
            .with_behavior(MockBehavior::FailOnOpen(BackendErrorKind::Network)),
    );
    let gw = TestGateway::start(breaker_config(5), &[provider.clone()]);

    for i in 0..5 {
        let events = gw.run(uncached_request("user-1", &format!("fail {i}"))).await;
        assert_eq!(error_kind(&events), Some(ErrorKind::AllBackendsUnavailable));
        assert_single_terminal(&events);
    }
    assert_eq!(provider.calls(), 5);
    assert_eq!(state(&gw, "primary").await, CircuitState::Open);

    let rejected = gw.run(uncached_request("user-1", "while open")).await;
    assert_eq!(error_kind(&rejected), Some(ErrorKind::AllBackendsUnavailable));
    assert_eq!(provider.calls(), 5);

    tokio::time::sleep(RECOVERY + Duration::from_millis(100)).await;
    assert_eq!(state(&gw, "primary").await, CircuitState::HalfOpen);
    provider.set_behavior(MockBehavior::Succeed);

    let probe = gw.run(uncached_request("user-1", "probe")).await;
    assert_completed(&probe);
    assert_eq!(chunk_text(&probe), provider.full_text());
    assert_eq!(provider.calls(), 6);
    assert_eq!(state(&gw, "primary").await, CircuitState::Closed);

    gw.stop().await;
}

#[tokio::test]
async fn test_failed_probe_reopens_breaker() {
    let provider = Arc::new(
        MockProvider::new("primary", SCRIPT)
            .with_behavior(MockBehavior::FailOnOpen(BackendErrorKind::Unavailable)),
    );
    let gw = TestGateway::start(breaker_config(2), &[provider.clone()]);

    for i in 0..2 {
        gw.run(uncached_request("user-1", &format!("fail {i}"))).await;
    }
    assert_eq!(state(&gw, "primary").await, CircuitState::Open);

    tokio::time::sleep(RECOVERY + Duration::from_millis(100)).await;
    let probe = gw.run(uncached_request("user-1", "probe")).await;
    assert_eq!(error_kind(&probe), Some(ErrorKind::AllBackendsUnavailable));
    assert_eq!(provider.calls(), 3);
    assert_eq!(state(&gw, "primary").await, CircuitState::Open);

    // Recovery timeout restarted, so the next request is rejected outright
    gw.run(uncached_request("user-1", "after probe")).await;
    assert_eq!(provider.calls(), 3);

    gw.stop().await;
}

#[tokio::test]
async fn test_fails_over_to_secondary_backend() {
    let primary = Arc::new(MockProvider::failing("primary", BackendErrorKind::Network));
    let secondary = Arc::new(MockProvider::new("secondary", SCRIPT));
    let gw = TestGateway::start(breaker_config(5), &[primary.clone(), secondary.clone()]);

    for i in 0..7 {
        let events = gw.run(uncached_request("user-1", &format!("q{i}"))).await;
        assert_completed(&events);
        assert_eq!(chunk_text(&events), secondary.full_text());
    }

    // Two requests after the breaker opened skipped the primary
    assert_eq!(primary.calls(), 5);
    assert_eq!(secondary.calls(), 7);
    assert_eq!(state(&gw, "primary").await, CircuitState::Open);
    assert_eq!(state(&gw, "secondary").await, CircuitState::Closed);

    gw.stop().await;
}

/// A backend rejecting the request itself is not a backend fault
#[tokio::test]
async fn test_invalid_request_never_opens_breaker() {
    let provider = Arc::new(MockProvider::failing("primary", BackendErrorKind::InvalidRequest));
    let gw = TestGateway::start(breaker_config(3), &[provider.clone()]);

    for i in 0..6 {
        let events = gw.run(uncached_request("user-1", &format!("bad {i}"))).await;
        assert_eq!(error_kind(&events), Some(ErrorKind::BackendError));
    }
    assert_eq!(provider.calls(), 6);

    let breaker = gw
        .gateway
        .orchestrator()
        .dispatcher()
        .breakers()
        .get_state("primary")
        .await;
    assert_eq!(breaker.status, CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures, 0);

    gw.stop().await;
}

/// A mid-stream failure reaches the client as an error after the chunks it
/// already received, and counts against the backend
#[tokio::test]
async fn test_mid_stream_failure_counts_against_backend() {
    let provider = Arc::new(MockProvider::new("primary", SCRIPT).with_behavior(MockBehavior::FailAfter(3)));
    let gw = TestGateway::start(breaker_config(5), &[provider.clone()]);

    let events = gw.run(uncached_request("user-1", "partial")).await;
    assert_single_terminal(&events);
    assert_eq!(error_kind(&events), Some(ErrorKind::BackendError));
    assert_eq!(chunk_indices(&events), vec![0, 1, 2]);

    let breaker = gw
        .gateway
        .orchestrator()
        .dispatcher()
        .breakers()
        .get_state("primary")
        .await;
    assert_eq!(breaker.consecutive_failures, 1);

    gw.stop().await;
}
