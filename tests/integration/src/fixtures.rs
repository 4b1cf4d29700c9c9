//! Requests and configurations used across the scenario suites

use gateway_config::{GatewayConfig, TierLimit};
use gateway_core::{IdentityTier, StreamRequest};
use std::time::Duration;

/// Model every mock backend serves
pub const TEST_MODEL: &str = "mock-model";

/// An authenticated request for `query`
pub fn request(identity: &str, query: &str) -> StreamRequest {
    StreamRequest::builder()
        .identity(identity)
        .tier(IdentityTier::Authenticated)
        .query(query)
        .model(TEST_MODEL)
        .build()
        .expect("Failed to build request")
}

/// A request that must never be served from or written to the cache
pub fn uncached_request(identity: &str, query: &str) -> StreamRequest {
    let mut request = request(identity, query);
    request.cacheable = false;
    request
}

/// Configuration with no configured backends and fast timings.
///
/// Backends are supplied by the test through the builder.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.providers.clear();
    config.node.key_prefix = "it".to_string();

    config.rate_limit.authenticated = TierLimit {
        limit: 10_000,
        window: Duration::from_secs(3600),
    };

    config.retry.max_attempts = 1;
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);

    config.queue.workers = 2;
    config.queue.poll_interval = Duration::from_millis(10);
    config.queue.chunk_flush_interval = Duration::from_millis(10);
    config.queue.backoff_base = Duration::from_millis(5);
    config.queue.backoff_max = Duration::from_millis(20);
    config.queue.heartbeat_interval = Duration::from_millis(200);

    config.timeouts.first_chunk = Duration::from_secs(5);
    config.timeouts.total = Duration::from_secs(30);
    config.timeouts.queue_wait = Duration::from_secs(10);
    config
}

/// [`test_config`] with `edit` applied
pub fn config_with(edit: impl FnOnce(&mut GatewayConfig)) -> GatewayConfig {
    let mut config = test_config();
    edit(&mut config);
    config
}

/// Chunks of a typical scripted response
pub const SCRIPT: &[&str] = &["The ", "quick ", "brown ", "fox ", "jumps ", "over ", "the ", "dog"];
