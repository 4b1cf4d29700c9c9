//! Queue failover when the admission pool is full

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use gateway_core::{ErrorKind, ResponseSource, StreamEvent};
use gateway_store::MemoryStore;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

async fn rest(events: gateway_orchestrator::EventStream) -> Vec<StreamEvent> {
    collect_events(events).await
}

/// Global cap 2 and three concurrent requests: the third is queued and still
/// receives the full ordered stream
#[tokio::test]
async fn test_third_request_is_queued_and_streamed() {
    let gate = Gate::closed();
    let provider = Arc::new(MockProvider::new("primary", SCRIPT).with_gate(gate.clone()));
    let config = config_with(|c| c.pool.global_capacity = 2);
    let gw = TestGateway::start(config, &[provider.clone()]);

    let mut first = gw.handle(request("alice", "first"));
    let mut second = gw.handle(request("bob", "second"));
    assert_eq!(first_source(&mut first).await, Some(ResponseSource::Direct));
    assert_eq!(first_source(&mut second).await, Some(ResponseSource::Direct));

    let mut third = gw.handle(request("carol", "third"));
    assert_eq!(first_source(&mut third).await, Some(ResponseSource::Queued));

    gate.open();
    let (first, second, third) = tokio::join!(rest(first), rest(second), rest(third));

    for events in [&first, &second, &third] {
        assert_completed(events);
        assert_eq!(chunk_text(events), provider.full_text());
    }
    assert_eq!(chunk_indices(&third).len(), provider.chunk_count());
    assert_eq!(provider.calls(), 3);

    let gw_ref = &gw;
    let worker_done = eventually(Duration::from_secs(2), || async move {
        gw_ref.gateway.worker_stats().is_some_and(|s| s.completed == 1)
    })
    .await;
    assert!(worker_done);
    assert!(eventually(Duration::from_secs(2), || async move { gw_ref.active_slots().await == 0 }).await);

    gw.stop().await;
}

#[tokio::test]
async fn test_full_pool_rejects_when_queue_disabled() {
    let gate = Gate::closed();
    let provider = Arc::new(MockProvider::new("primary", SCRIPT).with_gate(gate.clone()));
    let config = config_with(|c| {
        c.pool.global_capacity = 1;
        c.queue.enabled = false;
    });
    let gw = TestGateway::start(config, &[provider.clone()]);

    let mut held = gw.handle(request("alice", "held"));
    assert_eq!(first_source(&mut held).await, Some(ResponseSource::Direct));

    let rejected = gw.run(request("bob", "rejected")).await;
    assert_eq!(rejected.len(), 1);
    assert_eq!(error_kind(&rejected), Some(ErrorKind::ConnectionPoolExhausted));

    gate.open();
    assert_completed(&rest(held).await);
    gw.stop().await;
}

#[tokio::test]
async fn test_queued_request_times_out_without_workers() {
    let gate = Gate::closed();
    let provider = Arc::new(MockProvider::new("primary", SCRIPT).with_gate(gate.clone()));
    let config = config_with(|c| {
        c.pool.global_capacity = 1;
        c.queue.workers = 0;
        c.timeouts.queue_wait = Duration::from_millis(300);
    });
    let gw = TestGateway::start(config, &[provider.clone()]);

    let mut held = gw.handle(request("alice", "held"));
    assert_eq!(first_source(&mut held).await, Some(ResponseSource::Direct));

    let queued = gw.run(request("bob", "waits")).await;
    assert_eq!(source(&queued), Some(ResponseSource::Queued));
    assert_eq!(error_kind(&queued), Some(ErrorKind::QueueTimeout));
    assert_single_terminal(&queued);

    gate.open();
    assert_completed(&rest(held).await);
    gw.stop().await;
}

/// A request diverted on one instance is served by a worker on another
#[tokio::test]
async fn test_worker_on_other_instance_serves_queued_request() {
    let memory = Arc::new(MemoryStore::new());
    let gate = Gate::closed();
    let provider = Arc::new(MockProvider::new("primary", SCRIPT).with_gate(gate.clone()));

    let front = TestGateway::start_on(
        config_with(|c| {
            c.pool.global_capacity = 1;
            c.queue.workers = 0;
        }),
        &[provider.clone()],
        memory.clone(),
    );
    let back = TestGateway::start_on(
        config_with(|c| c.pool.global_capacity = 1),
        &[provider.clone()],
        memory,
    );

    let mut held = front.handle(request("alice", "held"));
    assert_eq!(first_source(&mut held).await, Some(ResponseSource::Direct));

    let mut queued = front.handle(request("bob", "relayed"));
    assert_eq!(first_source(&mut queued).await, Some(ResponseSource::Queued));

    gate.open();
    let (held, queued) = tokio::join!(rest(held), rest(queued));
    assert_completed(&held);
    assert_completed(&queued);
    assert_eq!(chunk_text(&queued), provider.full_text());

    let back_ref = &back;
    let served = eventually(Duration::from_secs(2), || async move {
        back_ref.gateway.worker_stats().is_some_and(|s| s.completed == 1)
    })
    .await;
    assert!(served);
    assert_eq!(front.gateway.worker_stats().expect("template").completed, 0);

    front.stop().await;
    back.stop().await;
}

/// A producer that goes away before a worker picks the request up costs no
/// backend call
#[tokio::test]
async fn test_abandoned_queued_request_skips_backend() {
    let gate = Gate::closed();
    let provider = Arc::new(MockProvider::new("primary", SCRIPT).with_gate(gate.clone()));
    let config = config_with(|c| {
        c.pool.global_capacity = 1;
        c.queue.workers = 0;
    });
    let gw = TestGateway::start(config, &[provider.clone()]);

    let mut held = gw.handle(request("alice", "held"));
    assert_eq!(first_source(&mut held).await, Some(ResponseSource::Direct));

    let mut queued = gw.handle(request("bob", "abandoned"));
    assert_eq!(first_source(&mut queued).await, Some(ResponseSource::Queued));
    drop(queued);

    gate.open();
    assert_completed(&rest(held).await);

    // Let the orchestrator notice the disconnect and drop its subscription
    tokio::time::sleep(Duration::from_millis(100)).await;

    let worker = gw.gateway.worker().expect("worker").clone();
    assert!(eventually(Duration::from_secs(2), || {
        let worker = worker.clone();
        async move {
            worker.poll_once().await;
            worker.stats().snapshot().orphaned == 1
        }
    })
    .await);
    assert_eq!(provider.calls(), 1);

    gw.stop().await;
}
