//! Test gateway assembly and event inspection

use crate::mock_providers::MockProvider;
use futures::StreamExt;
use gateway_config::GatewayConfig;
use gateway_core::{ErrorKind, ResponseSource, StreamEvent, StreamRequest};
use gateway_orchestrator::{EventStream, Gateway, GatewayBuilder};
use gateway_store::{MemoryStore, SharedStore, SwitchableStore};
use std::sync::Arc;
use std::time::Duration;

/// Enable log output when `TEST_LOG` is set
pub fn init_tracing() {
    gateway_telemetry::init_test_logging();
}

/// A started gateway over an in-process store
pub struct TestGateway {
    /// Gateway under test
    pub gateway: Gateway,
    /// Backing store
    pub memory: Arc<MemoryStore>,
    /// Switch in front of the backing store
    pub switch: Arc<SwitchableStore>,
}

impl TestGateway {
    /// Build and start a gateway serving `providers` in priority order
    pub fn start(config: GatewayConfig, providers: &[Arc<MockProvider>]) -> Self {
        let memory = Arc::new(MemoryStore::new());
        Self::start_on(config, providers, memory)
    }

    /// Like [`TestGateway::start`] but on a store shared with other gateways
    pub fn start_on(
        config: GatewayConfig,
        providers: &[Arc<MockProvider>],
        memory: Arc<MemoryStore>,
    ) -> Self {
        init_tracing();
        let switch = Arc::new(SwitchableStore::new(memory.clone() as Arc<dyn SharedStore>));
        let mut builder =
            GatewayBuilder::from_config(config).with_store(switch.clone() as Arc<dyn SharedStore>);
        for (priority, provider) in providers.iter().enumerate() {
            builder = builder.with_provider(provider.clone(), priority as u32 + 1);
        }
        let mut gateway = builder.build().expect("Failed to build gateway");
        gateway.start();
        Self {
            gateway,
            memory,
            switch,
        }
    }

    /// Start a request
    pub fn handle(&self, request: StreamRequest) -> EventStream {
        self.gateway.handle(request)
    }

    /// Run a request to its terminal event
    pub async fn run(&self, request: StreamRequest) -> Vec<StreamEvent> {
        collect_events(self.handle(request)).await
    }

    /// Slots currently held across the shared pool
    pub async fn active_slots(&self) -> u64 {
        self.gateway.orchestrator().pool().active_count().await
    }

    /// Stop background tasks
    pub async fn stop(self) {
        self.gateway.shutdown().await;
    }
}

/// Drain an event stream, failing the test if it does not end in time
pub async fn collect_events(events: EventStream) -> Vec<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(20), events.collect::<Vec<_>>())
        .await
        .expect("event stream did not finish")
}

/// Read the next event and return its source if it is the status event
pub async fn first_source(events: &mut EventStream) -> Option<ResponseSource> {
    match tokio::time::timeout(Duration::from_secs(5), events.next()).await {
        Ok(Some(StreamEvent::Status { source, .. })) => Some(source),
        _ => None,
    }
}

/// Content of every chunk event, concatenated
pub fn chunk_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

/// Index of every chunk event
pub fn chunk_indices(events: &[StreamEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

/// Source announced by the status event
pub fn source(events: &[StreamEvent]) -> Option<ResponseSource> {
    events.iter().find_map(|e| match e {
        StreamEvent::Status { source, .. } => Some(*source),
        _ => None,
    })
}

/// Kind of the terminal error, if the stream failed
pub fn error_kind(events: &[StreamEvent]) -> Option<ErrorKind> {
    match events.last() {
        Some(StreamEvent::Error { error }) => Some(error.kind),
        _ => None,
    }
}

/// Assert the stream ends in exactly one terminal event and nothing follows it
pub fn assert_single_terminal(events: &[StreamEvent]) {
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "expected one terminal event in {events:?}");
    assert!(
        events.last().is_some_and(StreamEvent::is_terminal),
        "terminal event must be last in {events:?}"
    );
}

/// Assert a completed stream with contiguous chunk indices
pub fn assert_completed(events: &[StreamEvent]) {
    assert_single_terminal(events);
    assert!(
        matches!(events.last(), Some(StreamEvent::Complete { .. })),
        "expected completion, got {events:?}"
    );
    let indices = chunk_indices(events);
    let expected: Vec<u64> = (0..indices.len() as u64).collect();
    assert_eq!(indices, expected);
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
