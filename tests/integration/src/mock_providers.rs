//! Scripted backends for integration testing
//!
//! A [`MockProvider`] streams a fixed list of chunks and counts every call.
//! Its behaviour can be switched between succeeding and failing at runtime,
//! and a [`Gate`] holds every stream open until the test releases it.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use gateway_core::{
    BackendErrorKind, ChunkStream, FinishReason, GatewayError, HealthStatus, Provider, StreamChunk,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What the next stream does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Stream every chunk
    Succeed,
    /// Fail before any data
    FailOnOpen(BackendErrorKind),
    /// Yield this many chunks, then fail with a network error
    FailAfter(usize),
}

/// Holds streams before their first chunk until opened
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// A closed gate
    pub fn closed() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Release every waiting and future stream
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Scripted backend
pub struct MockProvider {
    id: String,
    chunks: Vec<String>,
    chunk_delay: Duration,
    behavior: Mutex<MockBehavior>,
    gate: Option<Gate>,
    calls: AtomicUsize,
}

impl MockProvider {
    /// A backend that streams `chunks`
    pub fn new(id: &str, chunks: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            chunks: chunks.iter().map(|c| (*c).to_string()).collect(),
            chunk_delay: Duration::ZERO,
            behavior: Mutex::new(MockBehavior::Succeed),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// A backend that always fails on open with `kind`
    pub fn failing(id: &str, kind: BackendErrorKind) -> Self {
        Self::new(id, &["unused"]).with_behavior(MockBehavior::FailOnOpen(kind))
    }

    /// Set the initial behaviour
    #[must_use]
    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    /// Hold streams at `gate`
    #[must_use]
    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Sleep between chunks
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Change behaviour for later calls
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Streams opened or attempted
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The full response text
    pub fn full_text(&self) -> String {
        self.chunks.concat()
    }

    /// Number of chunks in a full response
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream(
        &self,
        _query: &str,
        _model: &str,
        _identity: &str,
    ) -> Result<ChunkStream, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock();

        if let MockBehavior::FailOnOpen(kind) = behavior {
            return Err(GatewayError::backend(&self.id, "scripted failure", kind));
        }

        let fail_after = match behavior {
            MockBehavior::FailAfter(n) => Some(n),
            _ => None,
        };
        let chunks = self.chunks.clone();
        let delay = self.chunk_delay;
        let backend = self.id.clone();
        let mut gate = self.gate.as_ref().map(Gate::subscribe);

        let stream = stream! {
            if let Some(gate) = gate.as_mut() {
                let opened = gate.wait_for(|open| *open).await.map(|_| ()).is_ok();
                if !opened {
                    yield Err(GatewayError::backend(&backend, "gate dropped", BackendErrorKind::Network));
                    return;
                }
            }

            let last = chunks.len().saturating_sub(1);
            for (index, content) in chunks.into_iter().enumerate() {
                if fail_after == Some(index) {
                    yield Err(GatewayError::backend(&backend, "scripted mid-stream failure", BackendErrorKind::Network));
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let mut chunk = StreamChunk::new(index as u64, content);
                if index == last {
                    chunk = chunk.with_finish_reason(FinishReason::Stop);
                }
                yield Ok(chunk);
            }
        };

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> HealthStatus {
        match *self.behavior.lock() {
            MockBehavior::Succeed => HealthStatus::Healthy,
            MockBehavior::FailAfter(_) => HealthStatus::Degraded,
            MockBehavior::FailOnOpen(_) => HealthStatus::Down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_streams_script() {
        let provider = MockProvider::new("mock", &["a", "b", "c"]);
        let chunks: Vec<_> = provider
            .stream("q", "m", "u")
            .await
            .expect("stream")
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].as_ref().expect("chunk").is_final());
        assert_eq!(provider.calls(), 1);
        assert_eq!(provider.full_text(), "abc");
    }

    #[tokio::test]
    async fn test_gate_holds_stream() {
        let gate = Gate::closed();
        let provider = MockProvider::new("mock", &["a"]).with_gate(gate.clone());
        let mut stream = provider.stream("q", "m", "u").await.expect("stream");

        let held = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(held.is_err());

        gate.open();
        let chunk = stream.next().await.expect("item").expect("chunk");
        assert_eq!(chunk.content, "a");
    }

    #[tokio::test]
    async fn test_fail_after() {
        let provider = MockProvider::new("mock", &["a", "b", "c"]).with_behavior(MockBehavior::FailAfter(1));
        let items: Vec<_> = provider.stream("q", "m", "u").await.expect("stream").collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }
}
