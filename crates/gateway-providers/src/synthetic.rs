//! Synthetic backend.
//!
//! Streams a deterministic answer word by word with a configurable delay and
//! failure rate. Used by the worker binary when no real backend is wired in,
//! and by load and failover tests.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use gateway_core::{
    BackendErrorKind, ChunkStream, FinishReason, GatewayError, HealthStatus, Provider, StreamChunk,
};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Synthetic backend configuration
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Delay before each chunk
    pub chunk_delay: Duration,
    /// Words per chunk (minimum 1)
    pub words_per_chunk: usize,
    /// Probability that opening a stream fails (0.0 - 1.0)
    pub failure_rate: f64,
    /// Models served; empty means any
    pub models: Vec<String>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            chunk_delay: Duration::from_millis(20),
            words_per_chunk: 1,
            failure_rate: 0.0,
            models: Vec::new(),
        }
    }
}

impl SyntheticConfig {
    /// Set the per-chunk delay
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Set words per chunk
    #[must_use]
    pub fn with_words_per_chunk(mut self, words: usize) -> Self {
        self.words_per_chunk = words.max(1);
        self
    }

    /// Set the failure probability
    #[must_use]
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Restrict the served models
    #[must_use]
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }
}

/// Backend that fabricates responses locally
pub struct SyntheticProvider {
    id: String,
    config: SyntheticConfig,
    health: RwLock<HealthStatus>,
    calls: AtomicU64,
}

impl SyntheticProvider {
    /// Create a new synthetic backend
    #[must_use]
    pub fn new(id: impl Into<String>, config: SyntheticConfig) -> Self {
        Self {
            id: id.into(),
            config,
            health: RwLock::new(HealthStatus::Healthy),
            calls: AtomicU64::new(0),
        }
    }

    /// Override the reported health
    pub fn set_health(&self, status: HealthStatus) {
        *self.health.write() = status;
    }

    /// Streams opened so far
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// The full text a request produces
    #[must_use]
    pub fn response_for(&self, query: &str, model: &str) -> String {
        let words: Vec<&str> = query.split_whitespace().collect();
        format!("[{}/{}] {}", self.id, model, words.join(" "))
    }

    fn should_fail(&self) -> bool {
        self.config.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.config.failure_rate)
    }
}

#[async_trait]
impl Provider for SyntheticProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports_model(&self, model: &str) -> bool {
        self.config.models.is_empty()
            || self.config.models.iter().any(|m| m.eq_ignore_ascii_case(model))
    }

    async fn stream(
        &self,
        query: &str,
        model: &str,
        identity: &str,
    ) -> Result<ChunkStream, GatewayError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if *self.health.read() == HealthStatus::Down {
            return Err(GatewayError::backend(
                &self.id,
                "backend is down",
                BackendErrorKind::Unavailable,
            ));
        }
        if self.should_fail() {
            return Err(GatewayError::backend(
                &self.id,
                "injected failure",
                BackendErrorKind::Network,
            ));
        }

        debug!(provider = %self.id, identity = %identity, model = %model, "Synthetic stream opened");

        let text = self.response_for(query, model);
        let words: Vec<String> = text.split(' ').map(str::to_string).collect();
        let groups: Vec<String> = words
            .chunks(self.config.words_per_chunk.max(1))
            .map(|group| group.join(" "))
            .collect();
        let delay = self.config.chunk_delay;

        let stream = stream! {
            let last = groups.len().saturating_sub(1);
            for (index, group) in groups.into_iter().enumerate() {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let chunk = if index == last {
                    StreamChunk::new(index as u64, group).with_finish_reason(FinishReason::Stop)
                } else {
                    StreamChunk::new(index as u64, format!("{group} "))
                };
                yield Ok(chunk);
            }
        };

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> HealthStatus {
        *self.health.read()
    }
}

impl std::fmt::Debug for SyntheticProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticProvider")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
