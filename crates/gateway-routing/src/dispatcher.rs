//! Backend dispatch.
//!
//! Walks the registry's candidates for a model in priority order, skipping
//! any backend whose breaker denies the call. Each backend gets the retry
//! policy's attempts; an attempt succeeds once the first chunk has arrived
//! within the first-chunk timeout. Breaker success is recorded on that first
//! chunk, failure on an open error, a first-chunk timeout, or a mid-stream
//! error.

use async_stream::stream;
use futures::StreamExt;
use gateway_core::{
    BackendErrorKind, ChunkStream, GatewayError, Provider, StreamChunk, StreamRequest,
};
use gateway_providers::ProviderRegistry;
use gateway_resilience::{CircuitBreakerManager, RetryPolicy, TimeoutManager};
use gateway_telemetry::backend_span;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// A backend stream that has produced its first chunk
pub struct DispatchedStream {
    /// Backend serving the request
    pub backend_id: String,
    /// Attempts made across all backends, including the successful one
    pub attempts: u32,
    /// Chunks, renumbered from zero
    pub stream: ChunkStream,
}

impl std::fmt::Debug for DispatchedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedStream")
            .field("backend_id", &self.backend_id)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

/// Opens breaker-guarded backend streams with retry and failover
pub struct BackendDispatcher {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    retry: RetryPolicy,
    timeouts: TimeoutManager,
}

impl BackendDispatcher {
    /// Create a new dispatcher
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breakers: Arc<CircuitBreakerManager>,
        retry: RetryPolicy,
        timeouts: TimeoutManager,
    ) -> Self {
        Self {
            registry,
            breakers,
            retry,
            timeouts,
        }
    }

    /// The registry backing this dispatcher
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The breakers consulted before every attempt
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Open a stream for `request` on the first backend that delivers
    ///
    /// # Errors
    /// - `Backend` with kind `InvalidRequest` as soon as a backend rejects the
    ///   request itself
    /// - `AllBackendsUnavailable` when every candidate was skipped or failed
    pub async fn open_stream(&self, request: &StreamRequest) -> Result<DispatchedStream, GatewayError> {
        let model = request.normalized_model();
        let candidates = self.registry.candidates(&model);
        let mut attempted = Vec::with_capacity(candidates.len());
        let mut attempts = 0u32;

        for entry in candidates {
            let backend_id = entry.id().to_string();
            attempted.push(backend_id.clone());

            let provider = match entry.provider() {
                Ok(provider) => provider,
                Err(e) => {
                    warn!(backend = %backend_id, error = %e, "Backend could not be constructed, skipping");
                    continue;
                }
            };
            if !provider.supports_model(&model) {
                debug!(backend = %backend_id, model = %model, "Backend does not serve model, skipping");
                continue;
            }

            let mut attempt = 0u32;
            loop {
                if !self.breakers.should_allow(&backend_id).await {
                    debug!(backend = %backend_id, "Breaker denied backend, failing over");
                    break;
                }

                attempts += 1;
                let result = self
                    .try_open(&provider, &backend_id, request, &model)
                    .instrument(backend_span!(backend_id, attempt + 1))
                    .await;

                match result {
                    Ok(stream) => {
                        self.breakers.record_success(&backend_id).await;
                        info!(
                            request_id = %request.id,
                            backend = %backend_id,
                            attempts,
                            "Backend stream opened"
                        );
                        return Ok(DispatchedStream {
                            backend_id,
                            attempts,
                            stream,
                        });
                    }
                    Err(e) => {
                        if e.counts_against_backend() {
                            self.breakers.record_failure(&backend_id).await;
                        }
                        if matches!(
                            e,
                            GatewayError::Backend {
                                kind: BackendErrorKind::InvalidRequest,
                                ..
                            }
                        ) {
                            return Err(e);
                        }
                        if self.retry.should_retry(attempt, &e) {
                            let delay = self.retry.delay_for_attempt(attempt);
                            warn!(
                                backend = %backend_id,
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Backend attempt failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        warn!(backend = %backend_id, error = %e, "Backend failed, failing over");
                        break;
                    }
                }
            }
        }

        warn!(request_id = %request.id, attempted = ?attempted, "No backend available");
        Err(GatewayError::AllBackendsUnavailable { attempted })
    }

    async fn try_open(
        &self,
        provider: &Arc<dyn Provider>,
        backend_id: &str,
        request: &StreamRequest,
        model: &str,
    ) -> Result<ChunkStream, GatewayError> {
        let opened = self
            .timeouts
            .first_chunk(async {
                let mut stream = provider
                    .stream(&request.query, model, &request.identity)
                    .await?;
                let first = stream.next().await;
                Ok::<_, GatewayError>((first, stream))
            })
            .await??;

        let (first, rest) = match opened {
            (Some(Ok(first)), rest) => (first, rest),
            (Some(Err(e)), _) => return Err(e),
            (None, _) => {
                debug!(backend = %backend_id, "Backend returned an empty stream");
                return Ok(futures::stream::empty().boxed());
            }
        };

        Ok(renumbered(
            first,
            rest,
            Arc::clone(&self.breakers),
            backend_id.to_string(),
        ))
    }
}

impl std::fmt::Debug for BackendDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDispatcher")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Re-index chunks from zero and record mid-stream failures on the breaker
fn renumbered(
    first: StreamChunk,
    mut rest: ChunkStream,
    breakers: Arc<CircuitBreakerManager>,
    backend_id: String,
) -> ChunkStream {
    let stream = stream! {
        let mut index = 0u64;
        let done = first.is_final();
        yield Ok(StreamChunk { sequence_index: index, ..first });
        if done {
            return;
        }

        while let Some(item) = rest.next().await {
            match item {
                Ok(chunk) => {
                    index += 1;
                    let done = chunk.is_final();
                    yield Ok(StreamChunk { sequence_index: index, ..chunk });
                    if done {
                        break;
                    }
                }
                Err(e) => {
                    warn!(backend = %backend_id, error = %e, "Backend failed mid-stream");
                    if e.counts_against_backend() {
                        breakers.record_failure(&backend_id).await;
                    }
                    yield Err(e);
                    break;
                }
            }
        }
    };
    stream.boxed()
}
