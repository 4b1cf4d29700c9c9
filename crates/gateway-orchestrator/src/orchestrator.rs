//! Per-request streaming pipeline.
//!
//! Each request runs once through validate, cache lookup, rate limit and
//! admission. An admitted request calls a backend through the dispatcher and
//! streams chunks to the client while assembling the response for the cache.
//! When the admission pool is full the request is diverted to the failover
//! queue instead of being rejected. The slot and the keep-alive task are
//! released on every exit path, including client disconnect, which is
//! noticed while waiting for the next chunk as well as on the next write.

use crate::config::OrchestratorConfig;
use crate::sink::{EventSink, EventStream};
use futures::StreamExt;
use gateway_core::{
    ErrorKind, FinishReason, GatewayError, ResponseSource, StreamChunk, StreamEvent, StreamRequest,
};
use gateway_failover::{QueueEvent, QueueProducer};
use gateway_resilience::{
    AdmissionSlot, CacheManager, ConnectionPoolManager, RateLimiter, TimeoutManager,
};
use gateway_routing::BackendDispatcher;
use gateway_telemetry::request_span;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Request counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Requests received
    pub requests: u64,
    /// Served from the cache
    pub cache_hits: u64,
    /// Admitted on this instance
    pub direct: u64,
    /// Diverted to the failover queue
    pub queued: u64,
    /// Finished with `complete`
    pub completed: u64,
    /// Rejected by validation, rate limit or identity admission
    pub rejected: u64,
    /// Finished with any other error
    pub failed: u64,
    /// Client went away before the terminal event
    pub disconnected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    direct: AtomicU64,
    queued: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    disconnected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Runs client requests through the gateway
pub struct StreamOrchestrator {
    config: OrchestratorConfig,
    cache: Arc<CacheManager>,
    rate_limiter: Arc<RateLimiter>,
    pool: Arc<ConnectionPoolManager>,
    dispatcher: Arc<BackendDispatcher>,
    producer: Option<QueueProducer>,
    timeouts: TimeoutManager,
    counters: Counters,
}

impl StreamOrchestrator {
    /// Create an orchestrator; without a producer a full pool rejects
    pub fn new(
        config: OrchestratorConfig,
        cache: Arc<CacheManager>,
        rate_limiter: Arc<RateLimiter>,
        pool: Arc<ConnectionPoolManager>,
        dispatcher: Arc<BackendDispatcher>,
        producer: Option<QueueProducer>,
    ) -> Self {
        let producer = producer.filter(|_| config.queue_failover);
        let timeouts = TimeoutManager::new(config.timeouts.clone());
        Self {
            config,
            cache,
            rate_limiter,
            pool,
            dispatcher,
            producer,
            timeouts,
            counters: Counters::default(),
        }
    }

    /// Start a request and return its event stream.
    ///
    /// The stream begins with `status` once a source is chosen (requests
    /// rejected earlier get only the error) and ends with exactly one
    /// `complete` or `error`. Dropping the stream cancels the request and
    /// releases its slot. Must be called within a tokio runtime.
    pub fn handle(self: &Arc<Self>, request: StreamRequest) -> EventStream {
        let (sink, events) = EventSink::channel(self.config.event_buffer);
        let span = request_span!(request.id, request.identity);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(request, sink).await }.instrument(span));
        events
    }

    async fn run(&self, request: StreamRequest, sink: EventSink) {
        let started = Instant::now();
        bump(&self.counters.requests);

        match self.execute(&request, &sink, started).await {
            Ok(chunk_count) => {
                let total_duration_ms = started.elapsed().as_millis() as u64;
                info!(chunk_count, total_duration_ms, "Request completed");
                let complete = StreamEvent::Complete {
                    request_id: request.id.clone(),
                    chunk_count,
                    total_duration_ms,
                };
                if sink.finish(complete).await.is_ok() {
                    bump(&self.counters.completed);
                } else {
                    bump(&self.counters.disconnected);
                }
            }
            Err(GatewayError::ClientDisconnected) => {
                info!("Client disconnected, request released");
                bump(&self.counters.disconnected);
            }
            Err(err) => {
                match err.kind() {
                    ErrorKind::ValidationError
                    | ErrorKind::RateLimitExceeded
                    | ErrorKind::IdentityAdmissionExceeded => {
                        info!(kind = %err.kind(), error = %err, "Request rejected");
                        bump(&self.counters.rejected);
                    }
                    _ => {
                        error!(kind = %err.kind(), error = %err, "Request failed");
                        bump(&self.counters.failed);
                    }
                }
                if sink.finish(StreamEvent::from_error(&err)).await.is_err() {
                    debug!("Client gone before error event");
                }
            }
        }
    }

    async fn execute(
        &self,
        request: &StreamRequest,
        sink: &EventSink,
        started: Instant,
    ) -> Result<u64, GatewayError> {
        request.validate_request()?;

        let cache_key = (request.cacheable && self.cache.is_enabled())
            .then(|| CacheManager::request_key(request));
        if let Some(key) = &cache_key {
            if let Some(entry) = self.cache.lookup(key).await {
                debug!(tier = ?entry.tier, "Cache hit");
                bump(&self.counters.cache_hits);
                return self.replay_cached(request, entry.value, sink).await;
            }
        }

        self.rate_limiter
            .check_tier(request.tier, &request.identity)
            .await
            .into_result(&request.identity)?;

        let deadline = self.timeouts.total_deadline(started);
        match self.pool.acquire(&request.identity, request.id.as_str()).await {
            Ok(slot) => {
                bump(&self.counters.direct);
                self.stream_direct(request, slot, cache_key, sink, deadline).await
            }
            Err(GatewayError::ConnectionPoolExhausted { active, capacity }) => {
                let Some(producer) = &self.producer else {
                    return Err(GatewayError::ConnectionPoolExhausted { active, capacity });
                };
                info!(active, capacity, "Admission pool full, diverting to queue");
                let rejection = GatewayError::ConnectionPoolExhausted { active, capacity };
                self.stream_queued(producer, request, rejection, sink, deadline).await
            }
            Err(e) => Err(e),
        }
    }

    async fn replay_cached(
        &self,
        request: &StreamRequest,
        value: String,
        sink: &EventSink,
    ) -> Result<u64, GatewayError> {
        sink.send(StreamEvent::Status {
            request_id: request.id.clone(),
            source: ResponseSource::Cache,
        })
        .await?;
        let chunk = StreamChunk::new(0, value).with_finish_reason(FinishReason::Stop);
        sink.send(StreamEvent::chunk(chunk)).await?;
        Ok(1)
    }

    async fn stream_direct(
        &self,
        request: &StreamRequest,
        slot: AdmissionSlot,
        cache_key: Option<String>,
        sink: &EventSink,
        deadline: Instant,
    ) -> Result<u64, GatewayError> {
        let keepalive = sink.spawn_keepalive(self.timeouts.config().keepalive);
        let result = self
            .timeouts
            .until(deadline, self.forward_direct(request, cache_key, sink))
            .await
            .and_then(|forwarded| forwarded);

        keepalive.cancel().await;
        slot.release().await;
        result
    }

    async fn forward_direct(
        &self,
        request: &StreamRequest,
        cache_key: Option<String>,
        sink: &EventSink,
    ) -> Result<u64, GatewayError> {
        sink.send(StreamEvent::Status {
            request_id: request.id.clone(),
            source: ResponseSource::Direct,
        })
        .await?;

        let dispatched = self.dispatcher.open_stream(request).await?;
        debug!(
            backend = %dispatched.backend_id,
            attempts = dispatched.attempts,
            "Backend stream opened"
        );

        let mut stream = dispatched.stream;
        let mut text = String::new();
        let mut chunk_count = 0u64;
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                () = sink.closed() => return Err(GatewayError::ClientDisconnected),
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            text.push_str(&chunk.content);
            chunk_count += 1;
            sink.send(StreamEvent::chunk(chunk)).await?;
        }

        if let Some(key) = cache_key {
            self.cache.set(&key, &text, None).await;
        }
        Ok(chunk_count)
    }

    /// Stream a request through the failover queue
    ///
    /// When the queue itself cannot be reached the request fails with the
    /// admission `rejection` that diverted it, never with the store outage.
    async fn stream_queued(
        &self,
        producer: &QueueProducer,
        request: &StreamRequest,
        rejection: GatewayError,
        sink: &EventSink,
        deadline: Instant,
    ) -> Result<u64, GatewayError> {
        let forward = async {
            let mut events = match producer.enqueue_and_stream(request).await {
                Ok(events) => events,
                Err(GatewayError::StoreUnavailable { message }) => {
                    warn!(error = %message, "Failover queue unreachable, rejecting diverted request");
                    return Err(rejection);
                }
                Err(e) => return Err(e),
            };
            bump(&self.counters.queued);
            sink.send(StreamEvent::Status {
                request_id: request.id.clone(),
                source: ResponseSource::Queued,
            })
            .await?;

            let mut chunk_count = 0u64;
            loop {
                let next = tokio::select! {
                    next = events.next() => next,
                    () = sink.closed() => return Err(GatewayError::ClientDisconnected),
                };
                let Some(event) = next else { break };
                match event? {
                    QueueEvent::Chunk(chunk) => {
                        chunk_count += 1;
                        sink.send(StreamEvent::chunk(chunk)).await?;
                    }
                    QueueEvent::KeepAlive => sink.keep_alive()?,
                }
            }
            Ok::<u64, GatewayError>(chunk_count)
        };

        self.timeouts
            .until(deadline, forward)
            .await
            .and_then(|forwarded| forwarded)
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Response cache
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Rate limiter
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Admission pool
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPoolManager> {
        &self.pool
    }

    /// Backend dispatcher
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<BackendDispatcher> {
        &self.dispatcher
    }

    /// Whether a full pool diverts to the queue
    #[must_use]
    pub fn queue_failover_enabled(&self) -> bool {
        self.producer.is_some()
    }

    /// Copy the request counters
    #[must_use]
    pub fn stats(&self) -> OrchestratorStats {
        let c = &self.counters;
        OrchestratorStats {
            requests: c.requests.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            direct: c.direct.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            disconnected: c.disconnected.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for StreamOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOrchestrator")
            .field("config", &self.config)
            .field("queue_failover", &self.producer.is_some())
            .finish_non_exhaustive()
    }
}
