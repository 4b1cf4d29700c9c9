//! Queue workers.
//!
//! A worker reads a small batch from the durable queue and processes each
//! message: it announces itself on the result channel (nobody listening
//! means the producer is gone and the message is dropped), keeps a
//! heartbeat going, waits for an admission slot, runs the breaker-guarded
//! backend call and publishes chunks in batches. A run that fails before
//! publishing anything is retried with backoff; after that the failure is
//! published as a terminal error. The message is acknowledged once a
//! terminal signal has been published.
//!
//! Delivery is at-least-once. A message handed out again after a crash is
//! processed again under a new run id; the producer follows only one run.

use crate::batcher::ChunkBatcher;
use crate::config::FailoverConfig;
use crate::message::{ChannelMessage, QueuedRequest};
use futures::StreamExt;
use gateway_core::{ErrorPayload, GatewayError, StreamChunk, StreamRequest};
use gateway_resilience::{CacheManager, ConnectionPoolManager, RetryPolicy};
use gateway_routing::BackendDispatcher;
use gateway_store::{KeySpace, QueueMessage, SharedStore};
use gateway_telemetry::request_span;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// What happened to one queue message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Result streamed and `done` published
    Completed,
    /// Terminal error published
    Failed,
    /// Nobody was listening; dropped without a backend call or mid-stream
    Orphaned,
    /// Payload could not be parsed; dropped
    Poison,
    /// Store unreachable; left on the queue for redelivery
    Abandoned,
}

/// Worker counters, shared by every worker of a pool
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Messages read from the queue
    pub messages_read: AtomicU64,
    /// Requests completed
    pub completed: AtomicU64,
    /// Requests failed terminally
    pub failed: AtomicU64,
    /// Requests dropped because the producer was gone
    pub orphaned: AtomicU64,
    /// Malformed messages dropped
    pub poison: AtomicU64,
    /// Messages left for redelivery
    pub abandoned: AtomicU64,
    /// Messages seen more than once
    pub redeliveries: AtomicU64,
    /// Whole-request retries
    pub retries: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    /// Messages read from the queue
    pub messages_read: u64,
    /// Requests completed
    pub completed: u64,
    /// Requests failed terminally
    pub failed: u64,
    /// Requests dropped because the producer was gone
    pub orphaned: u64,
    /// Malformed messages dropped
    pub poison: u64,
    /// Messages left for redelivery
    pub abandoned: u64,
    /// Messages seen more than once
    pub redeliveries: u64,
    /// Whole-request retries
    pub retries: u64,
}

impl WorkerStats {
    /// Copy the counters
    #[must_use]
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            messages_read: self.messages_read.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: ProcessOutcome) {
        let counter = match outcome {
            ProcessOutcome::Completed => &self.completed,
            ProcessOutcome::Failed => &self.failed,
            ProcessOutcome::Orphaned => &self.orphaned,
            ProcessOutcome::Poison => &self.poison,
            ProcessOutcome::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum Execution {
    Completed,
    Orphaned,
    Failed(GatewayError),
}

struct RunFailure {
    error: GatewayError,
    published: bool,
}

enum Step {
    Item(Option<Result<StreamChunk, GatewayError>>),
    Flush,
}

/// Consumes the failover queue
#[derive(Clone)]
pub struct QueueWorker {
    worker_id: String,
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    config: FailoverConfig,
    pool: Arc<ConnectionPoolManager>,
    dispatcher: Arc<BackendDispatcher>,
    cache: Arc<CacheManager>,
    retry: RetryPolicy,
    stats: Arc<WorkerStats>,
}

impl QueueWorker {
    /// Create a worker
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        config: FailoverConfig,
        pool: Arc<ConnectionPoolManager>,
        dispatcher: Arc<BackendDispatcher>,
        cache: Arc<CacheManager>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
            store,
            keys,
            config,
            pool,
            dispatcher,
            cache,
            retry,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    /// A copy with another id that shares this worker's statistics
    #[must_use]
    pub fn with_worker_id(&self, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..self.clone()
        }
    }

    /// Worker id used in logs
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Shared counters
    #[must_use]
    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    fn queue_key(&self) -> String {
        self.keys.queue(&self.config.queue_name)
    }

    /// Poll until cancelled. In-flight messages finish before the loop exits.
    pub async fn run(self, cancel: CancellationToken) {
        info!(worker_id = %self.worker_id, queue = %self.queue_key(), "Queue worker started");

        while !cancel.is_cancelled() {
            if self.poll_once().await == 0 {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker_id = %self.worker_id, "Queue worker stopped");
    }

    /// Read one batch and process it; returns the number of messages read
    pub async fn poll_once(&self) -> usize {
        let messages = match self
            .store
            .read_queue(
                &self.queue_key(),
                self.config.read_batch.max(1),
                self.config.visibility_timeout,
            )
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(worker_id = %self.worker_id, error = %e, "Failed to read queue");
                return 0;
            }
        };

        let count = messages.len();
        if count > 0 {
            self.stats.messages_read.fetch_add(count as u64, Ordering::Relaxed);
            debug!(worker_id = %self.worker_id, count, "Read queued requests");
            futures::future::join_all(messages.into_iter().map(|m| self.process_message(m))).await;
        }
        count
    }

    /// Process one message through to a terminal signal
    pub async fn process_message(&self, message: QueueMessage) -> ProcessOutcome {
        let queued = match QueuedRequest::from_json(&message.payload) {
            Ok(queued) => queued,
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    message_id = %message.id,
                    error = %e,
                    "Dropping malformed queue message"
                );
                self.ack(&message.id).await;
                self.stats.record(ProcessOutcome::Poison);
                return ProcessOutcome::Poison;
            }
        };

        let span = request_span!(queued.request_id, queued.identity);
        let outcome = self.handle(&message, &queued).instrument(span).await;
        self.stats.record(outcome);
        outcome
    }

    async fn handle(&self, message: &QueueMessage, queued: &QueuedRequest) -> ProcessOutcome {
        let channel = self.keys.result_channel(queued.request_id.as_str());
        let run_id = Uuid::new_v4().to_string();

        if message.delivery_count > 1 {
            self.stats.redeliveries.fetch_add(1, Ordering::Relaxed);
            info!(deliveries = message.delivery_count, "Processing redelivered request");
        }

        if message.delivery_count > self.config.max_deliveries {
            warn!(
                deliveries = message.delivery_count,
                max_deliveries = self.config.max_deliveries,
                "Delivery limit exceeded, failing request"
            );
            let error = GatewayError::internal("delivery limit exceeded");
            self.publish_error(&channel, &run_id, &error).await;
            self.ack(&message.id).await;
            return ProcessOutcome::Failed;
        }

        match self.publish(&channel, &ChannelMessage::heartbeat(&run_id)).await {
            Ok(0) => {
                debug!("No producer listening, dropping request");
                self.ack(&message.id).await;
                return ProcessOutcome::Orphaned;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Result channel unavailable, leaving request for redelivery");
                return ProcessOutcome::Abandoned;
            }
        }

        let heartbeat = self.spawn_heartbeat(channel.clone(), run_id.clone());
        let execution = self.execute(&queued.payload, &run_id, &channel).await;
        drop(heartbeat);

        let outcome = match execution {
            Execution::Completed => ProcessOutcome::Completed,
            Execution::Orphaned => {
                info!("Producer went away mid-stream, aborted");
                ProcessOutcome::Orphaned
            }
            Execution::Failed(error) => {
                warn!(error = %error, "Queued request failed");
                self.publish_error(&channel, &run_id, &error).await;
                ProcessOutcome::Failed
            }
        };
        self.ack(&message.id).await;
        outcome
    }

    async fn execute(&self, request: &StreamRequest, run_id: &str, channel: &str) -> Execution {
        let slot = match self
            .pool
            .acquire_with_backoff(&request.identity, request.id.as_str(), self.config.admission_wait)
            .await
        {
            Ok(slot) => slot,
            Err(
                GatewayError::ConnectionPoolExhausted { .. }
                | GatewayError::IdentityAdmissionExceeded { .. },
            ) => {
                return Execution::Failed(GatewayError::QueueTimeout {
                    waited: self.config.admission_wait,
                });
            }
            Err(e) => return Execution::Failed(e),
        };

        let mut attempt = 0u32;
        let execution = loop {
            match self.run_once(request, run_id, channel).await {
                Ok(Some(text)) => {
                    if request.cacheable && self.cache.is_enabled() {
                        self.cache
                            .set(&CacheManager::request_key(request), &text, None)
                            .await;
                    }
                    break Execution::Completed;
                }
                Ok(None) => break Execution::Orphaned,
                Err(RunFailure { error, published }) => {
                    let retryable = error.is_retryable()
                        || matches!(error, GatewayError::AllBackendsUnavailable { .. });
                    if published || !retryable || attempt + 1 >= self.retry.max_attempts() {
                        break Execution::Failed(error);
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Queued request attempt failed, retrying"
                    );
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        slot.release().await;
        execution
    }

    /// `Ok(Some(text))` on completion, `Ok(None)` when the producer is gone
    async fn run_once(
        &self,
        request: &StreamRequest,
        run_id: &str,
        channel: &str,
    ) -> Result<Option<String>, RunFailure> {
        let dispatched = self
            .dispatcher
            .open_stream(request)
            .await
            .map_err(|error| RunFailure {
                error,
                published: false,
            })?;

        let mut stream = dispatched.stream;
        let mut batcher =
            ChunkBatcher::new(self.config.chunk_batch_size, self.config.chunk_flush_interval);
        let mut text = String::new();
        let mut chunk_count = 0u64;
        let mut published = false;

        loop {
            let step = match batcher.deadline() {
                Some(deadline) => tokio::select! {
                    item = stream.next() => Step::Item(item),
                    () = tokio::time::sleep_until(deadline) => Step::Flush,
                },
                None => Step::Item(stream.next().await),
            };

            let batch = match step {
                Step::Flush => batcher.take(),
                Step::Item(Some(Ok(chunk))) => {
                    text.push_str(&chunk.content);
                    chunk_count += 1;
                    batcher.push(chunk)
                }
                Step::Item(Some(Err(error))) => return Err(RunFailure { error, published }),
                Step::Item(None) => break,
            };

            if let Some(chunks) = batch {
                if !self.publish_batch(channel, run_id, chunks, published).await? {
                    return Ok(None);
                }
                published = true;
            }
        }

        if let Some(chunks) = batcher.take() {
            if !self.publish_batch(channel, run_id, chunks, published).await? {
                return Ok(None);
            }
        }

        let done = ChannelMessage::Done {
            run_id: run_id.to_string(),
            chunk_count,
        };
        match self.publish(channel, &done).await {
            Ok(receivers) => {
                debug!(chunk_count, receivers, "Queued request completed");
                Ok(Some(text))
            }
            Err(error) => Err(RunFailure {
                error,
                published: true,
            }),
        }
    }

    /// `Ok(false)` when nobody received the batch
    async fn publish_batch(
        &self,
        channel: &str,
        run_id: &str,
        chunks: Vec<StreamChunk>,
        published: bool,
    ) -> Result<bool, RunFailure> {
        let message = ChannelMessage::ChunkBatch {
            run_id: run_id.to_string(),
            chunks,
        };
        self.publish(channel, &message)
            .await
            .map(|receivers| receivers > 0)
            .map_err(|error| RunFailure { error, published })
    }

    async fn publish(&self, channel: &str, message: &ChannelMessage) -> Result<usize, GatewayError> {
        let json = message
            .to_json()
            .map_err(|e| GatewayError::internal(format!("failed to encode result message: {e}")))?;
        self.store
            .publish(channel, &json)
            .await
            .map_err(|e| GatewayError::store_unavailable(e.to_string()))
    }

    async fn publish_error(&self, channel: &str, run_id: &str, error: &GatewayError) {
        let message = ChannelMessage::Error {
            run_id: run_id.to_string(),
            error: ErrorPayload::from(error),
        };
        if let Err(e) = self.publish(channel, &message).await {
            warn!(error = %e, "Failed to publish terminal error");
        }
    }

    async fn ack(&self, message_id: &str) {
        if let Err(e) = self.store.ack(&self.queue_key(), message_id).await {
            warn!(message_id = %message_id, error = %e, "Failed to acknowledge message");
        }
    }

    fn spawn_heartbeat(&self, channel: String, run_id: String) -> DropGuard {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let store = Arc::clone(&self.store);
        let period = self.config.heartbeat_interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Ok(json) = ChannelMessage::heartbeat(&run_id).to_json() else {
                            continue;
                        };
                        if let Err(e) = store.publish(&channel, &json).await {
                            debug!(channel = %channel, error = %e, "Heartbeat not published");
                        }
                    }
                }
            }
        });

        token.drop_guard()
    }
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
