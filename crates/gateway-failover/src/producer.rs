//! Producer side of the failover queue.
//!
//! Subscribes to the request's result channel, then enqueues the request,
//! then turns channel messages back into chunks. Subscribing first means a
//! fast worker can never publish into an empty channel.
//!
//! The producer follows the first worker run it hears from and ignores
//! messages from any other run of the same request. Within the followed run,
//! chunks it has already forwarded are dropped and a missing index fails the
//! request.

use crate::config::FailoverConfig;
use crate::message::{ChannelMessage, QueuedRequest};
use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use gateway_core::{GatewayError, StreamChunk, StreamRequest};
use gateway_store::{KeySpace, SharedStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Item produced while a queued request is in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Next chunk in sequence order
    Chunk(StreamChunk),
    /// Nothing arrived for a keep-alive interval
    KeepAlive,
}

/// Events for a queued request; ends after the last chunk or an error
pub type QueueEventStream = BoxStream<'static, Result<QueueEvent, GatewayError>>;

#[derive(Debug)]
enum Accepted {
    Chunks(Vec<StreamChunk>),
    Done,
    Failed(GatewayError),
    Activity,
    Ignored,
}

enum Wake {
    Message(Option<String>),
    KeepAlive,
    Idle,
}

/// Tracks the worker run being followed and the next expected index
#[derive(Debug, Default)]
struct RunFollower {
    run_id: Option<String>,
    next_index: u64,
}

impl RunFollower {
    fn follows(&mut self, run_id: &str) -> bool {
        match &self.run_id {
            Some(current) => current == run_id,
            None => {
                self.run_id = Some(run_id.to_string());
                true
            }
        }
    }

    fn accept(&mut self, message: ChannelMessage) -> Accepted {
        match message {
            ChannelMessage::Heartbeat { run_id, .. } => match run_id {
                Some(run_id) if self.run_id.as_deref().is_some_and(|r| r != run_id) => {
                    Accepted::Ignored
                }
                _ => Accepted::Activity,
            },
            ChannelMessage::ChunkBatch { run_id, chunks } => {
                if !self.follows(&run_id) {
                    return Accepted::Ignored;
                }
                let mut accepted = Vec::with_capacity(chunks.len());
                for chunk in chunks {
                    if chunk.sequence_index < self.next_index {
                        debug!(index = chunk.sequence_index, "Dropping duplicate chunk");
                        continue;
                    }
                    if chunk.sequence_index > self.next_index {
                        return Accepted::Failed(GatewayError::internal(format!(
                            "result stream skipped from index {} to {}",
                            self.next_index, chunk.sequence_index
                        )));
                    }
                    self.next_index += 1;
                    accepted.push(chunk);
                }
                Accepted::Chunks(accepted)
            }
            ChannelMessage::Done {
                run_id,
                chunk_count,
            } => {
                if !self.follows(&run_id) {
                    return Accepted::Ignored;
                }
                if chunk_count == self.next_index {
                    Accepted::Done
                } else {
                    Accepted::Failed(GatewayError::internal(format!(
                        "result stream ended after {} of {chunk_count} chunks",
                        self.next_index
                    )))
                }
            }
            ChannelMessage::Error { run_id, error } => {
                if self.follows(&run_id) {
                    Accepted::Failed(error.into())
                } else {
                    Accepted::Ignored
                }
            }
        }
    }
}

/// Diverts requests to the queue and streams their results back
pub struct QueueProducer {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    config: FailoverConfig,
}

impl QueueProducer {
    /// Create a new producer
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, config: FailoverConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Enqueue `request` and stream its result
    ///
    /// Dropping the returned stream unsubscribes from the result channel;
    /// a worker still processing the request sees nobody listening and stops.
    ///
    /// # Errors
    /// Returns `StoreUnavailable` if the channel or queue cannot be reached
    pub async fn enqueue_and_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<QueueEventStream, GatewayError> {
        let channel = self.keys.result_channel(request.id.as_str());
        let mut subscription = self
            .store
            .subscribe(&channel)
            .await
            .map_err(|e| GatewayError::store_unavailable(e.to_string()))?;

        let payload = QueuedRequest::new(request)
            .to_json()
            .map_err(|e| GatewayError::internal(format!("failed to encode queued request: {e}")))?;
        let message_id = self
            .store
            .enqueue(&self.keys.queue(&self.config.queue_name), &payload)
            .await
            .map_err(|e| GatewayError::store_unavailable(e.to_string()))?;

        info!(
            request_id = %request.id,
            identity = %request.identity,
            message_id = %message_id,
            "Request queued for failover"
        );

        let queue_wait = self.config.queue_wait;
        let keepalive = self.config.keepalive.max(Duration::from_millis(1));
        let request_id = request.id.clone();

        let events = stream! {
            let mut follower = RunFollower::default();
            let mut idle_deadline = Instant::now() + queue_wait;
            let mut keepalive_timer = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
            keepalive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let wake = tokio::select! {
                    message = subscription.next_message() => Wake::Message(message),
                    _ = keepalive_timer.tick() => Wake::KeepAlive,
                    () = tokio::time::sleep_until(idle_deadline) => Wake::Idle,
                };

                let raw = match wake {
                    Wake::Message(Some(raw)) => raw,
                    Wake::Message(None) => {
                        yield Err(GatewayError::store_unavailable("result channel closed"));
                        break;
                    }
                    Wake::KeepAlive => {
                        yield Ok(QueueEvent::KeepAlive);
                        continue;
                    }
                    Wake::Idle => {
                        warn!(request_id = %request_id, waited = ?queue_wait, "No worker activity, giving up");
                        yield Err(GatewayError::QueueTimeout { waited: queue_wait });
                        break;
                    }
                };

                let message = match ChannelMessage::from_json(&raw) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "Ignoring malformed result message");
                        continue;
                    }
                };

                let accepted = follower.accept(message);
                if !matches!(accepted, Accepted::Ignored) {
                    idle_deadline = Instant::now() + queue_wait;
                }
                match accepted {
                    Accepted::Chunks(chunks) => {
                        if !chunks.is_empty() {
                            keepalive_timer.reset();
                        }
                        for chunk in chunks {
                            yield Ok(QueueEvent::Chunk(chunk));
                        }
                    }
                    Accepted::Done => {
                        debug!(request_id = %request_id, "Queued request completed");
                        break;
                    }
                    Accepted::Failed(error) => {
                        yield Err(error);
                        break;
                    }
                    Accepted::Activity | Accepted::Ignored => {}
                }
            }
        };

        Ok(events.boxed())
    }
}

impl std::fmt::Debug for QueueProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProducer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
