//! The `SharedStore` capability.
//!
//! All cross-instance state rides on these primitives. Components only ever
//! mutate shared state through single atomic operations (increment,
//! compare-and-set, set-with-TTL); there are no distributed locks.

use crate::error::StoreResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Identifier assigned to a queued message
pub type MessageId = String;

/// A message read from a queue.
///
/// Reading a message hides it for the visibility timeout; it is delivered
/// again unless acknowledged before then.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Message identifier, used to acknowledge
    pub id: MessageId,
    /// Raw payload as enqueued
    pub payload: String,
    /// How many times this message has been handed out, including this one
    pub delivery_count: u32,
    /// Enqueue time in epoch milliseconds
    pub enqueued_at_ms: i64,
}

/// Live subscription to a pub/sub channel.
///
/// Dropping it unsubscribes; later publishes to the channel no longer count it
/// as a receiver.
pub struct Subscription {
    channel: String,
    inner: BoxStream<'static, String>,
}

impl Subscription {
    /// Wrap a message stream
    pub fn new(channel: impl Into<String>, inner: BoxStream<'static, String>) -> Self {
        Self {
            channel: channel.into(),
            inner,
        }
    }

    /// Channel this subscription listens on
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message; `None` once the channel is closed
    pub async fn next_message(&mut self) -> Option<String> {
        self.inner.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Key-value store with atomic counters, compare-and-set, TTL expiry,
/// publish/subscribe channels and at-least-once queues.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a value, replacing any previous value and TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remove a key; returns whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Atomically add `delta` and return the new value.
    ///
    /// A missing key starts at zero and receives `ttl_on_create`; an existing
    /// key keeps its TTL.
    async fn incr_by(&self, key: &str, delta: i64, ttl_on_create: Option<Duration>)
        -> StoreResult<i64>;

    /// Atomically increment by one
    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.incr_by(key, 1, None).await
    }

    /// Atomically decrement by one
    async fn decr(&self, key: &str) -> StoreResult<i64> {
        self.incr_by(key, -1, None).await
    }

    /// Write `new` only if the current value equals `expected`.
    ///
    /// `expected = None` means "only if absent". Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Delete the key only if its value equals `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Live keys starting with `prefix` and their values, ordered by key
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;

    /// Publish to a channel; returns how many subscribers received it
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize>;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    /// Append a message to a queue
    async fn enqueue(&self, queue: &str, payload: &str) -> StoreResult<MessageId>;

    /// Read up to `batch` visible messages, hiding them for `visibility`
    async fn read_queue(
        &self,
        queue: &str,
        batch: usize,
        visibility: Duration,
    ) -> StoreResult<Vec<QueueMessage>>;

    /// Acknowledge a message so it is never delivered again. Idempotent.
    async fn ack(&self, queue: &str, message_id: &str) -> StoreResult<()>;

    /// Cheap liveness probe
    async fn ping(&self) -> StoreResult<()>;
}
