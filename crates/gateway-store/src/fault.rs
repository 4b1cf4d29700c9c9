//! Store wrapper that can be switched off to exercise degraded modes.

use crate::error::{StoreError, StoreResult};
use crate::store::{MessageId, QueueMessage, SharedStore, Subscription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Wraps a store; while unavailable every operation fails with
/// [`StoreError::Unavailable`]. Existing subscriptions keep receiving.
pub struct SwitchableStore {
    inner: Arc<dyn SharedStore>,
    available: AtomicBool,
    operations: AtomicU64,
    rejected: AtomicU64,
}

impl SwitchableStore {
    /// Wrap a store, initially available
    pub fn new(inner: Arc<dyn SharedStore>) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
            operations: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Turn the store on or off
    pub fn set_available(&self, available: bool) {
        debug!(available, "Switching shared store availability");
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether operations currently pass through
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Operations attempted so far, including rejected ones
    #[must_use]
    pub fn op_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Operations rejected while switched off
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn check(&self) -> StoreResult<()> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if self.is_available() {
            Ok(())
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }
}

impl std::fmt::Debug for SwitchableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchableStore")
            .field("available", &self.is_available())
            .field("operations", &self.op_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SharedStore for SwitchableStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl_on_create: Option<Duration>,
    ) -> StoreResult<i64> {
        self.check()?;
        self.inner.incr_by(key, delta, ttl_on_create).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.check()?;
        self.inner.compare_and_set(key, expected, new, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        self.check()?;
        self.inner.scan_prefix(prefix).await
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        self.check()?;
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.check()?;
        self.inner.subscribe(channel).await
    }

    async fn enqueue(&self, queue: &str, payload: &str) -> StoreResult<MessageId> {
        self.check()?;
        self.inner.enqueue(queue, payload).await
    }

    async fn read_queue(
        &self,
        queue: &str,
        batch: usize,
        visibility: Duration,
    ) -> StoreResult<Vec<QueueMessage>> {
        self.check()?;
        self.inner.read_queue(queue, batch, visibility).await
    }

    async fn ack(&self, queue: &str, message_id: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.ack(queue, message_id).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()?;
        self.inner.ping().await
    }
}
