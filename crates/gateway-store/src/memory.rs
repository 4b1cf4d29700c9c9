//! In-process `SharedStore`.
//!
//! Used for single-node deployments and tests. TTLs expire lazily on access,
//! subscriber lists are pruned on publish, and queues simulate visibility
//! timeouts the same way a hosted queue would. Every lock here is a short
//! synchronous critical section that never spans an await.

use crate::error::{StoreError, StoreResult};
use crate::store::{MessageId, QueueMessage, SharedStore, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
struct QueuedItem {
    id: MessageId,
    payload: String,
    enqueued_at_ms: i64,
    visible_at: Instant,
    delivery_count: u32,
}

/// In-memory shared store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
    queues: Mutex<HashMap<String, VecDeque<QueuedItem>>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages in a queue, visible or not (for tests and diagnostics)
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    /// Number of live subscribers on a channel
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |senders| senders.iter().filter(|s| !s.is_closed()).count())
    }

    /// Number of live keys
    #[must_use]
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Read a live entry, dropping it if expired
    fn live(entries: &mut HashMap<String, Entry>, key: &str) -> Option<Entry> {
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        let existed = Self::live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl_on_create: Option<Duration>,
    ) -> StoreResult<i64> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(existing) => {
                let current: i64 = existing.value.parse().map_err(|_| StoreError::TypeMismatch {
                    key: key.to_string(),
                })?;
                let next = current.saturating_add(delta);
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: next.to_string(),
                        expires_at: existing.expires_at,
                    },
                );
                Ok(next)
            }
            None => {
                entries.insert(key.to_string(), Entry::new(delta.to_string(), ttl_on_create));
                Ok(delta)
            }
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        let current = Self::live(&mut entries, key);
        if current.as_ref().map(|e| e.value.as_str()) != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(new.to_string(), ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.is_expired(now));
        let mut found: Vec<(String, String)> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        found.sort_unstable();
        Ok(found)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        let mut channels = self.channels.lock();
        let Some(senders) = channels.get_mut(channel) else {
            trace!(channel = %channel, "Publish to channel without subscribers");
            return Ok(0);
        };
        senders.retain(|sender| sender.send(message.to_string()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            channels.remove(channel);
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(
            channel,
            UnboundedReceiverStream::new(rx).boxed(),
        ))
    }

    async fn enqueue(&self, queue: &str, payload: &str) -> StoreResult<MessageId> {
        let id = uuid::Uuid::new_v4().to_string();
        let item = QueuedItem {
            id: id.clone(),
            payload: payload.to_string(),
            enqueued_at_ms: chrono::Utc::now().timestamp_millis(),
            visible_at: Instant::now(),
            delivery_count: 0,
        };
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(item);
        Ok(id)
    }

    async fn read_queue(
        &self,
        queue: &str,
        batch: usize,
        visibility: Duration,
    ) -> StoreResult<Vec<QueueMessage>> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let Some(items) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::with_capacity(batch.min(items.len()));
        for item in items.iter_mut() {
            if out.len() >= batch {
                break;
            }
            if item.visible_at > now {
                continue;
            }
            item.visible_at = now + visibility;
            item.delivery_count += 1;
            out.push(QueueMessage {
                id: item.id.clone(),
                payload: item.payload.clone(),
                delivery_count: item.delivery_count,
                enqueued_at_ms: item.enqueued_at_ms,
            });
        }
        Ok(out)
    }

    async fn ack(&self, queue: &str, message_id: &str) -> StoreResult<()> {
        if let Some(items) = self.queues.lock().get_mut(queue) {
            items.retain(|item| item.id != message_id);
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.expect("set");
        assert_eq!(store.get("k").await.expect("get").as_deref(), Some("v"));
        assert!(store.delete("k").await.expect("delete"));
        assert!(!store.delete("k").await.expect("delete"));
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .expect("set");
        assert!(store.get("k").await.expect("get").is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("k").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_incr_keeps_ttl_of_existing_key() {
        let store = MemoryStore::new();
        assert_eq!(
            store
                .incr_by("c", 2, Some(Duration::from_millis(30)))
                .await
                .expect("incr"),
            2
        );
        assert_eq!(store.incr_by("c", 3, Some(Duration::from_secs(60))).await.expect("incr"), 5);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.incr("c").await.expect("incr"), 1);
        assert_eq!(store.decr("c").await.expect("decr"), 0);
    }

    #[tokio::test]
    async fn test_incr_on_text_is_type_mismatch() {
        let store = MemoryStore::new();
        store.set("k", "text", None).await.expect("set");
        assert!(matches!(
            store.incr("k").await,
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = MemoryStore::new();
        assert!(store.compare_and_set("k", None, "a", None).await.expect("cas"));
        assert!(!store.compare_and_set("k", None, "b", None).await.expect("cas"));
        assert!(!store.compare_and_set("k", Some("x"), "b", None).await.expect("cas"));
        assert!(store.compare_and_set("k", Some("a"), "b", None).await.expect("cas"));
        assert_eq!(store.get("k").await.expect("get").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStore::new();
        store.set("k", "0", None).await.expect("set");
        assert!(!store.compare_and_delete("k", "1").await.expect("cad"));
        assert!(store.compare_and_delete("k", "0").await.expect("cad"));
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_counts_live_subscribers() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("ch", "nobody").await.expect("publish"), 0);

        let mut sub = store.subscribe("ch").await.expect("subscribe");
        assert_eq!(store.publish("ch", "hello").await.expect("publish"), 1);
        assert_eq!(sub.next_message().await.as_deref(), Some("hello"));

        drop(sub);
        assert_eq!(store.publish("ch", "gone").await.expect("publish"), 0);
        assert_eq!(store.subscriber_count("ch"), 0);
    }

    #[tokio::test]
    async fn test_queue_visibility_and_ack() {
        let store = MemoryStore::new();
        let id = store.enqueue("q", "payload").await.expect("enqueue");

        let first = store
            .read_queue("q", 10, Duration::from_millis(30))
            .await
            .expect("read");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, id);
        assert_eq!(first[0].delivery_count, 1);

        // Hidden while in flight
        assert!(store
            .read_queue("q", 10, Duration::from_millis(30))
            .await
            .expect("read")
            .is_empty());

        // Redelivered after the visibility timeout
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = store
            .read_queue("q", 10, Duration::from_secs(30))
            .await
            .expect("read");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_count, 2);

        store.ack("q", &id).await.expect("ack");
        store.ack("q", &id).await.expect("second ack is a no-op");
        assert_eq!(store.queue_len("q"), 0);
    }

    #[tokio::test]
    async fn test_queue_is_fifo_and_batched() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.enqueue("q", &i.to_string()).await.expect("enqueue");
        }
        let batch = store
            .read_queue("q", 3, Duration::from_secs(30))
            .await
            .expect("read");
        let payloads: Vec<_> = batch.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(payloads, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_scan_prefix_skips_expired_and_foreign_keys() {
        let store = MemoryStore::new();
        store.set("p:b", "2", None).await.expect("set");
        store.set("p:a", "1", None).await.expect("set");
        store.set("q:a", "x", None).await.expect("set");
        store
            .set("p:gone", "3", Some(Duration::from_millis(10)))
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let found = store.scan_prefix("p:").await.expect("scan");
        assert_eq!(
            found,
            vec![
                ("p:a".to_string(), "1".to_string()),
                ("p:b".to_string(), "2".to_string()),
            ]
        );
        assert_eq!(store.key_count(), 3);
    }
}
