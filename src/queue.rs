//! Settlement queue
//!
//! At-least-once durable queue between the hot path and the settlement
//! sink. Backed by a Redis Stream with a consumer group: entries stay
//! pending until acked, so a crashed consumer redelivers. Consumers
//! dedup via deterministic keys, not via the transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::models::SettlementMessage;
use crate::settings::QueueSettings;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// One received entry; `id` is the transport receipt used to ack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub message: SettlementMessage,
}

#[async_trait]
pub trait SettlementQueue: Send + Sync {
    async fn enqueue(&self, message: &SettlementMessage) -> QueueResult<()>;

    /// Block up to `block_ms` for new entries, returning at most `max`.
    async fn receive(&self, max: usize, block_ms: u64) -> QueueResult<Vec<Delivery>>;

    async fn ack(&self, delivery_id: &str) -> QueueResult<()>;
}

/// Redis Streams implementation.
pub struct RedisStreamQueue {
    conn: ConnectionManager,
    settings: QueueSettings,
}

impl RedisStreamQueue {
    pub fn new(conn: ConnectionManager, settings: QueueSettings) -> Self {
        Self { conn, settings }
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_group(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(
                &self.settings.stream_key,
                &self.settings.consumer_group,
                "$",
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl SettlementQueue for RedisStreamQueue {
    async fn enqueue(&self, message: &SettlementMessage) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let payload =
            serde_json::to_string(message).map_err(|err| QueueError::Backend(err.to_string()))?;
        let fields = [
            ("payload", payload),
            ("group_key", message.group_key().to_string()),
        ];
        conn.xadd::<_, _, _, _, ()>(&self.settings.stream_key, "*", &fields)
            .await?;
        Ok(())
    }

    async fn receive(&self, max: usize, block_ms: u64) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(&self.settings.consumer_group, &self.settings.consumer_name)
            .count(max)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.settings.stream_key], &[">"], &options)
            .await?;

        let mut deliveries = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                let Some(raw) = entry.map.get("payload") else {
                    warn!(id = %entry.id, "stream entry without payload, acking away");
                    self.ack(&entry.id).await?;
                    continue;
                };
                let payload: String = redis::from_redis_value(raw)
                    .map_err(|err| QueueError::Backend(err.to_string()))?;
                match serde_json::from_str(&payload) {
                    Ok(message) => deliveries.push(Delivery {
                        id: entry.id.clone(),
                        message,
                    }),
                    Err(err) => {
                        // Poison entries are dropped, not retried forever.
                        warn!(id = %entry.id, error = %err, "undecodable settlement entry");
                        self.ack(&entry.id).await?;
                    }
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery_id: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, ()>(
            &self.settings.stream_key,
            &self.settings.consumer_group,
            &[delivery_id],
        )
        .await?;
        Ok(())
    }
}

/// In-memory queue for tests; supports forcing redelivery of unacked
/// entries to exercise consumer idempotence.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<MemoryQueueInner>>,
}

#[derive(Default)]
struct MemoryQueueInner {
    next_id: u64,
    pending: VecDeque<(String, SettlementMessage)>,
    unacked: HashMap<String, SettlementMessage>,
    enqueued: Vec<SettlementMessage>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything ever enqueued, in order.
    pub fn enqueued(&self) -> Vec<SettlementMessage> {
        self.inner.lock().enqueued.clone()
    }

    /// Push all unacked deliveries back onto the queue, as a crashed
    /// consumer would see after the pending-entries list is reclaimed.
    pub fn redeliver_unacked(&self) {
        let mut inner = self.inner.lock();
        let unacked: Vec<(String, SettlementMessage)> = inner.unacked.drain().collect();
        for entry in unacked {
            inner.pending.push_back(entry);
        }
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.lock().unacked.len()
    }
}

#[async_trait]
impl SettlementQueue for MemoryQueue {
    async fn enqueue(&self, message: &SettlementMessage) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = format!("mem-{}", inner.next_id);
        inner.pending.push_back((id, message.clone()));
        inner.enqueued.push(message.clone());
        Ok(())
    }

    async fn receive(&self, max: usize, _block_ms: u64) -> QueueResult<Vec<Delivery>> {
        let mut inner = self.inner.lock();
        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some((id, message)) = inner.pending.pop_front() else {
                break;
            };
            inner.unacked.insert(id.clone(), message.clone());
            deliveries.push(Delivery { id, message });
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery_id: &str) -> QueueResult<()> {
        self.inner.lock().unacked.remove(delivery_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn message() -> SettlementMessage {
        SettlementMessage::AuctionClosed {
            auction_id: Uuid::new_v4(),
            title: "Lot".into(),
            final_price: dec!(10),
            winner: None,
            losers: vec![],
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn deliveries_stay_pending_until_acked() {
        let queue = MemoryQueue::new();
        queue.enqueue(&message()).await.unwrap();

        let deliveries = queue.receive(10, 0).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(queue.unacked_count(), 1);

        queue.ack(&deliveries[0].id).await.unwrap();
        assert_eq!(queue.unacked_count(), 0);
        assert!(queue.receive(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unacked_entries_are_redelivered() {
        let queue = MemoryQueue::new();
        queue.enqueue(&message()).await.unwrap();
        let first = queue.receive(10, 0).await.unwrap();
        assert_eq!(first.len(), 1);

        queue.redeliver_unacked();
        let second = queue.receive(10, 0).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message, first[0].message);
    }
}
