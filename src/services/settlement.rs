//! Settlement Sink
//!
//! Consumes the durable queue: committed bids become append-only
//! history rows, auction-closed events become notifications. The
//! transport is at-least-once, so every write uses a deterministic key
//! and every notification claims a `(auction, recipient)` dedup tag
//! before dispatch.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{BidHistoryRow, BidRepo, NotificationRepo};
use crate::error::Result;
use crate::models::{SettlementMessage, UserContact};
use crate::queue::{Delivery, SettlementQueue};
use crate::settings::QueueSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Won,
    Outbid,
}

/// A rendered notification handed to the delivery boundary.
#[derive(Debug, Clone)]
pub struct SettlementNotice {
    pub kind: NoticeKind,
    pub recipient: UserContact,
    pub auction_id: Uuid,
    pub title: String,
    pub final_price: Decimal,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &SettlementNotice) -> Result<()>;
}

/// Posts rendered notices to the configured webhook. With no webhook
/// configured, notices are logged and dropped; the dedup claim still
/// records that settlement handled the recipient.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &SettlementNotice) -> Result<()> {
        let Some(url) = &self.url else {
            info!(
                auction_id = %notice.auction_id,
                recipient = %notice.recipient.user_id,
                kind = ?notice.kind,
                "no notification webhook configured, dropping notice"
            );
            return Ok(());
        };
        let body = serde_json::json!({
            "kind": match notice.kind {
                NoticeKind::Won => "auction_won",
                NoticeKind::Outbid => "auction_lost",
            },
            "auction_id": notice.auction_id,
            "title": notice.title,
            "final_price": notice.final_price,
            "recipient": notice.recipient,
        });
        self.client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| crate::error::AuctionError::Transient(err.to_string()))?
            .error_for_status()
            .map_err(|err| crate::error::AuctionError::Transient(err.to_string()))?;
        Ok(())
    }
}

pub struct SettlementSink {
    queue: Arc<dyn SettlementQueue>,
    bids: Arc<dyn BidRepo>,
    notifications: Arc<dyn NotificationRepo>,
    notifier: Arc<dyn Notifier>,
    settings: QueueSettings,
}

impl SettlementSink {
    pub fn new(
        queue: Arc<dyn SettlementQueue>,
        bids: Arc<dyn BidRepo>,
        notifications: Arc<dyn NotificationRepo>,
        notifier: Arc<dyn Notifier>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            queue,
            bids,
            notifications,
            notifier,
            settings,
        }
    }

    /// Consume until cancelled. Failed deliveries are left unacked for
    /// redelivery; idempotence makes the retry safe.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("settlement sink started");
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.queue.receive(self.settings.batch_size, self.settings.block_ms) => received,
            };
            let deliveries = match received {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    error!(error = %err, "settlement receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                    }
                }
            };
            for delivery in deliveries {
                self.handle(delivery).await;
            }
        }
        info!("settlement sink stopped");
    }

    pub async fn handle(&self, delivery: Delivery) {
        match self.process(&delivery.message).await {
            Ok(()) => {
                if let Err(err) = self.queue.ack(&delivery.id).await {
                    warn!(id = %delivery.id, error = %err, "settlement ack failed");
                }
            }
            Err(err) => {
                // Leave unacked; the queue redelivers and the
                // deterministic keys absorb the repeat.
                error!(id = %delivery.id, error = %err, "settlement processing failed");
            }
        }
    }

    async fn process(&self, message: &SettlementMessage) -> Result<()> {
        match message {
            SettlementMessage::BidPersisted {
                bid_id,
                auction_id,
                user_id,
                username,
                amount,
                timestamp,
                is_highest_at_commit,
                ttl_expiry_epoch,
            } => {
                let row = BidHistoryRow {
                    auction_id: *auction_id,
                    sort_key: BidHistoryRow::sort_key_for(*timestamp, *user_id),
                    bid_id: *bid_id,
                    user_id: *user_id,
                    username: username.clone(),
                    amount: *amount,
                    timestamp_ms: *timestamp,
                    is_highest_at_commit: *is_highest_at_commit,
                    ttl_expiry_epoch: *ttl_expiry_epoch,
                };
                if self.bids.insert_history(&row).await? {
                    debug!(%bid_id, %auction_id, "bid history written");
                } else {
                    debug!(%bid_id, %auction_id, "duplicate bid delivery absorbed");
                }
                Ok(())
            }
            SettlementMessage::AuctionClosed {
                auction_id,
                title,
                final_price,
                winner,
                losers,
                ..
            } => {
                if let Some(winner) = winner {
                    self.dispatch(*auction_id, title, *final_price, winner, NoticeKind::Won)
                        .await?;
                }
                for loser in losers {
                    self.dispatch(*auction_id, title, *final_price, loser, NoticeKind::Outbid)
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn dispatch(
        &self,
        auction_id: Uuid,
        title: &str,
        final_price: Decimal,
        recipient: &UserContact,
        kind: NoticeKind,
    ) -> Result<()> {
        if self
            .notifications
            .is_claimed(auction_id, recipient.user_id)
            .await?
        {
            debug!(%auction_id, recipient = %recipient.user_id, "notification already sent");
            return Ok(());
        }
        if recipient.email.is_none() {
            warn!(%auction_id, recipient = %recipient.user_id, "recipient has no delivery address");
            self.notifications
                .try_claim(auction_id, recipient.user_id)
                .await?;
            return Ok(());
        }
        self.notifier
            .notify(&SettlementNotice {
                kind,
                recipient: recipient.clone(),
                auction_id,
                title: title.to_string(),
                final_price,
            })
            .await?;
        // Claimed only once the send succeeded: a failed send leaves
        // no claim, so the redelivered message retries to success. A
        // crash between send and claim costs one duplicate notice,
        // never a dropped one.
        self.notifications
            .try_claim(auction_id, recipient.user_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryBidRepo, MemoryNotificationRepo};
    use crate::queue::MemoryQueue;
    use rust_decimal_macros::dec;

    fn contact(name: &str) -> UserContact {
        UserContact {
            user_id: Uuid::new_v4(),
            email: Some(format!("{name}@example.com")),
            name: None,
            username: Some(name.into()),
        }
    }

    fn sink_with(
        queue: &MemoryQueue,
        bids: &MemoryBidRepo,
        notifications: &MemoryNotificationRepo,
        notifier: MockNotifier,
    ) -> SettlementSink {
        SettlementSink::new(
            Arc::new(queue.clone()),
            Arc::new(bids.clone()),
            Arc::new(notifications.clone()),
            Arc::new(notifier),
            QueueSettings::default(),
        )
    }

    fn bid_message(auction_id: Uuid, user_id: Uuid, timestamp: i64) -> SettlementMessage {
        SettlementMessage::BidPersisted {
            bid_id: Uuid::new_v4(),
            auction_id,
            user_id,
            username: "bidder".into(),
            amount: dec!(150),
            timestamp,
            is_highest_at_commit: true,
            ttl_expiry_epoch: 0,
        }
    }

    #[tokio::test]
    async fn duplicate_bid_deliveries_write_one_row() {
        let queue = MemoryQueue::new();
        let bids = MemoryBidRepo::new();
        let notifications = MemoryNotificationRepo::new();
        let sink = sink_with(&queue, &bids, &notifications, MockNotifier::new());

        let message = bid_message(Uuid::new_v4(), Uuid::new_v4(), 1_000);
        queue.enqueue(&message).await.unwrap();
        let delivery = queue.receive(1, 0).await.unwrap().pop().unwrap();
        sink.handle(delivery.clone()).await;

        // Redelivery of the same message.
        queue.enqueue(&message).await.unwrap();
        let redelivery = queue.receive(1, 0).await.unwrap().pop().unwrap();
        sink.handle(redelivery).await;

        assert_eq!(bids.rows().len(), 1);
        assert_eq!(queue.unacked_count(), 0);
    }

    #[tokio::test]
    async fn close_notifies_winner_and_each_loser_once() {
        let queue = MemoryQueue::new();
        let bids = MemoryBidRepo::new();
        let notifications = MemoryNotificationRepo::new();

        let winner = contact("winner");
        let losers = vec![contact("l1"), contact("l2")];
        let winner_id = winner.user_id;

        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(move |notice| {
                (notice.kind == NoticeKind::Won) == (notice.recipient.user_id == winner_id)
            })
            .times(3)
            .returning(|_| Ok(()));
        let sink = sink_with(&queue, &bids, &notifications, notifier);

        let message = SettlementMessage::AuctionClosed {
            auction_id: Uuid::new_v4(),
            title: "Vintage amp".into(),
            final_price: dec!(410),
            winner: Some(winner),
            losers,
            timestamp: 1,
        };
        queue.enqueue(&message).await.unwrap();
        let delivery = queue.receive(1, 0).await.unwrap().pop().unwrap();
        sink.handle(delivery).await;

        // A duplicate delivery claims nothing and notifies no one.
        queue.enqueue(&message).await.unwrap();
        let redelivery = queue.receive(1, 0).await.unwrap().pop().unwrap();
        sink.handle(redelivery).await;

        assert_eq!(notifications.claimed_count(), 3);
    }

    #[tokio::test]
    async fn close_without_winner_notifies_only_losers() {
        let queue = MemoryQueue::new();
        let bids = MemoryBidRepo::new();
        let notifications = MemoryNotificationRepo::new();

        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|notice| notice.kind == NoticeKind::Outbid)
            .times(1)
            .returning(|_| Ok(()));
        let sink = sink_with(&queue, &bids, &notifications, notifier);

        let message = SettlementMessage::AuctionClosed {
            auction_id: Uuid::new_v4(),
            title: "Unsold lot".into(),
            final_price: dec!(100),
            winner: None,
            losers: vec![contact("l1")],
            timestamp: 1,
        };
        queue.enqueue(&message).await.unwrap();
        let delivery = queue.receive(1, 0).await.unwrap().pop().unwrap();
        sink.handle(delivery).await;
    }

    #[tokio::test]
    async fn recipient_without_address_is_claimed_but_not_dispatched() {
        let queue = MemoryQueue::new();
        let bids = MemoryBidRepo::new();
        let notifications = MemoryNotificationRepo::new();
        // No expectations: notify must never be called.
        let sink = sink_with(&queue, &bids, &notifications, MockNotifier::new());

        let message = SettlementMessage::AuctionClosed {
            auction_id: Uuid::new_v4(),
            title: "Lot".into(),
            final_price: dec!(10),
            winner: Some(UserContact::bare(Uuid::new_v4())),
            losers: vec![],
            timestamp: 1,
        };
        queue.enqueue(&message).await.unwrap();
        let delivery = queue.receive(1, 0).await.unwrap().pop().unwrap();
        sink.handle(delivery).await;
        assert_eq!(notifications.claimed_count(), 1);
    }

    #[tokio::test]
    async fn transient_notify_failure_is_retried_to_success_on_redelivery() {
        let queue = MemoryQueue::new();
        let bids = MemoryBidRepo::new();
        let notifications = MemoryNotificationRepo::new();

        let mut notifier = MockNotifier::new();
        let mut seq = mockall::Sequence::new();
        notifier
            .expect_notify()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(crate::error::AuctionError::Transient("webhook down".into()))
            });
        notifier
            .expect_notify()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let sink = sink_with(&queue, &bids, &notifications, notifier);

        let message = SettlementMessage::AuctionClosed {
            auction_id: Uuid::new_v4(),
            title: "Lot".into(),
            final_price: dec!(10),
            winner: Some(contact("winner")),
            losers: vec![],
            timestamp: 1,
        };
        queue.enqueue(&message).await.unwrap();
        let delivery = queue.receive(1, 0).await.unwrap().pop().unwrap();
        sink.handle(delivery).await;

        // Failed send: unacked, and crucially no dedup claim recorded.
        assert_eq!(queue.unacked_count(), 1);
        assert_eq!(notifications.claimed_count(), 0);

        // Redelivery retries the send and completes.
        queue.redeliver_unacked();
        let redelivery = queue.receive(1, 0).await.unwrap().pop().unwrap();
        sink.handle(redelivery).await;
        assert_eq!(queue.unacked_count(), 0);
        assert_eq!(notifications.claimed_count(), 1);
    }
}
