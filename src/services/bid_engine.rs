//! Bid Engine
//!
//! Turns a bid submission into an atomic compare-and-commit against the
//! live state, then runs the post-commit tail: leaderboard upsert,
//! anti-snipe extension, persistence enqueue, event publish. Once the
//! commit lands, nothing in the tail can un-land it; tail failures are
//! logged and swallowed.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::AuctionRepo;
use crate::error::{AuctionError, Result};
use crate::models::bid::validate_money;
use crate::models::{now_ms, AuctionEvent, AuctionStatus, BidPlacement, SettlementMessage, TimerEvent};
use crate::queue::SettlementQueue;
use crate::settings::{AuctionSettings, QueueSettings};
use crate::store::keys::Keys;
use crate::store::{BidAttempt, CommitOutcome, ExtendOutcome, LiveStore};

const LEADERBOARD_CAP: usize = 3;

#[derive(Clone)]
pub struct BidEngine {
    store: Arc<dyn LiveStore>,
    auctions: Arc<dyn AuctionRepo>,
    queue: Arc<dyn SettlementQueue>,
    keys: Keys,
    settings: AuctionSettings,
    history_ttl_days: i64,
}

impl BidEngine {
    pub fn new(
        store: Arc<dyn LiveStore>,
        auctions: Arc<dyn AuctionRepo>,
        queue: Arc<dyn SettlementQueue>,
        keys: Keys,
        settings: AuctionSettings,
        queue_settings: &QueueSettings,
    ) -> Self {
        Self {
            store,
            auctions,
            queue,
            keys,
            settings,
            history_ttl_days: queue_settings.bid_history_ttl_days,
        }
    }

    /// Admit a bid. Preconditions run in a fixed order so callers get
    /// the most specific failure; the commit itself is delegated to the
    /// store's atomic primitive.
    pub async fn place_bid(
        &self,
        auction_id: Uuid,
        user_id: Uuid,
        username: &str,
        amount: Decimal,
    ) -> Result<BidPlacement> {
        validate_money(amount).map_err(AuctionError::Validation)?;

        // 1. Live state must exist and be live.
        let state = self
            .store
            .live_state(auction_id)
            .await
            .map_err(|err| AuctionError::Transient(err.to_string()))?
            .ok_or(AuctionError::AuctionNotFound(auction_id))?;
        if state.status != AuctionStatus::Live {
            return Err(AuctionError::AuctionClosed(auction_id));
        }

        // 2. The host never bids on their own auction.
        let host_user_id = match state.host_user_id {
            Some(host) => host,
            None => self.backfill_host(auction_id).await?,
        };
        if host_user_id == user_id {
            return Err(AuctionError::Forbidden(
                "Host cannot place bids on their own auction".into(),
            ));
        }

        // 3. The clock must not have run out.
        let now = now_ms();
        let end_time_ms = match self
            .store
            .end_time_ms(auction_id)
            .await
            .map_err(|err| AuctionError::Transient(err.to_string()))?
        {
            Some(end) => end,
            None => state.end_time_ms,
        };
        let time_remaining_ms = end_time_ms - now;
        if time_remaining_ms <= 0 {
            return Err(AuctionError::AuctionClosed(auction_id));
        }

        // 4. The amount must clear the increment.
        let min_bid = state.current_high_bid + self.settings.min_bid_increment;
        if amount < min_bid {
            return Err(AuctionError::InvalidBid(format!(
                "Bid must be at least ${min_bid:.2}"
            )));
        }

        // Atomic commit. Everything after this point is best-effort.
        let attempt = BidAttempt {
            user_id,
            username: username.to_string(),
            amount,
            timestamp_ms: now,
        };
        let outcome = self
            .store
            .commit_bid(auction_id, &attempt)
            .await
            .map_err(|err| AuctionError::Transient(err.to_string()))?;

        match outcome {
            CommitOutcome::Outbid { current_high } => {
                debug!(%auction_id, %user_id, %amount, "bid outbid");
                return Ok(BidPlacement::outbid(amount, current_high));
            }
            CommitOutcome::Accepted => {}
        }

        // The tail runs on its own task: a caller whose deadline fires
        // after the commit landed must not abort these steps.
        let engine = self.clone();
        let username_owned = username.to_string();
        let tail = tokio::spawn(async move {
            engine
                .post_commit(auction_id, user_id, username_owned, amount, now, time_remaining_ms)
                .await
        });
        let anti_snipe_triggered = tail.await.unwrap_or(false);

        info!(%auction_id, %user_id, username, %amount, anti_snipe_triggered, "bid accepted");
        Ok(BidPlacement::accepted(amount, anti_snipe_triggered))
    }

    /// Steps a-d after an accepted commit. Each is independent; a
    /// failure is logged and never rolls back the commit.
    async fn post_commit(
        &self,
        auction_id: Uuid,
        user_id: Uuid,
        username: String,
        amount: Decimal,
        now: i64,
        time_remaining_ms: i64,
    ) -> bool {
        // a. Leaderboard.
        if let Err(err) = self
            .store
            .record_top_bid(auction_id, user_id, &username, amount, now, LEADERBOARD_CAP)
            .await
        {
            warn!(%auction_id, error = %err, "leaderboard update failed after commit");
        }

        // b. Anti-snipe.
        let anti_snipe_triggered = if time_remaining_ms < self.settings.antisnipe_threshold_ms() {
            self.try_anti_snipe(auction_id).await
        } else {
            false
        };

        // c. Persistence enqueue. Failure never surfaces to the bidder.
        self.enqueue_persistence(auction_id, user_id, &username, amount, now)
            .await;

        // d. Bid event.
        let event = AuctionEvent::Bid {
            auction_id,
            user_id,
            username,
            amount,
            timestamp: now,
            is_new_high: true,
            anti_snipe_triggered,
        };
        self.publish(&self.keys.channel_events(auction_id), &event)
            .await;

        anti_snipe_triggered
    }

    /// Legacy auctions predate `host_user_id` in live state; read it
    /// from the durable record and cache it for the next bid.
    async fn backfill_host(&self, auction_id: Uuid) -> Result<Uuid> {
        let auction = self
            .auctions
            .fetch(auction_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(auction_id))?;
        if let Err(err) = self
            .store
            .set_state_field(auction_id, "host_user_id", &auction.host_user_id.to_string())
            .await
        {
            warn!(%auction_id, error = %err, "failed to cache host_user_id in live state");
        }
        Ok(auction.host_user_id)
    }

    async fn try_anti_snipe(&self, auction_id: Uuid) -> bool {
        let outcome = match self
            .store
            .extend_end_time(
                auction_id,
                self.settings.antisnipe_extension_ms(),
                self.settings.max_antisnipe_extensions,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(%auction_id, error = %err, "anti-snipe extension failed");
                return false;
            }
        };

        match outcome {
            ExtendOutcome::Extended {
                new_end_time_ms,
                extension_count,
            } => {
                let event = TimerEvent::AntiSnipe {
                    auction_id,
                    new_end_time: new_end_time_ms,
                    extended_by: self.settings.antisnipe_extension_ms(),
                    extension_count,
                    max_extensions: self.settings.max_antisnipe_extensions,
                    reason: "Last-minute bid received".to_string(),
                };
                self.publish(&self.keys.channel_timer(auction_id), &event)
                    .await;
                info!(%auction_id, extension_count, new_end_time_ms, "anti-snipe extension");
                true
            }
            ExtendOutcome::CapReached { extension_count } => {
                debug!(%auction_id, extension_count, "anti-snipe cap reached, no extension");
                false
            }
        }
    }

    async fn enqueue_persistence(
        &self,
        auction_id: Uuid,
        user_id: Uuid,
        username: &str,
        amount: Decimal,
        timestamp_ms: i64,
    ) {
        let message = SettlementMessage::BidPersisted {
            bid_id: Uuid::new_v4(),
            auction_id,
            user_id,
            username: username.to_string(),
            amount,
            timestamp: timestamp_ms,
            is_highest_at_commit: true,
            ttl_expiry_epoch: timestamp_ms / 1000 + self.history_ttl_days * 24 * 60 * 60,
        };
        if let Err(err) = self.queue.enqueue(&message).await {
            error!(%auction_id, error = %err, "failed to enqueue bid for persistence");
        }
    }

    async fn publish<T: serde::Serialize>(&self, channel: &str, event: &T) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(channel, error = %err, "failed to encode event");
                return;
            }
        };
        if let Err(err) = self.store.publish(channel, &payload).await {
            warn!(channel, error = %err, "event publish failed");
        }
    }
}
