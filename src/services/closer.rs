//! Auction close procedure
//!
//! The terminal transition, shared by the timer controller (expiry) and
//! the HTTP manual-close path. Single writer: nothing else flips an
//! auction to closed. Durable update first, then hot-state update, then
//! broadcasts, then the settlement enqueue.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{AuctionRepo, UserRepo};
use crate::error::{AuctionError, Result};
use crate::models::{
    now_ms, AuctionEvent, SettlementMessage, TimerEvent, UserContact,
};
use crate::queue::SettlementQueue;
use crate::store::keys::Keys;
use crate::store::LiveStore;

#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub auction_id: Uuid,
    pub winner_id: Option<Uuid>,
    pub winner_username: Option<String>,
    pub winning_bid: Option<Decimal>,
}

pub struct AuctionCloser {
    store: Arc<dyn LiveStore>,
    auctions: Arc<dyn AuctionRepo>,
    users: Arc<dyn UserRepo>,
    queue: Arc<dyn SettlementQueue>,
    keys: Keys,
}

impl AuctionCloser {
    pub fn new(
        store: Arc<dyn LiveStore>,
        auctions: Arc<dyn AuctionRepo>,
        users: Arc<dyn UserRepo>,
        queue: Arc<dyn SettlementQueue>,
        keys: Keys,
    ) -> Self {
        Self {
            store,
            auctions,
            users,
            queue,
            keys,
        }
    }

    /// Run the close side-effects for an auction whose time is up (or
    /// whose host asked for it). Idempotent at the durable layer; the
    /// broadcasts are at-most-once like everything on the bus.
    pub async fn close(&self, auction_id: Uuid) -> Result<CloseOutcome> {
        let auction = self
            .auctions
            .fetch(auction_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(auction_id))?;

        // 1. Read what the hot state knows. It may already be gone
        //    (TTL); the durable record carries us through.
        let state = self
            .store
            .live_state(auction_id)
            .await
            .unwrap_or_else(|err| {
                warn!(%auction_id, error = %err, "live state unreadable at close");
                None
            });
        let top_bids = self
            .store
            .top_bids(auction_id, 3)
            .await
            .unwrap_or_default();
        let participants = self
            .store
            .participants(auction_id)
            .await
            .unwrap_or_default();

        let current_high = state
            .as_ref()
            .map(|s| s.current_high_bid)
            .filter(|high| *high > Decimal::ZERO)
            .unwrap_or(auction.starting_bid);

        // 2. Winner from state, falling back to the leaderboard top for
        //    legacy states that never recorded the high bidder.
        let mut winner_id = state.as_ref().and_then(|s| s.high_bidder_id);
        let mut winner_username = state.as_ref().and_then(|s| s.high_bidder_username.clone());
        if winner_id.is_none() {
            if let Some(top) = top_bids.first() {
                winner_id = Some(top.user_id);
                winner_username = Some(top.username.clone());
                info!(%auction_id, winner = %top.user_id, "winner derived from leaderboard");
            }
        }
        let winning_bid = winner_id.map(|_| current_high);

        // 3. Durable terminal transition.
        let ended_at = chrono::Utc::now();
        self.auctions
            .close(auction_id, ended_at, winner_id, winning_bid)
            .await?;

        // 4. Hot state follows.
        if let Err(err) = self
            .store
            .set_state_field(auction_id, "status", "closed")
            .await
        {
            warn!(%auction_id, error = %err, "failed to mark live state closed");
        }
        if let Err(err) = self.store.clear_active_flag(auction_id).await {
            warn!(%auction_id, error = %err, "failed to clear active flag");
        }

        // 5-6. Terminal broadcasts.
        let now = now_ms();
        self.publish(
            &self.keys.channel_events(auction_id),
            &AuctionEvent::AuctionEnd {
                auction_id,
                winner_id,
                winner_username: winner_username.clone(),
                winning_bid: current_high,
                end_time: now,
            },
        )
        .await;
        self.publish(
            &self.keys.channel_timer(auction_id),
            &TimerEvent::final_sync(auction_id, now),
        )
        .await;

        // 7. Settlement message: winner card plus every other
        //    participant as a loser.
        self.enqueue_settlement(
            auction_id,
            &auction.title,
            current_high,
            winner_id,
            &participants,
            now,
        )
        .await;

        info!(%auction_id, ?winner_id, %current_high, "auction closed");
        Ok(CloseOutcome {
            auction_id,
            winner_id,
            winner_username,
            winning_bid,
        })
    }

    async fn enqueue_settlement(
        &self,
        auction_id: Uuid,
        title: &str,
        final_price: Decimal,
        winner_id: Option<Uuid>,
        participants: &[Uuid],
        timestamp: i64,
    ) {
        let mut recipient_ids: Vec<Uuid> = participants.to_vec();
        if let Some(winner) = winner_id {
            if !recipient_ids.contains(&winner) {
                recipient_ids.push(winner);
            }
        }
        let contacts = match self.users.fetch_many(&recipient_ids).await {
            Ok(users) => users,
            Err(err) => {
                error!(%auction_id, error = %err, "failed to load settlement recipients");
                Vec::new()
            }
        };
        let contact_for = |id: Uuid| -> UserContact {
            contacts
                .iter()
                .find(|u| u.user_id == id)
                .map(UserContact::from)
                .unwrap_or_else(|| UserContact::bare(id))
        };

        let winner = winner_id.map(contact_for);
        let losers: Vec<UserContact> = participants
            .iter()
            .filter(|id| Some(**id) != winner_id)
            .map(|id| contact_for(*id))
            .collect();

        let message = SettlementMessage::AuctionClosed {
            auction_id,
            title: title.to_string(),
            final_price,
            winner,
            losers,
            timestamp,
        };
        if let Err(err) = self.queue.enqueue(&message).await {
            error!(%auction_id, error = %err, "failed to enqueue settlement message");
        }
    }

    async fn publish<T: serde::Serialize>(&self, channel: &str, event: &T) {
        match serde_json::to_string(event) {
            Ok(payload) => {
                if let Err(err) = self.store.publish(channel, &payload).await {
                    warn!(channel, error = %err, "close broadcast failed");
                }
            }
            Err(err) => error!(channel, error = %err, "failed to encode close event"),
        }
    }
}
