//! Anti-Snipe Timer Controller
//!
//! Single-process loop over the live auction set. Every broadcast
//! interval it publishes a `timer_sync` heartbeat per auction and
//! detects expiry; every sync interval it reconciles its in-memory set
//! against the durable database. Closing is delegated to the shared
//! close procedure; one auction's failure never stalls the others.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::AuctionRepo;
use crate::models::{now_ms, AuctionStatus, TimerEvent};
use crate::services::closer::AuctionCloser;
use crate::settings::{AuctionSettings, TimerSettings};
use crate::store::keys::Keys;
use crate::store::LiveStore;

/// What a tick decided about one auction.
enum TickAction {
    /// Still running; heartbeat sent.
    Running,
    /// Could not resolve an end time this round; retry next tick.
    Retry,
    /// Terminal: closed now or no longer exists.
    Drop,
}

pub struct TimerController {
    store: Arc<dyn LiveStore>,
    auctions: Arc<dyn AuctionRepo>,
    closer: Arc<AuctionCloser>,
    keys: Keys,
    timer: TimerSettings,
    auction_settings: AuctionSettings,
    live: Mutex<HashSet<Uuid>>,
}

impl TimerController {
    pub fn new(
        store: Arc<dyn LiveStore>,
        auctions: Arc<dyn AuctionRepo>,
        closer: Arc<AuctionCloser>,
        keys: Keys,
        timer: TimerSettings,
        auction_settings: AuctionSettings,
    ) -> Self {
        Self {
            store,
            auctions,
            closer,
            keys,
            timer,
            auction_settings,
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Start tracking an auction immediately instead of waiting for the
    /// next database sync.
    pub fn track(&self, auction_id: Uuid) {
        self.live.lock().insert(auction_id);
    }

    pub fn untrack(&self, auction_id: Uuid) {
        self.live.lock().remove(&auction_id);
    }

    pub fn tracked(&self) -> Vec<Uuid> {
        self.live.lock().iter().copied().collect()
    }

    /// Run until cancelled. A tick that overruns the broadcast interval
    /// delays the next tick rather than skipping it, so close detection
    /// is never lost.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.sync_with_database().await;
        info!(count = self.live.lock().len(), "timer controller started");

        let mut broadcast =
            tokio::time::interval(Duration::from_secs(self.timer.broadcast_interval_seconds.max(1)));
        broadcast.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut db_sync =
            tokio::time::interval(Duration::from_secs(self.timer.db_sync_interval_seconds.max(1)));
        db_sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first sync already happened above.
        db_sync.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = broadcast.tick() => self.tick().await,
                _ = db_sync.tick() => self.sync_with_database().await,
            }
        }
        info!("timer controller stopped");
    }

    /// One broadcast round over every tracked auction.
    pub async fn tick(&self) {
        let now = now_ms();
        let tracked = self.tracked();
        let mut to_drop = Vec::new();

        for auction_id in tracked {
            match self.process_auction(auction_id, now).await {
                TickAction::Running | TickAction::Retry => {}
                TickAction::Drop => to_drop.push(auction_id),
            }
        }

        if !to_drop.is_empty() {
            let mut live = self.live.lock();
            for auction_id in to_drop {
                live.remove(&auction_id);
            }
        }
    }

    async fn process_auction(&self, auction_id: Uuid, now: i64) -> TickAction {
        let end_time_ms = match self.resolve_end_time(auction_id, now).await {
            Ok(end) => end,
            Err(action) => return action,
        };

        if end_time_ms <= now {
            match self.closer.close(auction_id).await {
                Ok(_) => return TickAction::Drop,
                Err(err) => {
                    // Keep the auction tracked; the close retries next
                    // tick and other auctions are unaffected.
                    error!(%auction_id, error = %err, "close procedure failed");
                    return TickAction::Retry;
                }
            }
        }

        let event = TimerEvent::heartbeat(auction_id, now, end_time_ms);
        if let Ok(payload) = serde_json::to_string(&event) {
            if let Err(err) = self
                .store
                .publish(&self.keys.channel_timer(auction_id), &payload)
                .await
            {
                warn!(%auction_id, error = %err, "timer heartbeat publish failed");
            }
        }
        TickAction::Running
    }

    /// End-time fallback chain: dedicated key, then the state hash,
    /// then the durable record. Whatever deeper source answered gets
    /// re-materialized into the shallower ones.
    async fn resolve_end_time(&self, auction_id: Uuid, now: i64) -> Result<i64, TickAction> {
        // (i) dedicated TTL key.
        match self.store.end_time_ms(auction_id).await {
            Ok(Some(end)) => return Ok(end),
            Ok(None) => {}
            Err(err) => {
                warn!(%auction_id, error = %err, "end-time key read failed");
                return Err(TickAction::Retry);
            }
        }

        // (ii) `end_time` field in the state hash.
        let state = self.store.live_state(auction_id).await.unwrap_or(None);
        if let Some(state) = &state {
            if state.end_time_ms > 0 {
                let end = state.end_time_ms;
                let ttl = self.state_ttl(end, now);
                if let Err(err) = self.store.set_end_time(auction_id, end, ttl).await {
                    warn!(%auction_id, error = %err, "failed to re-materialize end-time key");
                }
                return Ok(end);
            }
        }

        // (iii) durable `created_at + duration`.
        let auction = match self.auctions.fetch(auction_id).await {
            Ok(Some(auction)) => auction,
            Ok(None) => {
                warn!(%auction_id, "tracked auction missing from database, dropping");
                return Err(TickAction::Drop);
            }
            Err(err) => {
                warn!(%auction_id, error = %err, "database read failed resolving end time");
                return Err(TickAction::Retry);
            }
        };
        if auction.status != AuctionStatus::Live {
            return Err(TickAction::Drop);
        }

        let mut end = auction.scheduled_end_ms();
        if end <= now {
            // Clock drift or a long outage left the computed end in the
            // past; restart the window rather than instantly closing an
            // auction nobody could bid on.
            warn!(%auction_id, computed_end = end, "computed end time in the past, resetting");
            end = now + auction.duration_seconds * 1000;
        }

        let ttl = self.state_ttl(end, now);
        if let Err(err) = self.store.set_end_time(auction_id, end, ttl).await {
            warn!(%auction_id, error = %err, "failed to materialize end-time key");
        }
        if state.is_some() {
            if let Err(err) = self
                .store
                .set_state_field(auction_id, "end_time", &end.to_string())
                .await
            {
                warn!(%auction_id, error = %err, "failed to materialize end_time field");
            }
        } else {
            // No live state at all: rebuild the seed from the durable
            // record so bids and snapshots work again.
            let seed = crate::models::LiveState::seed(
                auction.host_user_id,
                auction.starting_bid,
                auction.created_at.timestamp_millis(),
                end,
            );
            if let Err(err) = self
                .store
                .init_live_state(
                    auction_id,
                    &seed,
                    ttl,
                    Duration::from_millis((end - now).max(1) as u64),
                )
                .await
            {
                warn!(%auction_id, error = %err, "failed to rebuild live state");
            }
        }
        Ok(end)
    }

    fn state_ttl(&self, end_time_ms: i64, now: i64) -> Duration {
        let remaining_secs = ((end_time_ms - now).max(0) / 1000) as u64;
        Duration::from_secs(remaining_secs + self.auction_settings.state_ttl_slack_seconds)
    }

    /// Reconcile the in-memory live set against the durable database:
    /// add newly created auctions, drop ones the store reports closed.
    pub async fn sync_with_database(&self) {
        let db_live: HashSet<Uuid> = match self.auctions.list_live_ids().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(err) => {
                error!(error = %err, "database sync failed");
                return;
            }
        };

        let stale: Vec<Uuid> = {
            let mut live = self.live.lock();
            for id in &db_live {
                if live.insert(*id) {
                    info!(auction_id = %id, "tracking new live auction");
                }
            }
            live.iter().filter(|id| !db_live.contains(id)).copied().collect()
        };

        for auction_id in stale {
            let closed_in_store = matches!(
                self.store.live_state(auction_id).await,
                Ok(Some(state)) if state.status == AuctionStatus::Closed
            );
            if closed_in_store {
                self.untrack(auction_id);
                info!(%auction_id, "untracked closed auction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryAuctionRepo, MemoryUserRepo};
    use crate::models::{Auction, LiveState, SettlementMessage};
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    struct Fixture {
        controller: Arc<TimerController>,
        store: MemoryStore,
        auctions: MemoryAuctionRepo,
        queue: MemoryQueue,
    }

    fn auction(created_secs_ago: i64, duration: i64) -> Auction {
        Auction {
            auction_id: Uuid::new_v4(),
            host_user_id: Uuid::new_v4(),
            title: "Lot".into(),
            description: None,
            category: None,
            duration_seconds: duration,
            starting_bid: dec!(100),
            status: AuctionStatus::Live,
            seller_name: "Seller".into(),
            condition: None,
            image_url: None,
            gallery_urls: vec![],
            stream_channel_id: None,
            stream_playback_url: None,
            winner_id: None,
            winning_bid: None,
            created_at: Utc::now() - ChronoDuration::seconds(created_secs_ago),
            ended_at: None,
        }
    }

    fn fixture(auctions: Vec<Auction>) -> Fixture {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new();
        let auction_repo = MemoryAuctionRepo::with(auctions);
        let user_repo = MemoryUserRepo::new().linked_to(&auction_repo);
        let closer = Arc::new(AuctionCloser::new(
            Arc::new(store.clone()),
            Arc::new(auction_repo.clone()),
            Arc::new(user_repo),
            Arc::new(queue.clone()),
            Keys::default(),
        ));
        let controller = Arc::new(TimerController::new(
            Arc::new(store.clone()),
            Arc::new(auction_repo.clone()),
            closer,
            Keys::default(),
            TimerSettings::default(),
            AuctionSettings::default(),
        ));
        Fixture {
            controller,
            store,
            auctions: auction_repo,
            queue,
        }
    }

    async fn seed_live_state(store: &MemoryStore, auction: &Auction, end_in_ms: i64) {
        let now = now_ms();
        let state = LiveState::seed(auction.host_user_id, auction.starting_bid, now, now + end_in_ms);
        store
            .init_live_state(
                auction.auction_id,
                &state,
                Duration::from_secs(3660),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        store.clear_published();
    }

    #[tokio::test]
    async fn running_auction_gets_a_heartbeat() {
        let a = auction(0, 3600);
        let f = fixture(vec![a.clone()]);
        seed_live_state(&f.store, &a, 600_000).await;
        f.controller.track(a.auction_id);

        f.controller.tick().await;

        let published = f.store.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].0.ends_with(":timer"));
        let event: TimerEvent = serde_json::from_str(&published[0].1).unwrap();
        match event {
            TimerEvent::TimerSync {
                sync_type,
                time_remaining_ms,
                auction_ended,
                ..
            } => {
                assert_eq!(sync_type, crate::models::SyncType::Heartbeat);
                assert!(time_remaining_ms > 590_000);
                assert!(!auction_ended);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(f.controller.tracked(), vec![a.auction_id]);
    }

    #[tokio::test]
    async fn expiry_closes_and_untracks() {
        let a = auction(0, 3600);
        let f = fixture(vec![a.clone()]);
        seed_live_state(&f.store, &a, -1_000).await;
        f.controller.track(a.auction_id);

        f.controller.tick().await;

        let closed = f.auctions.fetch(a.auction_id).await.unwrap().unwrap();
        assert_eq!(closed.status, AuctionStatus::Closed);
        assert!(f.controller.tracked().is_empty());

        let published = f.store.published();
        assert!(published.iter().any(|(c, _)| c.ends_with(":events")));
        let finals: Vec<_> = published
            .iter()
            .filter(|(c, _)| c.ends_with(":timer"))
            .collect();
        assert_eq!(finals.len(), 1);
        let event: TimerEvent = serde_json::from_str(&finals[0].1).unwrap();
        assert!(matches!(
            event,
            TimerEvent::TimerSync {
                sync_type: crate::models::SyncType::Final,
                auction_ended: true,
                ..
            }
        ));
        assert_eq!(f.queue.enqueued().len(), 1);
        assert!(matches!(
            f.queue.enqueued()[0],
            SettlementMessage::AuctionClosed { .. }
        ));
    }

    #[tokio::test]
    async fn end_time_falls_back_to_the_state_hash() {
        let a = auction(0, 3600);
        let f = fixture(vec![a.clone()]);
        seed_live_state(&f.store, &a, 600_000).await;
        f.store.expire_end_time_key(a.auction_id);
        f.controller.track(a.auction_id);

        f.controller.tick().await;

        // Heartbeat still fires and the dedicated key is back.
        assert!(f
            .store
            .published()
            .iter()
            .any(|(c, _)| c.ends_with(":timer")));
        assert!(f.store.end_time_ms(a.auction_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn end_time_falls_back_to_the_database_and_resets_past_values() {
        // Created two hours ago with a one-hour duration: the computed
        // end is in the past, so the window restarts from now.
        let a = auction(7_200, 3_600);
        let f = fixture(vec![a.clone()]);
        f.controller.track(a.auction_id);

        f.controller.tick().await;

        let end = f.store.end_time_ms(a.auction_id).await.unwrap().unwrap();
        assert!(end > now_ms());
        // Live state was rebuilt from the durable record.
        let state = f.store.live_state(a.auction_id).await.unwrap().unwrap();
        assert_eq!(state.host_user_id, Some(a.host_user_id));
        // Still live and still tracked.
        assert_eq!(
            f.auctions.fetch(a.auction_id).await.unwrap().unwrap().status,
            AuctionStatus::Live
        );
        assert_eq!(f.controller.tracked(), vec![a.auction_id]);
    }

    #[tokio::test]
    async fn auction_missing_from_database_is_dropped() {
        let a = auction(0, 3600);
        let f = fixture(vec![]);
        f.controller.track(a.auction_id);
        f.controller.tick().await;
        assert!(f.controller.tracked().is_empty());
    }

    #[tokio::test]
    async fn one_failing_auction_does_not_block_the_rest() {
        let healthy = auction(0, 3600);
        let f = fixture(vec![healthy.clone()]);
        seed_live_state(&f.store, &healthy, 600_000).await;
        f.controller.track(healthy.auction_id);
        // Phantom id: resolves nothing anywhere, gets dropped.
        f.controller.track(Uuid::new_v4());

        f.controller.tick().await;

        assert!(f
            .store
            .published()
            .iter()
            .any(|(c, _)| c.contains(&healthy.auction_id.to_string())));
        assert_eq!(f.controller.tracked(), vec![healthy.auction_id]);
    }

    #[tokio::test]
    async fn database_sync_adds_new_and_removes_closed() {
        let fresh = auction(0, 3600);
        let f = fixture(vec![fresh.clone()]);

        // A stale id the database no longer lists, marked closed in the
        // store.
        let stale = Uuid::new_v4();
        f.controller.track(stale);
        f.store
            .set_state_field(stale, "status", "closed")
            .await
            .unwrap();

        f.controller.sync_with_database().await;

        let tracked = f.controller.tracked();
        assert!(tracked.contains(&fresh.auction_id));
        assert!(!tracked.contains(&stale));
    }
}
