//! Auction Service
//!
//! Auction lifecycle around the hot path: creation (durable row plus
//! live-state seed), reads enriched with realtime fields, host-initiated
//! close, and the caller's bid overview.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

use crate::auth::VerifiedUser;
use crate::db::{AuctionListFilter, AuctionRepo, BidRepo, UserRepo};
use crate::error::{AuctionError, Result};
use crate::media::{presign_auction_images, MediaStore};
use crate::models::{
    now_ms, time_remaining_seconds, Auction, AuctionRecord, AuctionStateView, AuctionStatus,
    CreateAuctionRequest, LiveState, UserBidSummary,
};
use crate::services::closer::{AuctionCloser, CloseOutcome};
use crate::services::timer::TimerController;
use crate::settings::AuctionSettings;
use crate::store::LiveStore;

pub struct AuctionService {
    store: Arc<dyn LiveStore>,
    auctions: Arc<dyn AuctionRepo>,
    users: Arc<dyn UserRepo>,
    bids: Arc<dyn BidRepo>,
    closer: Arc<AuctionCloser>,
    timer: Arc<TimerController>,
    media: Arc<dyn MediaStore>,
    settings: AuctionSettings,
}

impl AuctionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LiveStore>,
        auctions: Arc<dyn AuctionRepo>,
        users: Arc<dyn UserRepo>,
        bids: Arc<dyn BidRepo>,
        closer: Arc<AuctionCloser>,
        timer: Arc<TimerController>,
        media: Arc<dyn MediaStore>,
        settings: AuctionSettings,
    ) -> Self {
        Self {
            store,
            auctions,
            users,
            bids,
            closer,
            timer,
            media,
            settings,
        }
    }

    /// Create the durable record, seed the live state, and start the
    /// timer tracking it.
    pub async fn create(
        &self,
        host: &VerifiedUser,
        request: CreateAuctionRequest,
    ) -> Result<AuctionRecord> {
        request
            .validate()
            .map_err(|err| AuctionError::Validation(err.to_string()))?;
        if request.starting_bid < Decimal::ZERO {
            return Err(AuctionError::Validation(
                "starting_bid must not be negative".into(),
            ));
        }
        if request.starting_bid.scale() > 2 {
            return Err(AuctionError::Validation(
                "starting_bid must have at most 2 decimal places".into(),
            ));
        }
        if request.seller_name.trim().is_empty() {
            return Err(AuctionError::Validation("seller_name is required".into()));
        }

        let auction = Auction {
            auction_id: Uuid::new_v4(),
            host_user_id: host.user_id,
            title: request.title,
            description: request.description,
            category: request.category,
            duration_seconds: request.duration,
            starting_bid: request.starting_bid,
            status: AuctionStatus::Live,
            seller_name: request.seller_name.trim().to_string(),
            condition: request.condition,
            image_url: request.image_url,
            gallery_urls: request.images,
            stream_channel_id: request.stream_channel_id,
            stream_playback_url: request.stream_playback_url,
            winner_id: None,
            winning_bid: None,
            created_at: chrono::Utc::now(),
            ended_at: None,
        };
        self.auctions.insert(&auction).await?;

        let start_ms = auction.created_at.timestamp_millis();
        let end_ms = start_ms + auction.duration_seconds * 1000;
        let state = LiveState::seed(host.user_id, auction.starting_bid, start_ms, end_ms);
        let state_ttl = Duration::from_secs(
            auction.duration_seconds as u64 + self.settings.state_ttl_slack_seconds,
        );
        let active_ttl = Duration::from_secs(auction.duration_seconds as u64);
        self.store
            .init_live_state(auction.auction_id, &state, state_ttl, active_ttl)
            .await
            .map_err(|err| AuctionError::Transient(err.to_string()))?;

        self.timer.track(auction.auction_id);
        self.get(auction.auction_id).await
    }

    /// Full record for one auction: durable fields, presigned images,
    /// realtime enrichment while live, winner details once closed.
    pub async fn get(&self, auction_id: Uuid) -> Result<AuctionRecord> {
        let auction = self
            .auctions
            .fetch(auction_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(auction_id))?;
        let mut record = AuctionRecord::from_auction(auction);
        presign_auction_images(self.media.as_ref(), &mut record).await;
        if record.status == AuctionStatus::Live {
            self.attach_realtime_fields(&mut record).await;
        }
        self.attach_winner_fields(&mut record).await;
        Ok(record)
    }

    pub async fn list(&self, filter: &AuctionListFilter) -> Result<Vec<AuctionRecord>> {
        let auctions = self.auctions.list(filter).await?;
        let mut records = Vec::with_capacity(auctions.len());
        for auction in auctions {
            let mut record = AuctionRecord::from_auction(auction);
            // List views presign the cover image only; galleries load
            // on the detail read.
            if let Some(url) = record.image_url.take() {
                record.image_url = Some(self.media.presign_get(&url).await);
            }
            if record.status == AuctionStatus::Live {
                self.attach_realtime_fields(&mut record).await;
            }
            self.attach_winner_fields(&mut record).await;
            records.push(record);
        }
        Ok(records)
    }

    /// Batch fetch preserving request order; unknown ids are skipped.
    pub async fn batch(&self, auction_ids: &[Uuid]) -> Result<Vec<AuctionRecord>> {
        let fetched = self.auctions.fetch_many(auction_ids).await?;
        let mut records = Vec::with_capacity(auction_ids.len());
        for id in auction_ids {
            let Some(auction) = fetched.iter().find(|a| a.auction_id == *id) else {
                continue;
            };
            let mut record = AuctionRecord::from_auction(auction.clone());
            if let Some(url) = record.image_url.take() {
                record.image_url = Some(self.media.presign_get(&url).await);
            }
            if record.status == AuctionStatus::Live {
                self.attach_realtime_fields(&mut record).await;
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Realtime projection for `GET /auctions/{id}/state`.
    pub async fn state_view(&self, auction_id: Uuid) -> Result<AuctionStateView> {
        let auction = self
            .auctions
            .fetch(auction_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(auction_id))?;

        let state = self
            .store
            .live_state(auction_id)
            .await
            .unwrap_or_else(|err| {
                warn!(%auction_id, error = %err, "live state read failed, serving durable view");
                None
            });
        let top_bids = self.store.top_bids(auction_id, 3).await.unwrap_or_default();
        let now = now_ms();

        Ok(match state {
            Some(state) => AuctionStateView {
                auction_id,
                status: state.status,
                current_high_bid: state.current_high_bid,
                high_bidder_id: state.high_bidder_id,
                high_bidder_username: state.high_bidder_username,
                participant_count: state.participant_count,
                bid_count: state.bid_count,
                time_remaining_seconds: time_remaining_seconds(state.end_time_ms, now),
                top_bids,
                anti_snipe_count: state.anti_snipe_count,
            },
            None => AuctionStateView {
                auction_id,
                status: auction.status,
                current_high_bid: auction.winning_bid.unwrap_or(auction.starting_bid),
                high_bidder_id: auction.winner_id,
                high_bidder_username: None,
                participant_count: 0,
                bid_count: 0,
                time_remaining_seconds: 0,
                top_bids,
                anti_snipe_count: 0,
            },
        })
    }

    /// Host-initiated close: steps 3-8 of the close procedure behind an
    /// ownership check.
    pub async fn close_manual(
        &self,
        auction_id: Uuid,
        requestor_id: Uuid,
    ) -> Result<CloseOutcome> {
        let auction = self
            .auctions
            .fetch(auction_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(auction_id))?;
        if auction.host_user_id != requestor_id {
            return Err(AuctionError::Forbidden(
                "Only the host can close this auction".into(),
            ));
        }
        if auction.status != AuctionStatus::Live {
            return Err(AuctionError::AuctionClosed(auction_id));
        }
        let outcome = self.closer.close(auction_id).await?;
        self.timer.untrack(auction_id);
        Ok(outcome)
    }

    /// The caller's persisted bids joined with current auction state.
    pub async fn list_user_bids(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<UserBidSummary>> {
        let rows = self.bids.list_user_bids(user_id, limit, offset).await?;
        let now = now_ms();
        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let state = self.store.live_state(row.auction_id).await.unwrap_or(None);
            let image_url = match row.image_url {
                Some(url) => Some(self.media.presign_get(&url).await),
                None => None,
            };
            summaries.push(UserBidSummary {
                bid_id: row.bid_id,
                auction_id: row.auction_id,
                title: row.title,
                image_url,
                amount: row.amount,
                created_at: chrono::DateTime::from_timestamp_millis(row.timestamp_ms)
                    .unwrap_or_else(chrono::Utc::now),
                status: row.status,
                current_high_bid: state
                    .as_ref()
                    .map(|s| s.current_high_bid)
                    .unwrap_or(row.amount),
                time_remaining_seconds: state
                    .as_ref()
                    .map(|s| time_remaining_seconds(s.end_time_ms, now))
                    .unwrap_or(0),
                participant_count: state.map(|s| s.participant_count).unwrap_or(0),
            });
        }
        Ok(summaries)
    }

    async fn attach_realtime_fields(&self, record: &mut AuctionRecord) {
        let auction_id = record.auction_id;
        let state = match self.store.live_state(auction_id).await {
            Ok(state) => state,
            Err(err) => {
                warn!(%auction_id, error = %err, "failed to attach realtime fields");
                return;
            }
        };
        let now = now_ms();

        // End time: dedicated key, then state hash, then created_at +
        // duration from the durable fields already on the record.
        let end_time_ms = match self.store.end_time_ms(auction_id).await {
            Ok(Some(end)) => Some(end),
            _ => state
                .as_ref()
                .map(|s| s.end_time_ms)
                .filter(|end| *end > 0)
                .or_else(|| Some(record.created_at.timestamp_millis() + record.duration * 1000)),
        };
        if let Some(end) = end_time_ms {
            record.end_time_ms = Some(end);
            record.time_remaining_seconds = Some(time_remaining_seconds(end, now));
        }

        if let Some(state) = state {
            record.current_high_bid = Some(state.current_high_bid);
            record.high_bidder_id = state.high_bidder_id;
            record.high_bidder_username = state.high_bidder_username;
            record.participant_count = Some(state.participant_count);
            record.bid_count = Some(state.bid_count);
        }
    }

    async fn attach_winner_fields(&self, record: &mut AuctionRecord) {
        let Some(winner_id) = record.winner_id else {
            return;
        };
        match self.users.fetch(winner_id).await {
            Ok(Some(winner)) => record.winner_username = Some(winner.username),
            Ok(None) => {}
            Err(err) => warn!(%winner_id, error = %err, "failed to load winner"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryAuctionRepo, MemoryBidRepo, MemoryUserRepo};
    use crate::media::PassthroughMediaStore;
    use crate::models::User;
    use crate::queue::MemoryQueue;
    use crate::settings::TimerSettings;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Fixture {
        service: AuctionService,
        store: MemoryStore,
        auctions: MemoryAuctionRepo,
        timer: Arc<TimerController>,
        host: VerifiedUser,
    }

    fn verified(user: &User) -> VerifiedUser {
        VerifiedUser {
            user_id: user.user_id,
            username: user.username.clone(),
            email: Some(user.email.clone()),
            email_verified: true,
            name: user.name.clone(),
            phone: None,
        }
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new();
        let auctions = MemoryAuctionRepo::new();
        let host_user = User {
            user_id: Uuid::new_v4(),
            email: "host@example.com".into(),
            username: "host".into(),
            name: None,
            phone: None,
            is_verified: true,
            created_at: Utc::now(),
        };
        let users = MemoryUserRepo::with([host_user.clone()]).linked_to(&auctions);
        let bids = MemoryBidRepo::new().linked_to(&auctions);

        let closer = Arc::new(AuctionCloser::new(
            Arc::new(store.clone()),
            Arc::new(auctions.clone()),
            Arc::new(users.clone()),
            Arc::new(queue),
            crate::store::keys::Keys::default(),
        ));
        let timer = Arc::new(TimerController::new(
            Arc::new(store.clone()),
            Arc::new(auctions.clone()),
            closer.clone(),
            crate::store::keys::Keys::default(),
            TimerSettings::default(),
            AuctionSettings::default(),
        ));
        let service = AuctionService::new(
            Arc::new(store.clone()),
            Arc::new(auctions.clone()),
            Arc::new(users),
            Arc::new(bids),
            closer,
            timer.clone(),
            Arc::new(PassthroughMediaStore),
            AuctionSettings::default(),
        );
        Fixture {
            service,
            store,
            auctions,
            timer,
            host: verified(&host_user),
        }
    }

    fn create_request() -> CreateAuctionRequest {
        CreateAuctionRequest {
            title: "Vintage amp".into(),
            description: Some("Warm tubes".into()),
            duration: 3600,
            category: Some("music".into()),
            starting_bid: dec!(100.00),
            seller_name: "Ampworks".into(),
            condition: Some("good".into()),
            image_url: Some("https://blobs/amp.jpg".into()),
            images: vec!["https://blobs/amp-2.jpg".into()],
            stream_channel_id: None,
            stream_playback_url: None,
        }
    }

    #[tokio::test]
    async fn create_seeds_live_state_and_tracks_the_timer() {
        let f = fixture();
        let record = f.service.create(&f.host, create_request()).await.unwrap();

        assert_eq!(record.status, AuctionStatus::Live);
        assert_eq!(record.current_high_bid, Some(dec!(100.00)));
        assert_eq!(record.bid_count, Some(0));
        assert!(record.time_remaining_seconds.unwrap() > 3590);

        let state = f
            .store
            .live_state(record.auction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.host_user_id, Some(f.host.user_id));
        assert_eq!(state.current_high_bid, dec!(100.00));
        assert_eq!(f.timer.tracked(), vec![record.auction_id]);
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let f = fixture();

        let mut request = create_request();
        request.duration = 0;
        assert!(matches!(
            f.service.create(&f.host, request).await.unwrap_err(),
            AuctionError::Validation(_)
        ));

        let mut request = create_request();
        request.starting_bid = dec!(10.001);
        assert!(matches!(
            f.service.create(&f.host, request).await.unwrap_err(),
            AuctionError::Validation(_)
        ));

        let mut request = create_request();
        request.seller_name = "   ".into();
        assert!(matches!(
            f.service.create(&f.host, request).await.unwrap_err(),
            AuctionError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn get_unknown_auction_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.service.get(Uuid::new_v4()).await.unwrap_err(),
            AuctionError::AuctionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn batch_preserves_request_order_and_skips_unknown() {
        let f = fixture();
        let first = f.service.create(&f.host, create_request()).await.unwrap();
        let second = f.service.create(&f.host, create_request()).await.unwrap();

        let records = f
            .service
            .batch(&[second.auction_id, Uuid::new_v4(), first.auction_id])
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].auction_id, second.auction_id);
        assert_eq!(records[1].auction_id, first.auction_id);
    }

    #[tokio::test]
    async fn manual_close_requires_the_host() {
        let f = fixture();
        let record = f.service.create(&f.host, create_request()).await.unwrap();

        let err = f
            .service
            .close_manual(record.auction_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AuctionError::Forbidden(_)));

        let outcome = f
            .service
            .close_manual(record.auction_id, f.host.user_id)
            .await
            .unwrap();
        assert_eq!(outcome.auction_id, record.auction_id);
        assert!(f.timer.tracked().is_empty());

        // Closing twice conflicts.
        let err = f
            .service
            .close_manual(record.auction_id, f.host.user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AuctionError::AuctionClosed(_)));
    }

    #[tokio::test]
    async fn state_view_serves_live_numbers() {
        let f = fixture();
        let record = f.service.create(&f.host, create_request()).await.unwrap();
        f.store
            .set_state_field(record.auction_id, "current_high_bid", "240.00")
            .await
            .unwrap();

        let view = f.service.state_view(record.auction_id).await.unwrap();
        assert_eq!(view.status, AuctionStatus::Live);
        assert_eq!(view.current_high_bid, dec!(240.00));
        assert!(view.time_remaining_seconds > 0);
    }

    #[tokio::test]
    async fn state_view_survives_expired_live_state() {
        let f = fixture();
        let record = f.service.create(&f.host, create_request()).await.unwrap();
        f.store.expire_auction(record.auction_id);

        let view = f.service.state_view(record.auction_id).await.unwrap();
        assert_eq!(view.current_high_bid, dec!(100.00));
        assert_eq!(view.participant_count, 0);
    }

    #[tokio::test]
    async fn listing_filters_by_status() {
        let f = fixture();
        let open = f.service.create(&f.host, create_request()).await.unwrap();
        let closed = f.service.create(&f.host, create_request()).await.unwrap();
        f.service
            .close_manual(closed.auction_id, f.host.user_id)
            .await
            .unwrap();

        let live = f
            .service
            .list(&AuctionListFilter {
                status: Some(AuctionStatus::Live),
                category: None,
                limit: 20,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].auction_id, open.auction_id);
        assert!(f.auctions.fetch(closed.auction_id).await.unwrap().is_some());
    }
}
