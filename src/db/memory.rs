//! In-memory repositories
//!
//! Mutex-guarded maps with the same observable behavior as the
//! Postgres repositories. Tests wire services against these.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{
    AuctionListFilter, AuctionRepo, BidHistoryRow, BidRepo, NotificationRepo, UserBidRow,
    UserRepo,
};
use crate::error::{AuctionError, Result};
use crate::models::{Auction, AuctionStatus, User};

#[derive(Clone, Default)]
pub struct MemoryAuctionRepo {
    auctions: Arc<Mutex<HashMap<Uuid, Auction>>>,
}

impl MemoryAuctionRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(auctions: impl IntoIterator<Item = Auction>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.auctions.lock();
            for auction in auctions {
                map.insert(auction.auction_id, auction);
            }
        }
        repo
    }
}

#[async_trait]
impl AuctionRepo for MemoryAuctionRepo {
    async fn insert(&self, auction: &Auction) -> Result<()> {
        self.auctions
            .lock()
            .insert(auction.auction_id, auction.clone());
        Ok(())
    }

    async fn fetch(&self, auction_id: Uuid) -> Result<Option<Auction>> {
        Ok(self.auctions.lock().get(&auction_id).cloned())
    }

    async fn fetch_many(&self, auction_ids: &[Uuid]) -> Result<Vec<Auction>> {
        let map = self.auctions.lock();
        Ok(auction_ids
            .iter()
            .filter_map(|id| map.get(id).cloned())
            .collect())
    }

    async fn list(&self, filter: &AuctionListFilter) -> Result<Vec<Auction>> {
        let map = self.auctions.lock();
        let mut auctions: Vec<Auction> = map
            .values()
            .filter(|a| filter.status.map_or(true, |s| a.status == s))
            .filter(|a| {
                filter
                    .category
                    .as_ref()
                    .map_or(true, |c| a.category.as_deref() == Some(c.as_str()))
            })
            .cloned()
            .collect();
        auctions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(auctions
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn list_live_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .auctions
            .lock()
            .values()
            .filter(|a| a.status == AuctionStatus::Live)
            .map(|a| a.auction_id)
            .collect())
    }

    async fn close(
        &self,
        auction_id: Uuid,
        ended_at: DateTime<Utc>,
        winner_id: Option<Uuid>,
        winning_bid: Option<Decimal>,
    ) -> Result<()> {
        let mut map = self.auctions.lock();
        if let Some(auction) = map.get_mut(&auction_id) {
            if auction.status == AuctionStatus::Live {
                auction.status = AuctionStatus::Closed;
                auction.ended_at = Some(ended_at);
                auction.winner_id = winner_id;
                auction.winning_bid = winning_bid;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryUserRepo {
    users: Arc<Mutex<HashMap<Uuid, User>>>,
    auctions: Arc<Mutex<HashMap<Uuid, Auction>>>,
}

impl MemoryUserRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(users: impl IntoIterator<Item = User>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.users.lock();
            for user in users {
                map.insert(user.user_id, user);
            }
        }
        repo
    }

    /// Share the auction map so reference counting sees the same rows
    /// as a paired `MemoryAuctionRepo`.
    pub fn linked_to(mut self, auctions: &MemoryAuctionRepo) -> Self {
        self.auctions = auctions.auctions.clone();
        self
    }
}

#[async_trait]
impl UserRepo for MemoryUserRepo {
    async fn fetch(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.users.lock().get(&user_id).cloned())
    }

    async fn fetch_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .lock()
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn fetch_many(&self, user_ids: &[Uuid]) -> Result<Vec<User>> {
        let map = self.users.lock();
        Ok(user_ids
            .iter()
            .filter_map(|id| map.get(id).cloned())
            .collect())
    }

    async fn insert(&self, user: &User) -> Result<()> {
        let mut map = self.users.lock();
        if map.values().any(|u| u.email == user.email) {
            return Err(AuctionError::Internal("duplicate email".into()));
        }
        map.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn update_profile(&self, user: &User) -> Result<()> {
        self.users.lock().insert(user.user_id, user.clone());
        Ok(())
    }

    async fn username_taken_by_other(&self, username: &str, user_id: Uuid) -> Result<bool> {
        Ok(self
            .users
            .lock()
            .values()
            .any(|u| u.username == username && u.user_id != user_id))
    }

    async fn auction_reference_count(&self, user_id: Uuid) -> Result<i64> {
        Ok(self
            .auctions
            .lock()
            .values()
            .filter(|a| a.host_user_id == user_id || a.winner_id == Some(user_id))
            .count() as i64)
    }

    async fn delete(&self, user_id: Uuid) -> Result<()> {
        self.users.lock().remove(&user_id);
        Ok(())
    }

    async fn migrate_identity(&self, legacy_id: Uuid, user: &User) -> Result<()> {
        {
            let mut auctions = self.auctions.lock();
            for auction in auctions.values_mut() {
                if auction.host_user_id == legacy_id {
                    auction.host_user_id = user.user_id;
                }
                if auction.winner_id == Some(legacy_id) {
                    auction.winner_id = Some(user.user_id);
                }
            }
        }
        let mut users = self.users.lock();
        users.remove(&legacy_id);
        users.insert(user.user_id, user.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryBidRepo {
    rows: Arc<Mutex<HashMap<(Uuid, String), BidHistoryRow>>>,
    auctions: Arc<Mutex<HashMap<Uuid, Auction>>>,
}

impl MemoryBidRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linked_to(mut self, auctions: &MemoryAuctionRepo) -> Self {
        self.auctions = auctions.auctions.clone();
        self
    }

    pub fn rows(&self) -> Vec<BidHistoryRow> {
        self.rows.lock().values().cloned().collect()
    }
}

#[async_trait]
impl BidRepo for MemoryBidRepo {
    async fn insert_history(&self, row: &BidHistoryRow) -> Result<bool> {
        let mut rows = self.rows.lock();
        let key = (row.auction_id, row.sort_key.clone());
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, row.clone());
        Ok(true)
    }

    async fn list_user_bids(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<UserBidRow>> {
        let auctions = self.auctions.lock();
        let mut rows: Vec<UserBidRow> = self
            .rows
            .lock()
            .values()
            .filter(|row| row.user_id == user_id)
            .filter_map(|row| {
                let auction = auctions.get(&row.auction_id)?;
                Some(UserBidRow {
                    bid_id: row.bid_id,
                    auction_id: row.auction_id,
                    title: auction.title.clone(),
                    image_url: auction.image_url.clone(),
                    amount: row.amount,
                    timestamp_ms: row.timestamp_ms,
                    status: auction.status,
                })
            })
            .collect();
        rows.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct MemoryNotificationRepo {
    claimed: Arc<Mutex<HashSet<(Uuid, Uuid)>>>,
}

impl MemoryNotificationRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.lock().len()
    }
}

#[async_trait]
impl NotificationRepo for MemoryNotificationRepo {
    async fn is_claimed(&self, auction_id: Uuid, recipient_user_id: Uuid) -> Result<bool> {
        Ok(self
            .claimed
            .lock()
            .contains(&(auction_id, recipient_user_id)))
    }

    async fn try_claim(&self, auction_id: Uuid, recipient_user_id: Uuid) -> Result<bool> {
        Ok(self.claimed.lock().insert((auction_id, recipient_user_id)))
    }
}
