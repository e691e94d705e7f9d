//! Durable repositories
//!
//! PostgreSQL owns the records that outlive the hot path: auctions,
//! users, append-only bid history, and the settlement notification
//! dedup ledger. Repositories are traits so services run against fakes
//! in tests; the Postgres implementations use short transactions and
//! no cross-request locks.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Auction, AuctionStatus, User};

pub use memory::{MemoryAuctionRepo, MemoryBidRepo, MemoryNotificationRepo, MemoryUserRepo};
pub use postgres::{PgAuctionRepo, PgBidRepo, PgNotificationRepo, PgUserRepo};

/// Filter for auction listings.
#[derive(Debug, Clone, Default)]
pub struct AuctionListFilter {
    pub status: Option<AuctionStatus>,
    pub category: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[async_trait]
pub trait AuctionRepo: Send + Sync {
    async fn insert(&self, auction: &Auction) -> Result<()>;

    async fn fetch(&self, auction_id: Uuid) -> Result<Option<Auction>>;

    /// Fetch a batch; missing ids are simply absent from the result.
    async fn fetch_many(&self, auction_ids: &[Uuid]) -> Result<Vec<Auction>>;

    async fn list(&self, filter: &AuctionListFilter) -> Result<Vec<Auction>>;

    async fn list_live_ids(&self) -> Result<Vec<Uuid>>;

    /// The terminal transition: the only multi-field update on an
    /// auction row. Idempotent; a second close leaves the first
    /// outcome in place.
    async fn close(
        &self,
        auction_id: Uuid,
        ended_at: DateTime<Utc>,
        winner_id: Option<Uuid>,
        winning_bid: Option<Decimal>,
    ) -> Result<()>;
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn fetch(&self, user_id: Uuid) -> Result<Option<User>>;

    async fn fetch_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn fetch_many(&self, user_ids: &[Uuid]) -> Result<Vec<User>>;

    async fn insert(&self, user: &User) -> Result<()>;

    async fn update_profile(&self, user: &User) -> Result<()>;

    async fn username_taken_by_other(&self, username: &str, user_id: Uuid) -> Result<bool>;

    /// How many auctions reference this user as host or winner.
    async fn auction_reference_count(&self, user_id: Uuid) -> Result<i64>;

    async fn delete(&self, user_id: Uuid) -> Result<()>;

    /// Integrity-preserving identity rename: insert the new row,
    /// repoint auction references from the legacy id, delete the legacy
    /// row — all in one transaction.
    async fn migrate_identity(&self, legacy_id: Uuid, user: &User) -> Result<()>;
}

/// Append-only bid history row; key is `(auction_id, sort_key)` where
/// the sort key is `{timestamp_ms}#{user_id}`.
#[derive(Debug, Clone, PartialEq)]
pub struct BidHistoryRow {
    pub auction_id: Uuid,
    pub sort_key: String,
    pub bid_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub amount: Decimal,
    pub timestamp_ms: i64,
    pub is_highest_at_commit: bool,
    pub ttl_expiry_epoch: i64,
}

impl BidHistoryRow {
    pub fn sort_key_for(timestamp_ms: i64, user_id: Uuid) -> String {
        format!("{timestamp_ms}#{user_id}")
    }
}

/// A persisted bid joined with its auction's durable fields, for the
/// caller's "my bids" overview.
#[derive(Debug, Clone)]
pub struct UserBidRow {
    pub bid_id: Uuid,
    pub auction_id: Uuid,
    pub title: String,
    pub image_url: Option<String>,
    pub amount: Decimal,
    pub timestamp_ms: i64,
    pub status: AuctionStatus,
}

#[async_trait]
pub trait BidRepo: Send + Sync {
    /// Write a history row. Returns `false` when the deterministic key
    /// already exists, which is how duplicate queue deliveries are
    /// absorbed.
    async fn insert_history(&self, row: &BidHistoryRow) -> Result<bool>;

    async fn list_user_bids(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<UserBidRow>>;
}

#[async_trait]
pub trait NotificationRepo: Send + Sync {
    /// Whether the `(auction_id, recipient)` dedup tag is already
    /// recorded. Redeliveries check this before dispatching.
    async fn is_claimed(&self, auction_id: Uuid, recipient_user_id: Uuid) -> Result<bool>;

    /// Record the `(auction_id, recipient)` dedup tag after a
    /// successful dispatch. Returns `true` exactly once per pair.
    async fn try_claim(&self, auction_id: Uuid, recipient_user_id: Uuid) -> Result<bool>;
}
