//! PostgreSQL repositories

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::{
    AuctionListFilter, AuctionRepo, BidHistoryRow, BidRepo, NotificationRepo, UserBidRow,
    UserRepo,
};
use crate::error::{AuctionError, Result};
use crate::models::{Auction, AuctionStatus, User};

#[derive(Debug, FromRow)]
struct AuctionRow {
    auction_id: Uuid,
    host_user_id: Uuid,
    title: String,
    description: Option<String>,
    category: Option<String>,
    duration_seconds: i64,
    starting_bid: Decimal,
    status: String,
    seller_name: String,
    condition: Option<String>,
    image_url: Option<String>,
    gallery_urls: Vec<String>,
    stream_channel_id: Option<String>,
    stream_playback_url: Option<String>,
    winner_id: Option<Uuid>,
    winning_bid: Option<Decimal>,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<AuctionRow> for Auction {
    type Error = AuctionError;

    fn try_from(row: AuctionRow) -> Result<Self> {
        let status: AuctionStatus = row
            .status
            .parse()
            .map_err(|detail: String| AuctionError::Internal(detail))?;
        Ok(Auction {
            auction_id: row.auction_id,
            host_user_id: row.host_user_id,
            title: row.title,
            description: row.description,
            category: row.category,
            duration_seconds: row.duration_seconds,
            starting_bid: row.starting_bid,
            status,
            seller_name: row.seller_name,
            condition: row.condition,
            image_url: row.image_url,
            gallery_urls: row.gallery_urls,
            stream_channel_id: row.stream_channel_id,
            stream_playback_url: row.stream_playback_url,
            winner_id: row.winner_id,
            winning_bid: row.winning_bid,
            created_at: row.created_at,
            ended_at: row.ended_at,
        })
    }
}

const AUCTION_COLUMNS: &str = "auction_id, host_user_id, title, description, category, \
     duration_seconds, starting_bid, status, seller_name, condition, image_url, gallery_urls, \
     stream_channel_id, stream_playback_url, winner_id, winning_bid, created_at, ended_at";

pub struct PgAuctionRepo {
    pool: PgPool,
}

impl PgAuctionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuctionRepo for PgAuctionRepo {
    async fn insert(&self, auction: &Auction) -> Result<()> {
        sqlx::query(
            "INSERT INTO auctions (auction_id, host_user_id, title, description, category, \
             duration_seconds, starting_bid, status, seller_name, condition, image_url, \
             gallery_urls, stream_channel_id, stream_playback_url, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(auction.auction_id)
        .bind(auction.host_user_id)
        .bind(&auction.title)
        .bind(&auction.description)
        .bind(&auction.category)
        .bind(auction.duration_seconds)
        .bind(auction.starting_bid)
        .bind(auction.status.as_str())
        .bind(&auction.seller_name)
        .bind(&auction.condition)
        .bind(&auction.image_url)
        .bind(&auction.gallery_urls)
        .bind(&auction.stream_channel_id)
        .bind(&auction.stream_playback_url)
        .bind(auction.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(&self, auction_id: Uuid) -> Result<Option<Auction>> {
        let row: Option<AuctionRow> = sqlx::query_as(&format!(
            "SELECT {AUCTION_COLUMNS} FROM auctions WHERE auction_id = $1"
        ))
        .bind(auction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Auction::try_from).transpose()
    }

    async fn fetch_many(&self, auction_ids: &[Uuid]) -> Result<Vec<Auction>> {
        let rows: Vec<AuctionRow> = sqlx::query_as(&format!(
            "SELECT {AUCTION_COLUMNS} FROM auctions WHERE auction_id = ANY($1)"
        ))
        .bind(auction_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Auction::try_from).collect()
    }

    async fn list(&self, filter: &AuctionListFilter) -> Result<Vec<Auction>> {
        let rows: Vec<AuctionRow> = sqlx::query_as(&format!(
            "SELECT {AUCTION_COLUMNS} FROM auctions \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR category = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(filter.status.map(|s| s.as_str().to_string()))
        .bind(&filter.category)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Auction::try_from).collect()
    }

    async fn list_live_ids(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> =
            sqlx::query_as("SELECT auction_id FROM auctions WHERE status = 'live'")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn close(
        &self,
        auction_id: Uuid,
        ended_at: DateTime<Utc>,
        winner_id: Option<Uuid>,
        winning_bid: Option<Decimal>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE auctions SET status = 'closed', ended_at = $2, winner_id = $3, \
             winning_bid = $4 WHERE auction_id = $1 AND status = 'live'",
        )
        .bind(auction_id)
        .bind(ended_at)
        .bind(winner_id)
        .bind(winning_bid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    user_id: Uuid,
    email: String,
    username: String,
    name: Option<String>,
    phone: Option<String>,
    is_verified: bool,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            user_id: row.user_id,
            email: row.email,
            username: row.username,
            name: row.name,
            phone: row.phone,
            is_verified: row.is_verified,
            created_at: row.created_at,
        }
    }
}

const USER_COLUMNS: &str = "user_id, email, username, name, phone, is_verified, created_at";

pub struct PgUserRepo {
    pool: PgPool,
}

impl PgUserRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepo for PgUserRepo {
    async fn fetch(&self, user_id: Uuid) -> Result<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = $1"))
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    async fn fetch_by_email(&self, email: &str) -> Result<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    async fn fetch_many(&self, user_ids: &[Uuid]) -> Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE user_id = ANY($1)"
        ))
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn insert(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (user_id, email, username, name, phone, is_verified, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.name)
        .bind(&user.phone)
        .bind(user.is_verified)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_profile(&self, user: &User) -> Result<()> {
        sqlx::query(
            "UPDATE users SET email = $2, username = $3, name = $4, phone = $5, \
             is_verified = $6 WHERE user_id = $1",
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.name)
        .bind(&user.phone)
        .bind(user.is_verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn username_taken_by_other(&self, username: &str, user_id: Uuid) -> Result<bool> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM users WHERE username = $1 AND user_id <> $2")
                .bind(username)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn auction_reference_count(&self, user_id: Uuid) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM auctions WHERE host_user_id = $1 OR winner_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn delete(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn migrate_identity(&self, legacy_id: Uuid, user: &User) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Free the unique columns first; the legacy row keeps FK
        // integrity alive until the references are repointed.
        let suffix = &legacy_id.to_string()[..8];
        sqlx::query(
            "UPDATE users SET email = email || '.legacy.' || $2, \
             username = username || '_legacy_' || $2 WHERE user_id = $1",
        )
        .bind(legacy_id)
        .bind(suffix)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO users (user_id, email, username, name, phone, is_verified, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.name)
        .bind(&user.phone)
        .bind(user.is_verified)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE auctions SET host_user_id = $2 WHERE host_user_id = $1")
            .bind(legacy_id)
            .bind(user.user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE auctions SET winner_id = $2 WHERE winner_id = $1")
            .bind(legacy_id)
            .bind(user.user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(legacy_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct UserBidRowRaw {
    bid_id: Uuid,
    auction_id: Uuid,
    title: String,
    image_url: Option<String>,
    amount: Decimal,
    timestamp_ms: i64,
    status: String,
}

pub struct PgBidRepo {
    pool: PgPool,
}

impl PgBidRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BidRepo for PgBidRepo {
    async fn insert_history(&self, row: &BidHistoryRow) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO bid_history (auction_id, sort_key, bid_id, user_id, username, amount, \
             timestamp_ms, is_highest_at_commit, ttl_expiry_epoch) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (auction_id, sort_key) DO NOTHING",
        )
        .bind(row.auction_id)
        .bind(&row.sort_key)
        .bind(row.bid_id)
        .bind(row.user_id)
        .bind(&row.username)
        .bind(row.amount)
        .bind(row.timestamp_ms)
        .bind(row.is_highest_at_commit)
        .bind(row.ttl_expiry_epoch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_user_bids(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<UserBidRow>> {
        let rows: Vec<UserBidRowRaw> = sqlx::query_as(
            "SELECT b.bid_id, b.auction_id, a.title, a.image_url, b.amount, b.timestamp_ms, \
             a.status \
             FROM bid_history b JOIN auctions a ON a.auction_id = b.auction_id \
             WHERE b.user_id = $1 ORDER BY b.timestamp_ms DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|raw| {
                let status = raw
                    .status
                    .parse()
                    .map_err(|detail: String| AuctionError::Internal(detail))?;
                Ok(UserBidRow {
                    bid_id: raw.bid_id,
                    auction_id: raw.auction_id,
                    title: raw.title,
                    image_url: raw.image_url,
                    amount: raw.amount,
                    timestamp_ms: raw.timestamp_ms,
                    status,
                })
            })
            .collect()
    }
}

pub struct PgNotificationRepo {
    pool: PgPool,
}

impl PgNotificationRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepo for PgNotificationRepo {
    async fn is_claimed(&self, auction_id: Uuid, recipient_user_id: Uuid) -> Result<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT auction_id FROM settlement_notifications \
             WHERE auction_id = $1 AND recipient_user_id = $2",
        )
        .bind(auction_id)
        .bind(recipient_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn try_claim(&self, auction_id: Uuid, recipient_user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO settlement_notifications (auction_id, recipient_user_id) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(auction_id)
        .bind(recipient_user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
