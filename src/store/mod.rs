//! Shared State Store
//!
//! The per-auction hot state: state hash, bounded leaderboard,
//! participant set, capped chat ring, TTL'd end-time and active keys,
//! the session mirror, and the pub/sub bus. All mutators in the system
//! go through this contract; per-auction serialization comes from the
//! store's atomic scripted primitives, never from in-process locks.

pub mod keys;
pub mod memory;
pub mod pubsub;
pub mod redis;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ChatMessage, LiveState, SessionInfo, TopBid};

pub use memory::MemoryStore;
pub use pubsub::{BusMessage, ChannelKind, PubSubListener};
pub use redis::RedisStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state store error: {0}")]
    Backend(String),
    #[error("corrupt state for key {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// One bid admission attempt, as fed to the atomic commit primitive.
#[derive(Debug, Clone)]
pub struct BidAttempt {
    pub user_id: Uuid,
    pub username: String,
    pub amount: Decimal,
    pub timestamp_ms: i64,
}

/// Result of the atomic compare-and-commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The attempt became the new high bid.
    Accepted,
    /// A concurrent commit kept or took a higher amount; `current_high`
    /// is a fresh read taken after the attempt.
    Outbid { current_high: Decimal },
}

/// Result of the atomic anti-snipe extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended {
        new_end_time_ms: i64,
        extension_count: u32,
    },
    /// Extension cap already reached; end time untouched.
    CapReached { extension_count: u32 },
}

/// Contract of the shared state store (C1).
///
/// Implementations must make `commit_bid` and `extend_end_time`
/// linearizable against every other operation on the same auction.
#[async_trait]
pub trait LiveStore: Send + Sync {
    // -- live state hash --

    /// Write the seed state for a newly created auction and arm the
    /// end-time / active keys.
    async fn init_live_state(
        &self,
        auction_id: Uuid,
        state: &LiveState,
        state_ttl: Duration,
        active_ttl: Duration,
    ) -> StoreResult<()>;

    async fn live_state(&self, auction_id: Uuid) -> StoreResult<Option<LiveState>>;

    async fn set_state_field(&self, auction_id: Uuid, field: &str, value: &str)
        -> StoreResult<()>;

    // -- atomic primitives --

    /// Atomic "is greater than current high -> commit" over the state
    /// hash. The only write path for `current_high_bid` and
    /// `bid_count`.
    async fn commit_bid(&self, auction_id: Uuid, attempt: &BidAttempt)
        -> StoreResult<CommitOutcome>;

    /// Atomic anti-snipe extension: increments `anti_snipe_count` and
    /// pushes `end_time` forward unless the cap is reached. End time is
    /// never moved backwards.
    async fn extend_end_time(
        &self,
        auction_id: Uuid,
        extension_ms: i64,
        max_extensions: u32,
    ) -> StoreResult<ExtendOutcome>;

    // -- end-time / active keys --

    async fn end_time_ms(&self, auction_id: Uuid) -> StoreResult<Option<i64>>;

    async fn set_end_time(
        &self,
        auction_id: Uuid,
        end_time_ms: i64,
        ttl: Duration,
    ) -> StoreResult<()>;

    async fn clear_active_flag(&self, auction_id: Uuid) -> StoreResult<()>;

    // -- leaderboard --

    /// Upsert a bidder's best amount and trim the board to `cap`
    /// entries. Ties on amount keep the earliest commit first.
    async fn record_top_bid(
        &self,
        auction_id: Uuid,
        user_id: Uuid,
        username: &str,
        amount: Decimal,
        timestamp_ms: i64,
        cap: usize,
    ) -> StoreResult<()>;

    async fn top_bids(&self, auction_id: Uuid, limit: usize) -> StoreResult<Vec<TopBid>>;

    // -- participants --

    /// Add to the participant set; returns the new cardinality, which
    /// is also written back to `participant_count`.
    async fn add_participant(&self, auction_id: Uuid, user_id: Uuid) -> StoreResult<u32>;

    async fn remove_participant(&self, auction_id: Uuid, user_id: Uuid) -> StoreResult<u32>;

    async fn participants(&self, auction_id: Uuid) -> StoreResult<Vec<Uuid>>;

    // -- chat ring --

    async fn append_chat(
        &self,
        auction_id: Uuid,
        message: &ChatMessage,
        cap: usize,
    ) -> StoreResult<()>;

    /// Most recent `limit` messages, oldest first.
    async fn chat_history(&self, auction_id: Uuid, limit: usize) -> StoreResult<Vec<ChatMessage>>;

    // -- session mirror --

    async fn put_session(&self, session: &SessionInfo, ttl: Duration) -> StoreResult<()>;

    async fn session(&self, session_id: Uuid) -> StoreResult<Option<SessionInfo>>;

    /// Bind or unbind the session's room membership in the mirror.
    async fn bind_session(&self, session_id: Uuid, auction_id: Option<Uuid>) -> StoreResult<()>;

    async fn remove_session(&self, session_id: Uuid) -> StoreResult<()>;

    // -- bus --

    /// Fire-and-forget publish. At-most-once; subscribers resync from
    /// reads, so a lost message is a delayed update, not corruption.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    // -- health --

    async fn ping(&self) -> StoreResult<()>;
}
