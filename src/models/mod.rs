//! Gavel Data Models
//!
//! Domain records and wire payloads:
//! - Core: Auctions, Bids, Users
//! - Hot state: per-auction live state, leaderboard entries
//! - Realtime: sessions, chat, pub/sub event payloads
//! - Settlement: durable queue messages

pub mod auction;
pub mod bid;
pub mod events;
pub mod session;
pub mod user;

pub use auction::{
    Auction, AuctionRecord, AuctionStateView, AuctionStatus, CreateAuctionRequest, LiveState,
    TopBid,
};
pub use bid::{Bid, BidPlacement, BidStatus, PlaceBidRequest, UserBidSummary};
pub use events::{AuctionEvent, SettlementMessage, SyncType, TimerEvent};
pub use session::{ChatMessage, SessionInfo};
pub use user::{User, UserContact};

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Remaining seconds until `end_time_ms`, clamped at zero.
pub fn time_remaining_seconds(end_time_ms: i64, now_ms: i64) -> i64 {
    ((end_time_ms - now_ms).max(0)) / 1000
}
