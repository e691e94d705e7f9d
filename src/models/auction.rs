//! Auction Models
//!
//! Durable auction records and the hot per-auction live state held in
//! the shared state store while an auction is running.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

/// Durable auction record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auction {
    pub auction_id: Uuid,
    pub host_user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    /// Auction length in seconds, strictly positive.
    pub duration_seconds: i64,
    pub starting_bid: Decimal,
    pub status: AuctionStatus,
    pub seller_name: String,
    pub condition: Option<String>,
    pub image_url: Option<String>,
    pub gallery_urls: Vec<String>,
    pub stream_channel_id: Option<String>,
    pub stream_playback_url: Option<String>,
    pub winner_id: Option<Uuid>,
    pub winning_bid: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Live,
    Closed,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Closed => "closed",
        }
    }
}

impl std::str::FromStr for AuctionStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "live" => Ok(Self::Live),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown auction status: {other}")),
        }
    }
}

impl Auction {
    /// End instant implied by creation time and duration, in wall-clock
    /// milliseconds. Used only as the last fallback; the live state
    /// store owns the real (possibly extended) end time.
    pub fn scheduled_end_ms(&self) -> i64 {
        self.created_at.timestamp_millis() + self.duration_seconds * 1000
    }

    pub fn is_live(&self) -> bool {
        self.status == AuctionStatus::Live
    }
}

/// Hot per-auction state, one record per live auction.
///
/// Parsed from the shared state store's string-keyed hash; readers must
/// tolerate missing fields because TTL expiry and partial writes are
/// both legal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveState {
    pub status: AuctionStatus,
    pub host_user_id: Option<Uuid>,
    pub current_high_bid: Decimal,
    pub high_bidder_id: Option<Uuid>,
    pub high_bidder_username: Option<String>,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub last_bid_time_ms: Option<i64>,
    pub participant_count: u32,
    pub anti_snipe_count: u32,
    pub bid_count: u64,
}

impl LiveState {
    /// Seed state written at auction creation.
    pub fn seed(host_user_id: Uuid, starting_bid: Decimal, start_ms: i64, end_ms: i64) -> Self {
        Self {
            status: AuctionStatus::Live,
            host_user_id: Some(host_user_id),
            current_high_bid: starting_bid,
            high_bidder_id: None,
            high_bidder_username: None,
            start_time_ms: start_ms,
            end_time_ms: end_ms,
            last_bid_time_ms: None,
            participant_count: 0,
            anti_snipe_count: 0,
            bid_count: 0,
        }
    }

    pub fn time_remaining_ms(&self, now_ms: i64) -> i64 {
        (self.end_time_ms - now_ms).max(0)
    }

    /// Flatten to the hash layout used by the state store.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("status".to_string(), self.status.as_str().to_string()),
            (
                "current_high_bid".to_string(),
                self.current_high_bid.to_string(),
            ),
            ("start_time".to_string(), self.start_time_ms.to_string()),
            ("end_time".to_string(), self.end_time_ms.to_string()),
            (
                "participant_count".to_string(),
                self.participant_count.to_string(),
            ),
            (
                "anti_snipe_count".to_string(),
                self.anti_snipe_count.to_string(),
            ),
            ("bid_count".to_string(), self.bid_count.to_string()),
        ];
        if let Some(host) = self.host_user_id {
            fields.push(("host_user_id".to_string(), host.to_string()));
        }
        if let Some(bidder) = self.high_bidder_id {
            fields.push(("high_bidder_id".to_string(), bidder.to_string()));
        }
        if let Some(ref username) = self.high_bidder_username {
            fields.push(("high_bidder_username".to_string(), username.clone()));
        }
        if let Some(ts) = self.last_bid_time_ms {
            fields.push(("last_bid_time".to_string(), ts.to_string()));
        }
        fields
    }

    /// Parse from a hash read. Returns `None` for an empty hash (key
    /// expired or never written).
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let status = fields
            .get("status")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(AuctionStatus::Live);
        Some(Self {
            status,
            host_user_id: fields.get("host_user_id").and_then(|raw| raw.parse().ok()),
            current_high_bid: fields
                .get("current_high_bid")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(Decimal::ZERO),
            high_bidder_id: fields
                .get("high_bidder_id")
                .and_then(|raw| raw.parse().ok()),
            high_bidder_username: fields.get("high_bidder_username").cloned(),
            start_time_ms: parse_i64(fields, "start_time"),
            end_time_ms: parse_i64(fields, "end_time"),
            last_bid_time_ms: fields.get("last_bid_time").and_then(|raw| raw.parse().ok()),
            participant_count: parse_u64(fields, "participant_count") as u32,
            anti_snipe_count: parse_u64(fields, "anti_snipe_count") as u32,
            bid_count: parse_u64(fields, "bid_count"),
        })
    }
}

fn parse_i64(fields: &HashMap<String, String>, key: &str) -> i64 {
    fields
        .get(key)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

fn parse_u64(fields: &HashMap<String, String>, key: &str) -> u64 {
    fields
        .get(key)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Leaderboard entry: a bidder's best accepted amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopBid {
    pub user_id: Uuid,
    pub username: String,
    pub amount: Decimal,
}

/// Create auction request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAuctionRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    /// Auction length in seconds.
    #[validate(range(min = 1))]
    pub duration: i64,
    pub category: Option<String>,
    pub starting_bid: Decimal,
    #[validate(length(min = 1, max = 200))]
    pub seller_name: String,
    pub condition: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    pub stream_channel_id: Option<String>,
    pub stream_playback_url: Option<String>,
}

/// Auction record as served over HTTP: durable fields plus realtime
/// enrichment when the auction is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionRecord {
    pub auction_id: Uuid,
    pub host_user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub duration: i64,
    pub starting_bid: Decimal,
    pub status: AuctionStatus,
    pub seller_name: String,
    pub condition: Option<String>,
    pub image_url: Option<String>,
    pub gallery_urls: Vec<String>,
    pub stream_channel_id: Option<String>,
    pub stream_playback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub winner_id: Option<Uuid>,
    pub winner_username: Option<String>,
    pub winning_bid: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_high_bid: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_bidder_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_bidder_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_remaining_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_count: Option<u64>,
}

impl AuctionRecord {
    pub fn from_auction(auction: Auction) -> Self {
        Self {
            auction_id: auction.auction_id,
            host_user_id: auction.host_user_id,
            title: auction.title,
            description: auction.description,
            category: auction.category,
            duration: auction.duration_seconds,
            starting_bid: auction.starting_bid,
            status: auction.status,
            seller_name: auction.seller_name,
            condition: auction.condition,
            image_url: auction.image_url,
            gallery_urls: auction.gallery_urls,
            stream_channel_id: auction.stream_channel_id,
            stream_playback_url: auction.stream_playback_url,
            created_at: auction.created_at,
            ended_at: auction.ended_at,
            winner_id: auction.winner_id,
            winner_username: None,
            winning_bid: auction.winning_bid,
            current_high_bid: None,
            high_bidder_id: None,
            high_bidder_username: None,
            end_time_ms: None,
            time_remaining_seconds: None,
            participant_count: None,
            bid_count: None,
        }
    }
}

/// Realtime state projection served by `GET /auctions/{id}/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionStateView {
    pub auction_id: Uuid,
    pub status: AuctionStatus,
    pub current_high_bid: Decimal,
    pub high_bidder_id: Option<Uuid>,
    pub high_bidder_username: Option<String>,
    pub participant_count: u32,
    pub bid_count: u64,
    pub time_remaining_seconds: i64,
    pub top_bids: Vec<TopBid>,
    pub anti_snipe_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_fields() -> HashMap<String, String> {
        let seed = LiveState::seed(Uuid::new_v4(), dec!(50.00), 1_000, 61_000);
        seed.to_fields().into_iter().collect()
    }

    #[test]
    fn live_state_round_trips_through_hash_fields() {
        let host = Uuid::new_v4();
        let state = LiveState::seed(host, dec!(50.00), 1_000, 61_000);
        let fields: HashMap<_, _> = state.to_fields().into_iter().collect();
        let parsed = LiveState::from_fields(&fields).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn empty_hash_means_no_live_state() {
        assert!(LiveState::from_fields(&HashMap::new()).is_none());
    }

    #[test]
    fn readers_tolerate_missing_fields() {
        let mut fields = sample_fields();
        fields.remove("bid_count");
        fields.remove("high_bidder_id");
        let parsed = LiveState::from_fields(&fields).unwrap();
        assert_eq!(parsed.bid_count, 0);
        assert!(parsed.high_bidder_id.is_none());
    }

    #[test]
    fn time_remaining_clamps_at_zero() {
        let state = LiveState::seed(Uuid::new_v4(), dec!(1), 0, 10_000);
        assert_eq!(state.time_remaining_ms(4_000), 6_000);
        assert_eq!(state.time_remaining_ms(15_000), 0);
    }

    #[test]
    fn status_parses_both_ways() {
        assert_eq!("live".parse::<AuctionStatus>().unwrap(), AuctionStatus::Live);
        assert_eq!(AuctionStatus::Closed.as_str(), "closed");
        assert!("paused".parse::<AuctionStatus>().is_err());
    }
}
