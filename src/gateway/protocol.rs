//! Realtime wire protocol
//!
//! Framed JSON events, `{"event": ..., "data": ...}` both directions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AuctionStatus, ChatMessage, TimerEvent, TopBid};

/// Client -> server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinAuction {
        auction_id: Uuid,
    },
    LeaveAuction {
        #[serde(default)]
        auction_id: Option<Uuid>,
    },
    ChatMessage {
        auction_id: Uuid,
        message: String,
    },
    Ping,
}

/// Server -> client frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        user_id: Uuid,
        username: String,
    },
    JoinedAuction(AuctionSnapshot),
    LeftAuction {
        auction_id: Uuid,
    },
    UserJoined {
        user_id: Uuid,
        username: String,
        participant_count: u32,
    },
    UserLeft {
        user_id: Uuid,
        username: String,
        participant_count: u32,
    },
    BidUpdate {
        auction_id: Uuid,
        high_bid: Decimal,
        high_bidder_username: Option<String>,
        top_bids: Vec<TopBid>,
        bid_count: u64,
        participant_count: u32,
    },
    TimerUpdate(TimerEvent),
    AuctionEnded {
        auction_id: Uuid,
        winner_id: Option<Uuid>,
        winner_username: Option<String>,
        winning_bid: Decimal,
        end_time: i64,
    },
    ChatMessage(ChatMessage),
    Pong {
        timestamp: i64,
    },
    Error {
        message: String,
    },
}

/// Room state handed to a session on join. Field-for-field a fresh
/// read from the state store at join time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuctionSnapshot {
    pub auction_id: Uuid,
    pub status: AuctionStatus,
    pub current_high_bid: Decimal,
    pub high_bidder_id: Option<Uuid>,
    pub high_bidder_username: Option<String>,
    pub participant_count: u32,
    pub bid_count: u64,
    pub top_bids: Vec<TopBid>,
    pub you_are_winning: bool,
    pub chat_messages: Vec<ChatMessage>,
}
