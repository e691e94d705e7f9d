//! Event Payloads
//!
//! Messages carried on the shared state store's pub/sub channels and on
//! the durable settlement queue. Pub/sub payloads are hints: gateways
//! re-read authoritative state before fanning out.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::user::UserContact;

/// Messages on the per-auction events channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuctionEvent {
    Bid {
        auction_id: Uuid,
        user_id: Uuid,
        username: String,
        amount: Decimal,
        timestamp: i64,
        is_new_high: bool,
        anti_snipe_triggered: bool,
    },
    AuctionEnd {
        auction_id: Uuid,
        winner_id: Option<Uuid>,
        winner_username: Option<String>,
        winning_bid: Decimal,
        end_time: i64,
    },
}

/// Messages on the per-auction timer channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerEvent {
    TimerSync {
        auction_id: Uuid,
        server_time: i64,
        auction_end_time: i64,
        time_remaining_ms: i64,
        time_remaining_seconds: i64,
        sync_type: SyncType,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        auction_ended: bool,
    },
    AntiSnipe {
        auction_id: Uuid,
        new_end_time: i64,
        extended_by: i64,
        extension_count: u32,
        max_extensions: u32,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Heartbeat,
    Final,
}

impl TimerEvent {
    pub fn heartbeat(auction_id: Uuid, server_time: i64, end_time: i64) -> Self {
        let remaining = (end_time - server_time).max(0);
        Self::TimerSync {
            auction_id,
            server_time,
            auction_end_time: end_time,
            time_remaining_ms: remaining,
            time_remaining_seconds: remaining / 1000,
            sync_type: SyncType::Heartbeat,
            auction_ended: false,
        }
    }

    pub fn final_sync(auction_id: Uuid, server_time: i64) -> Self {
        Self::TimerSync {
            auction_id,
            server_time,
            auction_end_time: server_time,
            time_remaining_ms: 0,
            time_remaining_seconds: 0,
            sync_type: SyncType::Final,
            auction_ended: true,
        }
    }
}

/// Messages on the durable settlement queue. Delivery is at-least-once;
/// consumers dedup via deterministic keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementMessage {
    BidPersisted {
        bid_id: Uuid,
        auction_id: Uuid,
        user_id: Uuid,
        username: String,
        amount: Decimal,
        timestamp: i64,
        is_highest_at_commit: bool,
        ttl_expiry_epoch: i64,
    },
    AuctionClosed {
        auction_id: Uuid,
        title: String,
        final_price: Decimal,
        winner: Option<UserContact>,
        #[serde(default)]
        losers: Vec<UserContact>,
        timestamp: i64,
    },
}

impl SettlementMessage {
    /// FIFO group key where the transport supports one.
    pub fn group_key(&self) -> Uuid {
        match self {
            Self::BidPersisted { auction_id, .. } => *auction_id,
            Self::AuctionClosed { auction_id, .. } => *auction_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn bid_event_carries_snake_case_tag() {
        let event = AuctionEvent::Bid {
            auction_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            username: "alice".into(),
            amount: dec!(150.00),
            timestamp: 1_000,
            is_new_high: true,
            anti_snipe_triggered: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "bid");
        assert_eq!(json["is_new_high"], true);
    }

    #[test]
    fn heartbeat_computes_remaining_and_clamps() {
        let id = Uuid::new_v4();
        match TimerEvent::heartbeat(id, 5_000, 65_000) {
            TimerEvent::TimerSync {
                time_remaining_ms,
                time_remaining_seconds,
                sync_type,
                ..
            } => {
                assert_eq!(time_remaining_ms, 60_000);
                assert_eq!(time_remaining_seconds, 60);
                assert_eq!(sync_type, SyncType::Heartbeat);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match TimerEvent::heartbeat(id, 70_000, 65_000) {
            TimerEvent::TimerSync {
                time_remaining_ms, ..
            } => assert_eq!(time_remaining_ms, 0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn final_sync_flags_the_end() {
        let json = serde_json::to_value(TimerEvent::final_sync(Uuid::new_v4(), 9)).unwrap();
        assert_eq!(json["sync_type"], "final");
        assert_eq!(json["auction_ended"], true);
        assert_eq!(json["time_remaining_ms"], 0);
    }

    #[test]
    fn settlement_messages_round_trip() {
        let msg = SettlementMessage::AuctionClosed {
            auction_id: Uuid::new_v4(),
            title: "Vintage amp".into(),
            final_price: dec!(410.00),
            winner: None,
            losers: vec![],
            timestamp: 77,
        };
        let raw = serde_json::to_string(&msg).unwrap();
        let parsed: SettlementMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, msg);
    }
}
