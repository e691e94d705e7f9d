//! Bid Models
//!
//! Append-only bid history records and the bid admission wire types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Durable bid record, append-only. Never mutated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub bid_id: Uuid,
    pub auction_id: Uuid,
    pub user_id: Uuid,
    pub username_snapshot: String,
    pub amount: Decimal,
    pub timestamp_ms: i64,
    pub is_highest_at_commit: bool,
}

/// Place bid request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PlaceBidRequest {
    pub auction_id: Uuid,
    pub amount: Decimal,
}

/// Outcome of a bid admission attempt. `Outbid` is not an error: the
/// request was well-formed, the amount just lost the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Success,
    Outbid,
}

/// Bid admission result as returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidPlacement {
    pub status: BidStatus,
    pub is_highest: bool,
    pub current_high_bid: Decimal,
    pub your_bid: Decimal,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_snipe_triggered: Option<bool>,
}

impl BidPlacement {
    pub fn accepted(amount: Decimal, anti_snipe_triggered: bool) -> Self {
        Self {
            status: BidStatus::Success,
            is_highest: true,
            current_high_bid: amount,
            your_bid: amount,
            message: "Bid placed successfully".to_string(),
            anti_snipe_triggered: Some(anti_snipe_triggered),
        }
    }

    pub fn outbid(amount: Decimal, current_high: Decimal) -> Self {
        Self {
            status: BidStatus::Outbid,
            is_highest: false,
            current_high_bid: current_high,
            your_bid: amount,
            message: "Your bid was outbid".to_string(),
            anti_snipe_triggered: None,
        }
    }
}

/// One row of the caller's "my bids" overview: persisted bid joined
/// with whatever the auction looks like now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBidSummary {
    pub bid_id: Uuid,
    pub auction_id: Uuid,
    pub title: String,
    pub image_url: Option<String>,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub status: crate::models::auction::AuctionStatus,
    pub current_high_bid: Decimal,
    pub time_remaining_seconds: i64,
    pub participant_count: u32,
}

/// Validate a money amount: positive, at most two fractional digits.
pub fn validate_money(amount: Decimal) -> Result<(), String> {
    if amount <= Decimal::ZERO {
        return Err("amount must be positive".to_string());
    }
    if amount.scale() > 2 {
        return Err("amount must have at most 2 decimal places".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn money_validation_accepts_two_decimal_places() {
        assert!(validate_money(dec!(101.25)).is_ok());
        assert!(validate_money(dec!(101)).is_ok());
    }

    #[test]
    fn money_validation_rejects_sub_cent_precision() {
        assert!(validate_money(dec!(101.251)).is_err());
    }

    #[test]
    fn money_validation_rejects_non_positive() {
        assert!(validate_money(dec!(0)).is_err());
        assert!(validate_money(dec!(-5)).is_err());
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_value(BidStatus::Outbid).unwrap();
        assert_eq!(json, serde_json::json!("outbid"));
    }

    #[test]
    fn accepted_placement_reports_the_new_high() {
        let placement = BidPlacement::accepted(dec!(150.00), true);
        assert_eq!(placement.status, BidStatus::Success);
        assert!(placement.is_highest);
        assert_eq!(placement.current_high_bid, dec!(150.00));
        assert_eq!(placement.anti_snipe_triggered, Some(true));
    }
}
