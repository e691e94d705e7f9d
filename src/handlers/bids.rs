//! Bid API Handlers

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app::AppContext;
use crate::error::Result;
use crate::handlers::AuthUser;
use crate::models::{BidPlacement, PlaceBidRequest, UserBidSummary};

#[derive(Debug, Deserialize)]
pub struct BidListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BidListResponse {
    pub bids: Vec<UserBidSummary>,
}

/// `POST /bids`
///
/// Success covers both admitted and outbid attempts; the body's
/// `status` field discriminates. Rejections (closed, host, invalid
/// amount) surface as error kinds.
pub async fn place_bid(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Json(request): Json<PlaceBidRequest>,
) -> Result<Json<BidPlacement>> {
    // Keep the durable mirror fresh; the settlement path addresses
    // recipients from it.
    let synced = ctx.directory.sync(&user).await?;
    let placement = ctx
        .bid_engine
        .place_bid(
            request.auction_id,
            user.user_id,
            &synced.username,
            request.amount,
        )
        .await?;
    Ok(Json(placement))
}

/// `GET /bids` — the caller's bid history joined with current state.
pub async fn list_bids(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Query(query): Query<BidListQuery>,
) -> Result<Json<BidListResponse>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);
    let bids = ctx
        .auctions
        .list_user_bids(user.user_id, limit, offset)
        .await?;
    Ok(Json(BidListResponse { bids }))
}
