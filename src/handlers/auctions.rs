//! Auction API Handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppContext;
use crate::db::AuctionListFilter;
use crate::error::{AuctionError, Result};
use crate::handlers::AuthUser;
use crate::models::{AuctionRecord, AuctionStateView, AuctionStatus, CreateAuctionRequest};

#[derive(Debug, Deserialize)]
pub struct AuctionQuery {
    pub status: Option<String>,
    pub category: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuctionQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(20).clamp(1, 100)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    fn status(&self) -> Result<Option<AuctionStatus>> {
        match self.status.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|detail: String| AuctionError::Validation(detail)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuctionListResponse {
    pub auctions: Vec<AuctionRecord>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub auction_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub auctions: Vec<AuctionRecord>,
}

#[derive(Debug, Serialize)]
pub struct CloseResponse {
    pub auction_id: Uuid,
    pub status: AuctionStatus,
    pub winner_id: Option<Uuid>,
    pub winning_bid: Option<rust_decimal::Decimal>,
}

/// `POST /auctions`
pub async fn create_auction(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Json(request): Json<CreateAuctionRequest>,
) -> Result<(StatusCode, Json<AuctionRecord>)> {
    // Durable row for the host must exist before the FK reference.
    ctx.directory.sync(&user).await?;
    let record = ctx.auctions.create(&user, request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `GET /auctions`
pub async fn list_auctions(
    State(ctx): State<AppContext>,
    Query(query): Query<AuctionQuery>,
) -> Result<Json<AuctionListResponse>> {
    let filter = AuctionListFilter {
        status: query.status()?,
        category: query.category.clone(),
        limit: query.limit(),
        offset: query.offset(),
    };
    let auctions = ctx.auctions.list(&filter).await?;
    Ok(Json(AuctionListResponse {
        auctions,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

/// `GET /auctions/{id}`
pub async fn get_auction(
    State(ctx): State<AppContext>,
    Path(auction_id): Path<Uuid>,
) -> Result<Json<AuctionRecord>> {
    Ok(Json(ctx.auctions.get(auction_id).await?))
}

/// `POST /auctions/batch` — response preserves request order.
pub async fn batch_auctions(
    State(ctx): State<AppContext>,
    AuthUser(_user): AuthUser,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>> {
    if request.auction_ids.is_empty() {
        return Err(AuctionError::Validation("auction_ids is empty".into()));
    }
    if request.auction_ids.len() > 100 {
        return Err(AuctionError::Validation(
            "auction_ids exceeds the batch limit of 100".into(),
        ));
    }
    let auctions = ctx.auctions.batch(&request.auction_ids).await?;
    Ok(Json(BatchResponse { auctions }))
}

/// `GET /auctions/{id}/state`
pub async fn get_auction_state(
    State(ctx): State<AppContext>,
    Path(auction_id): Path<Uuid>,
) -> Result<Json<AuctionStateView>> {
    Ok(Json(ctx.auctions.state_view(auction_id).await?))
}

/// `POST /auctions/{id}/close` — host only.
pub async fn close_auction(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Path(auction_id): Path<Uuid>,
) -> Result<Json<CloseResponse>> {
    let outcome = ctx.auctions.close_manual(auction_id, user.user_id).await?;
    Ok(Json(CloseResponse {
        auction_id: outcome.auction_id,
        status: AuctionStatus::Closed,
        winner_id: outcome.winner_id,
        winning_bid: outcome.winning_bid,
    }))
}
