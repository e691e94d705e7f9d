//! Gavel REST API Handlers
//!
//! HTTP surface over the auction core. Error kinds map to status codes
//! in one place (`error.rs`); handlers only speak the domain types.

pub mod auctions;
pub mod bids;

use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::AppContext;
use crate::auth::VerifiedUser;
use crate::error::{AuctionError, Result};

/// Extracts and verifies the bearer identity.
pub struct AuthUser(pub VerifiedUser);

#[async_trait]
impl FromRequestParts<AppContext> for AuthUser {
    type Rejection = AuctionError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> std::result::Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AuctionError::Unauthorized("Missing authentication token".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AuctionError::Unauthorized("Malformed authorization header".into()))?;
        Ok(AuthUser(ctx.verifier.verify(token)?))
    }
}

async fn health(State(ctx): State<AppContext>) -> Result<Json<serde_json::Value>> {
    Ok(Json(crate::app::health(&ctx).await?))
}

pub fn router(ctx: AppContext) -> Router {
    let origins: Vec<axum::http::HeaderValue> = ctx
        .settings
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route(
            "/auctions",
            post(auctions::create_auction).get(auctions::list_auctions),
        )
        .route("/auctions/batch", post(auctions::batch_auctions))
        .route("/auctions/:auction_id", get(auctions::get_auction))
        .route("/auctions/:auction_id/state", get(auctions::get_auction_state))
        .route("/auctions/:auction_id/close", post(auctions::close_auction))
        .route("/bids", post(bids::place_bid).get(bids::list_bids))
        .route("/ws", get(crate::gateway::socket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}
