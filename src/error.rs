//! Error taxonomy
//!
//! One discriminated union at the domain boundary, mapped to HTTP status
//! codes exactly once. Realtime sessions receive a typed `error` frame
//! instead; they never see status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, AuctionError>;

#[derive(Debug, Error)]
pub enum AuctionError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Auction not found: {0}")]
    AuctionNotFound(Uuid),

    #[error("User not found: {0}")]
    UserNotFound(Uuid),

    #[error("Auction is closed: {0}")]
    AuctionClosed(Uuid),

    #[error("Invalid bid: {0}")]
    InvalidBid(String),

    #[error("Service temporarily unavailable: {0}")]
    Transient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuctionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidBid(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::AuctionNotFound(_) | Self::UserNotFound(_) => StatusCode::NOT_FOUND,
            Self::AuctionClosed(_) => StatusCode::CONFLICT,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show an end user. Internal faults are collapsed
    /// so they never leak connection strings or backtraces.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            Self::Transient(_) => "Service temporarily unavailable, please retry".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AuctionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

impl From<sqlx::Error> for AuctionError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Transient(format!("database unavailable: {err}"))
            }
            other => Self::Internal(format!("database error: {other}")),
        }
    }
}

impl From<redis::RedisError> for AuctionError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
            Self::Transient(format!("state store unavailable: {err}"))
        } else {
            Self::Internal(format!("state store error: {err}"))
        }
    }
}

impl From<serde_json::Error> for AuctionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {err}"))
    }
}
