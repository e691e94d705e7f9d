//! Identity provider boundary
//!
//! Inbound bearer tokens are verified against the shared signing key
//! and checked for issuer, audience, and expiry. The rest of the system
//! only sees `VerifiedUser`; token mechanics stay behind the
//! `TokenVerifier` trait so tests substitute a fake.

use hmac::{Hmac, Mac};
use jwt::VerifyWithKey;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::AuctionError;
use crate::models::now_ms;
use crate::settings::AuthSettings;

/// Claims we consume from the provider's token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "cognito:username")]
    pub username: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "phone_number")]
    pub phone: Option<String>,
}

/// Identity attached to a request or realtime session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub user_id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VerifiedUser, AuctionError>;
}

/// HMAC-SHA256 verifier over the configured shared key.
pub struct HsTokenVerifier {
    key: Hmac<Sha256>,
    issuer: String,
    audience: String,
}

impl HsTokenVerifier {
    pub fn new(settings: &AuthSettings) -> Result<Self, AuctionError> {
        let key = Hmac::new_from_slice(settings.token_secret.as_bytes())
            .map_err(|err| AuctionError::Internal(format!("bad signing key: {err}")))?;
        Ok(Self {
            key,
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
        })
    }
}

impl TokenVerifier for HsTokenVerifier {
    fn verify(&self, token: &str) -> Result<VerifiedUser, AuctionError> {
        if token.is_empty() {
            return Err(AuctionError::Unauthorized(
                "Missing authentication token".into(),
            ));
        }
        let claims: Claims = token
            .verify_with_key(&self.key)
            .map_err(|_| AuctionError::Unauthorized("Invalid or expired token".into()))?;

        if claims.exp * 1000 <= now_ms() {
            return Err(AuctionError::Unauthorized("Token has expired".into()));
        }
        if claims.iss != self.issuer {
            return Err(AuctionError::Unauthorized("Unrecognized token issuer".into()));
        }
        if claims.aud != self.audience {
            return Err(AuctionError::Unauthorized(
                "Token issued for another audience".into(),
            ));
        }

        let user_id: Uuid = claims
            .sub
            .parse()
            .map_err(|_| AuctionError::Unauthorized("Malformed subject claim".into()))?;
        let username = claims
            .username
            .clone()
            .or_else(|| claims.email.clone())
            .unwrap_or_else(|| user_id.to_string());

        Ok(VerifiedUser {
            user_id,
            username,
            email: claims.email,
            email_verified: claims.email_verified.unwrap_or(false),
            name: claims.name,
            phone: claims.phone,
        })
    }
}
