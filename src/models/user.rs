//! User Models
//!
//! Durable users mirrored from the external identity provider. The
//! user id IS the provider's subject claim; the sync path keeps the
//! (user_id, email) bijection intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable user record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub username: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

/// Settlement-facing contact card for a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContact {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub name: Option<String>,
    pub username: Option<String>,
}

impl From<&User> for UserContact {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.user_id,
            email: Some(user.email.clone()),
            name: user.name.clone(),
            username: Some(user.username.clone()),
        }
    }
}

impl UserContact {
    /// Minimal card when the durable row is missing; settlement still
    /// records the outcome even if we cannot address the recipient.
    pub fn bare(user_id: Uuid) -> Self {
        Self {
            user_id,
            email: None,
            name: None,
            username: None,
        }
    }
}
