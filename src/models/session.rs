//! Session and Chat Models
//!
//! A session is one authenticated realtime connection. Sessions live in
//! gateway process memory and are mirrored into the shared state store
//! with a TTL so any process can resolve `session_id -> identity`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Cross-process session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub connected_at_ms: i64,
    /// Room the session is currently joined to, if any.
    pub auction_id: Option<Uuid>,
}

impl SessionInfo {
    pub fn new(session_id: Uuid, user_id: Uuid, username: String, connected_at_ms: i64) -> Self {
        Self {
            session_id,
            user_id,
            username,
            connected_at_ms,
            auction_id: None,
        }
    }

    /// Flatten to the hash layout used by the state store mirror.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("user_id".to_string(), self.user_id.to_string()),
            ("username".to_string(), self.username.clone()),
            (
                "connected_at".to_string(),
                self.connected_at_ms.to_string(),
            ),
        ];
        if let Some(auction_id) = self.auction_id {
            fields.push(("auction_id".to_string(), auction_id.to_string()));
        }
        fields
    }

    pub fn from_fields(session_id: Uuid, fields: &HashMap<String, String>) -> Option<Self> {
        let user_id = fields.get("user_id")?.parse().ok()?;
        let username = fields.get("username")?.clone();
        Some(Self {
            session_id,
            user_id,
            username,
            connected_at_ms: fields
                .get("connected_at")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            auction_id: fields.get("auction_id").and_then(|raw| raw.parse().ok()),
        })
    }
}

/// Chat message as stored in the capped ring and published on the chat
/// channel. `sender_session_id` exists purely for echo suppression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub auction_id: Uuid,
    pub sender_session_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub message: String,
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_round_trips_through_hash_fields() {
        let mut info = SessionInfo::new(Uuid::new_v4(), Uuid::new_v4(), "alice".into(), 42);
        info.auction_id = Some(Uuid::new_v4());
        let fields: HashMap<_, _> = info.to_fields().into_iter().collect();
        let parsed = SessionInfo::from_fields(info.session_id, &fields).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn session_without_room_has_no_auction_binding() {
        let info = SessionInfo::new(Uuid::new_v4(), Uuid::new_v4(), "bob".into(), 42);
        let fields: HashMap<_, _> = info.to_fields().into_iter().collect();
        assert!(!fields.contains_key("auction_id"));
    }

    #[test]
    fn missing_identity_fields_mean_no_session() {
        let fields = HashMap::from([("username".to_string(), "ghost".to_string())]);
        assert!(SessionInfo::from_fields(Uuid::new_v4(), &fields).is_none());
    }
}
