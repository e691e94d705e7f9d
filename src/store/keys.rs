//! Key and channel naming
//!
//! Human-readable namespaces, one auction per family:
//! `auction:{id}:state`, `auction:{id}:end_time`, `auction:{id}:active`,
//! `auction:{id}:top_bids`, `auction:{id}:users`,
//! `auction:{id}:chat_history`, `connection:{sid}`, and the pub/sub
//! channels `auction:{id}:events|timer|chat`.

use uuid::Uuid;

/// Key builder bound to the configured prefixes.
#[derive(Debug, Clone)]
pub struct Keys {
    auction_prefix: String,
    connection_prefix: String,
}

impl Keys {
    pub fn new(auction_prefix: impl Into<String>, connection_prefix: impl Into<String>) -> Self {
        Self {
            auction_prefix: auction_prefix.into(),
            connection_prefix: connection_prefix.into(),
        }
    }

    pub fn state(&self, auction_id: Uuid) -> String {
        format!("{}:{}:state", self.auction_prefix, auction_id)
    }

    pub fn end_time(&self, auction_id: Uuid) -> String {
        format!("{}:{}:end_time", self.auction_prefix, auction_id)
    }

    pub fn active(&self, auction_id: Uuid) -> String {
        format!("{}:{}:active", self.auction_prefix, auction_id)
    }

    pub fn top_bids(&self, auction_id: Uuid) -> String {
        format!("{}:{}:top_bids", self.auction_prefix, auction_id)
    }

    /// Commit timestamps for leaderboard members; secondary sort key.
    pub fn top_bid_times(&self, auction_id: Uuid) -> String {
        format!("{}:{}:top_bid_times", self.auction_prefix, auction_id)
    }

    pub fn users(&self, auction_id: Uuid) -> String {
        format!("{}:{}:users", self.auction_prefix, auction_id)
    }

    pub fn chat_history(&self, auction_id: Uuid) -> String {
        format!("{}:{}:chat_history", self.auction_prefix, auction_id)
    }

    pub fn connection(&self, session_id: Uuid) -> String {
        format!("{}:{}", self.connection_prefix, session_id)
    }

    pub fn channel_events(&self, auction_id: Uuid) -> String {
        format!("{}:{}:events", self.auction_prefix, auction_id)
    }

    pub fn channel_timer(&self, auction_id: Uuid) -> String {
        format!("{}:{}:timer", self.auction_prefix, auction_id)
    }

    pub fn channel_chat(&self, auction_id: Uuid) -> String {
        format!("{}:{}:chat", self.auction_prefix, auction_id)
    }

    /// Patterns for the gateway's single pattern subscription.
    pub fn channel_patterns(&self) -> [String; 3] {
        [
            format!("{}:*:events", self.auction_prefix),
            format!("{}:*:timer", self.auction_prefix),
            format!("{}:*:chat", self.auction_prefix),
        ]
    }

    /// Recover `(auction_id, kind)` from a channel name.
    pub fn parse_channel(&self, channel: &str) -> Option<(Uuid, super::ChannelKind)> {
        let rest = channel.strip_prefix(&self.auction_prefix)?.strip_prefix(':')?;
        let (id_part, kind_part) = rest.split_once(':')?;
        let auction_id = id_part.parse().ok()?;
        let kind = match kind_part {
            "events" => super::ChannelKind::Events,
            "timer" => super::ChannelKind::Timer,
            "chat" => super::ChannelKind::Chat,
            _ => return None,
        };
        Some((auction_id, kind))
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("auction", "connection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChannelKind;

    #[test]
    fn keys_use_the_configured_prefix() {
        let keys = Keys::new("auction", "connection");
        let id = Uuid::nil();
        assert_eq!(
            keys.state(id),
            "auction:00000000-0000-0000-0000-000000000000:state"
        );
        assert_eq!(
            keys.connection(id),
            "connection:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn channel_parse_inverts_channel_build() {
        let keys = Keys::default();
        let id = Uuid::new_v4();
        for (channel, kind) in [
            (keys.channel_events(id), ChannelKind::Events),
            (keys.channel_timer(id), ChannelKind::Timer),
            (keys.channel_chat(id), ChannelKind::Chat),
        ] {
            assert_eq!(keys.parse_channel(&channel), Some((id, kind)));
        }
    }

    #[test]
    fn unknown_channels_do_not_parse() {
        let keys = Keys::default();
        assert!(keys.parse_channel("auction:not-a-uuid:events").is_none());
        assert!(keys
            .parse_channel(&format!("auction:{}:metrics", Uuid::new_v4()))
            .is_none());
        assert!(keys.parse_channel("other:whatever").is_none());
    }
}
