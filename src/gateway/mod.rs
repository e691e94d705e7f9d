//! Realtime Gateway
//!
//! Long-lived client session mux. Authenticated sessions join auction
//! rooms, chat, and receive the fan-out of bus messages. Pub/sub
//! payloads are hints only: every `bid_update` broadcast re-reads the
//! authoritative state from the store.

pub mod protocol;
pub mod registry;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::VerifiedUser;
use crate::error::{AuctionError, Result};
use crate::models::{now_ms, AuctionEvent, ChatMessage, SessionInfo, TimerEvent};
use crate::settings::SessionSettings;
use crate::store::keys::Keys;
use crate::store::{BusMessage, ChannelKind, LiveStore};

pub use protocol::{AuctionSnapshot, ClientEvent, ServerEvent};
pub use registry::SessionRegistry;

const CHAT_RING_CAP: usize = 100;
const CHAT_SNAPSHOT_LIMIT: usize = 50;
const LEADERBOARD_LIMIT: usize = 3;

pub struct Gateway {
    registry: SessionRegistry,
    store: Arc<dyn LiveStore>,
    keys: Keys,
    settings: SessionSettings,
}

impl Gateway {
    pub fn new(store: Arc<dyn LiveStore>, keys: Keys, settings: SessionSettings) -> Self {
        Self {
            registry: SessionRegistry::new(),
            store,
            keys,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Create the session record, locally and in the store mirror, and
    /// confirm the connection to the client.
    pub async fn register_session(
        &self,
        user: &VerifiedUser,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<SessionInfo> {
        let info = SessionInfo::new(
            Uuid::new_v4(),
            user.user_id,
            user.username.clone(),
            now_ms(),
        );
        self.store
            .put_session(&info, Duration::from_secs(self.settings.ttl_seconds))
            .await
            .map_err(|err| AuctionError::Transient(err.to_string()))?;
        self.registry.insert(info.clone(), sender);
        self.registry.send_to(
            info.session_id,
            ServerEvent::Connected {
                user_id: user.user_id,
                username: user.username.clone(),
            },
        );
        info!(session_id = %info.session_id, user_id = %user.user_id, "session connected");
        Ok(info)
    }

    /// Join an auction room: membership, bindings, snapshot, announce.
    pub async fn join_auction(&self, session_id: Uuid, auction_id: Uuid) -> Result<()> {
        let session = self.resolve_session(session_id).await?;

        // 1. Room must exist in the hot store.
        let state = self
            .store
            .live_state(auction_id)
            .await
            .map_err(|err| AuctionError::Transient(err.to_string()))?;
        if state.is_none() {
            return Err(AuctionError::AuctionNotFound(auction_id));
        }

        // 2-3. Participant set and session bindings.
        let participant_count = self
            .store
            .add_participant(auction_id, session.user_id)
            .await
            .map_err(|err| AuctionError::Transient(err.to_string()))?;
        self.registry.set_room(session_id, Some(auction_id));
        if let Err(err) = self.store.bind_session(session_id, Some(auction_id)).await {
            warn!(%session_id, error = %err, "failed to mirror room binding");
        }

        // 4. Snapshot to the joining session.
        let snapshot = self.snapshot(auction_id, session.user_id).await?;
        self.registry
            .send_to(session_id, ServerEvent::JoinedAuction(snapshot));

        // 5. Announce to the rest of the room.
        self.registry.broadcast_room(
            auction_id,
            &ServerEvent::UserJoined {
                user_id: session.user_id,
                username: session.username.clone(),
                participant_count,
            },
            Some(session_id),
        );
        info!(%session_id, %auction_id, user = %session.username, "joined auction");
        Ok(())
    }

    /// Leave the room: inverse of join.
    pub async fn leave_auction(&self, session_id: Uuid, auction_id: Option<Uuid>) -> Result<()> {
        let session = self.resolve_session(session_id).await?;
        let Some(auction_id) = auction_id.or(session.auction_id) else {
            return Ok(());
        };

        let participant_count = self.cleanup_membership(&session, auction_id).await;
        self.registry.set_room(session_id, None);
        if let Err(err) = self.store.bind_session(session_id, None).await {
            warn!(%session_id, error = %err, "failed to clear mirrored room binding");
        }

        self.registry
            .send_to(session_id, ServerEvent::LeftAuction { auction_id });
        self.registry.broadcast_room(
            auction_id,
            &ServerEvent::UserLeft {
                user_id: session.user_id,
                username: session.username.clone(),
                participant_count,
            },
            None,
        );
        info!(%session_id, %auction_id, user = %session.username, "left auction");
        Ok(())
    }

    /// Abnormal or normal teardown: same cleanup as leave, then drop
    /// the session record everywhere.
    pub async fn disconnect(&self, session_id: Uuid) {
        let Some(info) = self.registry.remove(session_id) else {
            return;
        };
        if let Some(auction_id) = info.auction_id {
            let participant_count = self.cleanup_membership(&info, auction_id).await;
            self.registry.broadcast_room(
                auction_id,
                &ServerEvent::UserLeft {
                    user_id: info.user_id,
                    username: info.username.clone(),
                    participant_count,
                },
                None,
            );
        }
        if let Err(err) = self.store.remove_session(session_id).await {
            warn!(%session_id, error = %err, "failed to remove session mirror");
        }
        info!(%session_id, "session cleaned up");
    }

    /// Relay a chat message: identity comes from the session, never
    /// from the payload. Appends to the capped ring and publishes; the
    /// fan-out path delivers it (echo-suppressed) to the room.
    pub async fn chat(&self, session_id: Uuid, auction_id: Uuid, text: &str) -> Result<()> {
        let session = self.resolve_session(session_id).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(AuctionError::Validation("Message is empty".into()));
        }
        if text.chars().count() > self.settings.max_chat_message_chars {
            return Err(AuctionError::Validation(format!(
                "Message exceeds {} characters",
                self.settings.max_chat_message_chars
            )));
        }

        let message = ChatMessage {
            message_id: Uuid::new_v4(),
            auction_id,
            sender_session_id: session_id,
            user_id: session.user_id,
            username: session.username.clone(),
            message: text.to_string(),
            timestamp_ms: now_ms(),
        };
        self.store
            .append_chat(auction_id, &message, CHAT_RING_CAP)
            .await
            .map_err(|err| AuctionError::Transient(err.to_string()))?;
        let payload = serde_json::to_string(&message)?;
        self.store
            .publish(&self.keys.channel_chat(auction_id), &payload)
            .await
            .map_err(|err| AuctionError::Transient(err.to_string()))?;
        Ok(())
    }

    pub fn pong(&self, session_id: Uuid) {
        self.registry
            .send_to(session_id, ServerEvent::Pong { timestamp: now_ms() });
    }

    pub fn send_error(&self, session_id: Uuid, message: &str) {
        self.registry.send_to(
            session_id,
            ServerEvent::Error {
                message: message.to_string(),
            },
        );
    }

    /// Fresh room state for a joining (or rejoining) session.
    pub async fn snapshot(&self, auction_id: Uuid, user_id: Uuid) -> Result<AuctionSnapshot> {
        let state = self
            .store
            .live_state(auction_id)
            .await
            .map_err(|err| AuctionError::Transient(err.to_string()))?
            .ok_or(AuctionError::AuctionNotFound(auction_id))?;
        let top_bids = self
            .store
            .top_bids(auction_id, LEADERBOARD_LIMIT)
            .await
            .unwrap_or_default();
        let chat_messages = self
            .store
            .chat_history(auction_id, CHAT_SNAPSHOT_LIMIT)
            .await
            .unwrap_or_default();

        Ok(AuctionSnapshot {
            auction_id,
            status: state.status,
            current_high_bid: state.current_high_bid,
            high_bidder_id: state.high_bidder_id,
            you_are_winning: state.high_bidder_id == Some(user_id),
            high_bidder_username: state.high_bidder_username,
            participant_count: state.participant_count,
            bid_count: state.bid_count,
            top_bids,
            chat_messages,
        })
    }

    /// Consume bus messages until cancelled.
    pub async fn run_fanout(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<BusMessage>,
        cancel: CancellationToken,
    ) {
        info!("gateway fan-out started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    self.handle_bus_message(message).await;
                }
            }
        }
        info!("gateway fan-out stopped");
    }

    /// Route one bus message to the local sessions of its room.
    pub async fn handle_bus_message(&self, message: BusMessage) {
        let Some((auction_id, kind)) = self.keys.parse_channel(&message.channel) else {
            debug!(channel = %message.channel, "unroutable channel");
            return;
        };
        match kind {
            ChannelKind::Events => self.handle_event(auction_id, &message.payload).await,
            ChannelKind::Timer => self.handle_timer(auction_id, &message.payload),
            ChannelKind::Chat => self.handle_chat(auction_id, &message.payload),
        }
    }

    async fn handle_event(&self, auction_id: Uuid, payload: &str) {
        let event: AuctionEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(%auction_id, error = %err, "undecodable auction event");
                return;
            }
        };
        match event {
            AuctionEvent::Bid { .. } => {
                // The payload is a trigger; the numbers come from a
                // fresh read.
                let state = match self.store.live_state(auction_id).await {
                    Ok(Some(state)) => state,
                    Ok(None) => return,
                    Err(err) => {
                        warn!(%auction_id, error = %err, "state read failed on bid event");
                        return;
                    }
                };
                let top_bids = self
                    .store
                    .top_bids(auction_id, LEADERBOARD_LIMIT)
                    .await
                    .unwrap_or_default();
                self.registry.broadcast_room(
                    auction_id,
                    &ServerEvent::BidUpdate {
                        auction_id,
                        high_bid: state.current_high_bid,
                        high_bidder_username: state.high_bidder_username,
                        top_bids,
                        bid_count: state.bid_count,
                        participant_count: state.participant_count,
                    },
                    None,
                );
            }
            AuctionEvent::AuctionEnd {
                winner_id,
                winner_username,
                winning_bid,
                end_time,
                ..
            } => {
                self.registry.broadcast_room(
                    auction_id,
                    &ServerEvent::AuctionEnded {
                        auction_id,
                        winner_id,
                        winner_username,
                        winning_bid,
                        end_time,
                    },
                    None,
                );
            }
        }
    }

    fn handle_timer(&self, auction_id: Uuid, payload: &str) {
        match serde_json::from_str::<TimerEvent>(payload) {
            Ok(event) => {
                self.registry
                    .broadcast_room(auction_id, &ServerEvent::TimerUpdate(event), None);
            }
            Err(err) => warn!(%auction_id, error = %err, "undecodable timer event"),
        }
    }

    fn handle_chat(&self, auction_id: Uuid, payload: &str) {
        match serde_json::from_str::<ChatMessage>(payload) {
            Ok(message) => {
                // Echo suppression: the sender rendered optimistically.
                let skip = message.sender_session_id;
                self.registry.broadcast_room(
                    auction_id,
                    &ServerEvent::ChatMessage(message),
                    Some(skip),
                );
            }
            Err(err) => warn!(%auction_id, error = %err, "undecodable chat message"),
        }
    }

    async fn cleanup_membership(&self, session: &SessionInfo, auction_id: Uuid) -> u32 {
        match self
            .store
            .remove_participant(auction_id, session.user_id)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                warn!(%auction_id, error = %err, "participant removal failed");
                0
            }
        }
    }

    /// Local registry first, then the cross-process mirror.
    async fn resolve_session(&self, session_id: Uuid) -> Result<SessionInfo> {
        if let Some(info) = self.registry.info(session_id) {
            return Ok(info);
        }
        match self.store.session(session_id).await {
            Ok(Some(info)) => Ok(info),
            Ok(None) => Err(AuctionError::Unauthorized("Not authenticated".into())),
            Err(err) => Err(AuctionError::Transient(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LiveState;
    use crate::store::{BidAttempt, MemoryStore};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        gateway: Arc<Gateway>,
        store: MemoryStore,
        keys: Keys,
        auction_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let auction_id = Uuid::new_v4();
        let now = now_ms();
        let state = LiveState::seed(Uuid::new_v4(), dec!(100), now, now + 600_000);
        store
            .init_live_state(
                auction_id,
                &state,
                Duration::from_secs(4200),
                Duration::from_secs(600),
            )
            .await
            .unwrap();
        store.clear_published();
        let gateway = Arc::new(Gateway::new(
            Arc::new(store.clone()),
            Keys::default(),
            SessionSettings::default(),
        ));
        Fixture {
            gateway,
            store,
            keys: Keys::default(),
            auction_id,
        }
    }

    async fn connect(
        f: &Fixture,
        username: &str,
    ) -> (SessionInfo, UnboundedReceiver<ServerEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let user = VerifiedUser {
            user_id: Uuid::new_v4(),
            username: username.into(),
            email: None,
            email_verified: false,
            name: None,
            phone: None,
        };
        let info = f.gateway.register_session(&user, tx).await.unwrap();
        // Swallow the connected frame.
        match rx.recv().await.unwrap() {
            ServerEvent::Connected { user_id, .. } => assert_eq!(user_id, user.user_id),
            other => panic!("expected connected, got {other:?}"),
        }
        (info, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn join_sends_snapshot_and_announces_to_others() {
        let f = fixture().await;
        let (s1, mut rx1) = connect(&f, "alice").await;
        let (s2, mut rx2) = connect(&f, "bob").await;

        f.gateway.join_auction(s1.session_id, f.auction_id).await.unwrap();
        let events = drain(&mut rx1);
        match &events[0] {
            ServerEvent::JoinedAuction(snapshot) => {
                assert_eq!(snapshot.auction_id, f.auction_id);
                assert_eq!(snapshot.current_high_bid, dec!(100));
                assert_eq!(snapshot.participant_count, 1);
                assert!(!snapshot.you_are_winning);
                assert!(snapshot.chat_messages.is_empty());
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        f.gateway.join_auction(s2.session_id, f.auction_id).await.unwrap();
        // The joiner does not get its own user_joined.
        let s2_events = drain(&mut rx2);
        assert!(matches!(s2_events[0], ServerEvent::JoinedAuction(_)));
        assert_eq!(s2_events.len(), 1);
        // But the earlier session does.
        let s1_events = drain(&mut rx1);
        match &s1_events[0] {
            ServerEvent::UserJoined {
                username,
                participant_count,
                ..
            } => {
                assert_eq!(username, "bob");
                assert_eq!(*participant_count, 2);
            }
            other => panic!("expected user_joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_unknown_auction_is_not_found() {
        let f = fixture().await;
        let (s, _rx) = connect(&f, "alice").await;
        let err = f
            .gateway
            .join_auction(s.session_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AuctionError::AuctionNotFound(_)));
    }

    #[tokio::test]
    async fn snapshot_flags_the_current_high_bidder() {
        let f = fixture().await;
        let (winner, mut _rx1) = connect(&f, "winner").await;
        f.store
            .commit_bid(
                f.auction_id,
                &BidAttempt {
                    user_id: winner.user_id,
                    username: "winner".into(),
                    amount: dec!(150),
                    timestamp_ms: 1,
                },
            )
            .await
            .unwrap();

        let snapshot = f
            .gateway
            .snapshot(f.auction_id, winner.user_id)
            .await
            .unwrap();
        assert!(snapshot.you_are_winning);

        let other = f
            .gateway
            .snapshot(f.auction_id, Uuid::new_v4())
            .await
            .unwrap();
        assert!(!other.you_are_winning);
    }

    #[tokio::test]
    async fn leave_cleans_up_and_announces() {
        let f = fixture().await;
        let (s1, mut rx1) = connect(&f, "alice").await;
        let (s2, mut rx2) = connect(&f, "bob").await;
        f.gateway.join_auction(s1.session_id, f.auction_id).await.unwrap();
        f.gateway.join_auction(s2.session_id, f.auction_id).await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        f.gateway
            .leave_auction(s1.session_id, Some(f.auction_id))
            .await
            .unwrap();

        let s1_events = drain(&mut rx1);
        assert!(matches!(s1_events[0], ServerEvent::LeftAuction { .. }));
        let s2_events = drain(&mut rx2);
        match &s2_events[0] {
            ServerEvent::UserLeft {
                username,
                participant_count,
                ..
            } => {
                assert_eq!(username, "alice");
                assert_eq!(*participant_count, 1);
            }
            other => panic!("expected user_left, got {other:?}"),
        }

        let participants = f.store.participants(f.auction_id).await.unwrap();
        assert_eq!(participants, vec![s2.user_id]);
    }

    #[tokio::test]
    async fn disconnect_runs_the_same_cleanup() {
        let f = fixture().await;
        let (s1, _rx1) = connect(&f, "alice").await;
        let (s2, mut rx2) = connect(&f, "bob").await;
        f.gateway.join_auction(s1.session_id, f.auction_id).await.unwrap();
        f.gateway.join_auction(s2.session_id, f.auction_id).await.unwrap();
        drain(&mut rx2);

        f.gateway.disconnect(s1.session_id).await;

        let s2_events = drain(&mut rx2);
        assert!(matches!(s2_events[0], ServerEvent::UserLeft { .. }));
        assert!(f.store.session(s1.session_id).await.unwrap().is_none());
        let participants = f.store.participants(f.auction_id).await.unwrap();
        assert_eq!(participants, vec![s2.user_id]);
    }

    #[tokio::test]
    async fn chat_appends_publishes_and_suppresses_echo() {
        let f = fixture().await;
        let (s1, mut rx1) = connect(&f, "alice").await;
        let (s2, mut rx2) = connect(&f, "bob").await;
        f.gateway.join_auction(s1.session_id, f.auction_id).await.unwrap();
        f.gateway.join_auction(s2.session_id, f.auction_id).await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);
        f.store.clear_published();

        f.gateway.chat(s1.session_id, f.auction_id, "hi").await.unwrap();

        // Stored in the ring and published on the chat channel.
        let history = f.store.chat_history(f.auction_id, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "hi");
        let published = f.store.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].0.ends_with(":chat"));

        // Simulate the bus loop delivering the published message.
        f.gateway
            .handle_bus_message(BusMessage {
                channel: published[0].0.clone(),
                payload: published[0].1.clone(),
            })
            .await;

        // Sender sees nothing; the other session gets the message.
        assert!(drain(&mut rx1).is_empty());
        let s2_events = drain(&mut rx2);
        match &s2_events[0] {
            ServerEvent::ChatMessage(message) => {
                assert_eq!(message.message, "hi");
                assert_eq!(message.user_id, s1.user_id);
                assert_eq!(message.sender_session_id, s1.session_id);
            }
            other => panic!("expected chat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_rejects_empty_and_oversized_messages() {
        let f = fixture().await;
        let (s, _rx) = connect(&f, "alice").await;
        f.gateway.join_auction(s.session_id, f.auction_id).await.unwrap();

        assert!(matches!(
            f.gateway.chat(s.session_id, f.auction_id, "   ").await,
            Err(AuctionError::Validation(_))
        ));
        let oversized = "x".repeat(501);
        assert!(matches!(
            f.gateway.chat(s.session_id, f.auction_id, &oversized).await,
            Err(AuctionError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn bid_events_fan_out_fresh_state_to_the_whole_room() {
        let f = fixture().await;
        let (s1, mut rx1) = connect(&f, "alice").await;
        let (s2, mut rx2) = connect(&f, "bob").await;
        f.gateway.join_auction(s1.session_id, f.auction_id).await.unwrap();
        f.gateway.join_auction(s2.session_id, f.auction_id).await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        // Bob's bid commits, then the bus hint arrives.
        f.store
            .commit_bid(
                f.auction_id,
                &BidAttempt {
                    user_id: s2.user_id,
                    username: "bob".into(),
                    amount: dec!(200),
                    timestamp_ms: 1,
                },
            )
            .await
            .unwrap();
        let hint = AuctionEvent::Bid {
            auction_id: f.auction_id,
            user_id: s2.user_id,
            username: "bob".into(),
            // Stale amount on purpose: the broadcast must re-read.
            amount: dec!(150),
            timestamp: 1,
            is_new_high: true,
            anti_snipe_triggered: false,
        };
        f.gateway
            .handle_bus_message(BusMessage {
                channel: f.keys.channel_events(f.auction_id),
                payload: serde_json::to_string(&hint).unwrap(),
            })
            .await;

        // Both sessions receive it, including the bidder's own.
        for rx in [&mut rx1, &mut rx2] {
            let events = drain(rx);
            match &events[0] {
                ServerEvent::BidUpdate {
                    high_bid,
                    high_bidder_username,
                    bid_count,
                    ..
                } => {
                    assert_eq!(*high_bid, dec!(200));
                    assert_eq!(high_bidder_username.as_deref(), Some("bob"));
                    assert_eq!(*bid_count, 1);
                }
                other => panic!("expected bid_update, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn timer_and_end_events_reach_the_room() {
        let f = fixture().await;
        let (s, mut rx) = connect(&f, "alice").await;
        f.gateway.join_auction(s.session_id, f.auction_id).await.unwrap();
        drain(&mut rx);

        let heartbeat = TimerEvent::heartbeat(f.auction_id, 1_000, 31_000);
        f.gateway
            .handle_bus_message(BusMessage {
                channel: f.keys.channel_timer(f.auction_id),
                payload: serde_json::to_string(&heartbeat).unwrap(),
            })
            .await;

        let end = AuctionEvent::AuctionEnd {
            auction_id: f.auction_id,
            winner_id: Some(s.user_id),
            winner_username: Some("alice".into()),
            winning_bid: dec!(200),
            end_time: 2_000,
        };
        f.gateway
            .handle_bus_message(BusMessage {
                channel: f.keys.channel_events(f.auction_id),
                payload: serde_json::to_string(&end).unwrap(),
            })
            .await;

        let events = drain(&mut rx);
        assert!(matches!(events[0], ServerEvent::TimerUpdate(_)));
        match &events[1] {
            ServerEvent::AuctionEnded {
                winner_username, ..
            } => assert_eq!(winner_username.as_deref(), Some("alice")),
            other => panic!("expected auction_ended, got {other:?}"),
        }
    }
}
