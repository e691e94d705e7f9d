//! In-memory Shared State Store
//!
//! Same contract as the Redis store, backed by a single mutex, which
//! trivially gives the linearizability the contract demands. Used by
//! tests and local development without a Redis at hand.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{ChatMessage, LiveState, SessionInfo, TopBid};
use crate::store::{
    BidAttempt, CommitOutcome, ExtendOutcome, LiveStore, StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct Room {
    fields: HashMap<String, String>,
    /// member -> (amount, first commit at this amount)
    leaderboard: HashMap<String, (Decimal, i64)>,
    participants: HashSet<Uuid>,
    chat: VecDeque<ChatMessage>,
    end_time_ms: Option<i64>,
    active: bool,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<Uuid, Room>,
    sessions: HashMap<Uuid, SessionInfo>,
    published: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    /// When set, every publish also fails. Lets tests exercise the
    /// "post-commit failures are swallowed" paths.
    fail_publishes: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.inner.lock().published.clone()
    }

    pub fn clear_published(&self) {
        self.inner.lock().published.clear();
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        *self.fail_publishes.lock() = fail;
    }

    /// Drop an auction's room outright, simulating TTL expiry.
    pub fn expire_auction(&self, auction_id: Uuid) {
        self.inner.lock().rooms.remove(&auction_id);
    }

    /// Drop only the dedicated end-time key, simulating its TTL firing
    /// ahead of the state hash.
    pub fn expire_end_time_key(&self, auction_id: Uuid) {
        if let Some(room) = self.inner.lock().rooms.get_mut(&auction_id) {
            room.end_time_ms = None;
        }
    }

    fn with_room<T>(&self, auction_id: Uuid, f: impl FnOnce(&mut Room) -> T) -> T {
        let mut inner = self.inner.lock();
        let room = inner.rooms.entry(auction_id).or_default();
        f(room)
    }
}

#[async_trait]
impl LiveStore for MemoryStore {
    async fn init_live_state(
        &self,
        auction_id: Uuid,
        state: &LiveState,
        _state_ttl: Duration,
        _active_ttl: Duration,
    ) -> StoreResult<()> {
        self.with_room(auction_id, |room| {
            room.fields = state.to_fields().into_iter().collect();
            room.end_time_ms = Some(state.end_time_ms);
            room.active = true;
        });
        Ok(())
    }

    async fn live_state(&self, auction_id: Uuid) -> StoreResult<Option<LiveState>> {
        let inner = self.inner.lock();
        Ok(inner
            .rooms
            .get(&auction_id)
            .and_then(|room| LiveState::from_fields(&room.fields)))
    }

    async fn set_state_field(
        &self,
        auction_id: Uuid,
        field: &str,
        value: &str,
    ) -> StoreResult<()> {
        self.with_room(auction_id, |room| {
            room.fields.insert(field.to_string(), value.to_string());
        });
        Ok(())
    }

    async fn commit_bid(
        &self,
        auction_id: Uuid,
        attempt: &BidAttempt,
    ) -> StoreResult<CommitOutcome> {
        self.with_room(auction_id, |room| {
            let current: Decimal = room
                .fields
                .get("current_high_bid")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(Decimal::ZERO);
            if attempt.amount > current {
                room.fields
                    .insert("current_high_bid".into(), attempt.amount.to_string());
                room.fields
                    .insert("high_bidder_id".into(), attempt.user_id.to_string());
                room.fields
                    .insert("high_bidder_username".into(), attempt.username.clone());
                room.fields
                    .insert("last_bid_time".into(), attempt.timestamp_ms.to_string());
                let count: u64 = room
                    .fields
                    .get("bid_count")
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0);
                room.fields.insert("bid_count".into(), (count + 1).to_string());
                Ok(CommitOutcome::Accepted)
            } else {
                Ok(CommitOutcome::Outbid {
                    current_high: current,
                })
            }
        })
    }

    async fn extend_end_time(
        &self,
        auction_id: Uuid,
        extension_ms: i64,
        max_extensions: u32,
    ) -> StoreResult<ExtendOutcome> {
        self.with_room(auction_id, |room| {
            let count: u32 = room
                .fields
                .get("anti_snipe_count")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0);
            if count >= max_extensions {
                return Ok(ExtendOutcome::CapReached {
                    extension_count: count,
                });
            }
            let base = room.end_time_ms.or_else(|| {
                room.fields.get("end_time").and_then(|raw| raw.parse().ok())
            });
            let new_end = base.unwrap_or(0) + extension_ms;
            room.end_time_ms = Some(new_end);
            room.fields.insert("end_time".into(), new_end.to_string());
            room.fields
                .insert("anti_snipe_count".into(), (count + 1).to_string());
            Ok(ExtendOutcome::Extended {
                new_end_time_ms: new_end,
                extension_count: count + 1,
            })
        })
    }

    async fn end_time_ms(&self, auction_id: Uuid) -> StoreResult<Option<i64>> {
        let inner = self.inner.lock();
        Ok(inner.rooms.get(&auction_id).and_then(|room| room.end_time_ms))
    }

    async fn set_end_time(
        &self,
        auction_id: Uuid,
        end_time_ms: i64,
        _ttl: Duration,
    ) -> StoreResult<()> {
        self.with_room(auction_id, |room| {
            room.end_time_ms = Some(end_time_ms);
        });
        Ok(())
    }

    async fn clear_active_flag(&self, auction_id: Uuid) -> StoreResult<()> {
        self.with_room(auction_id, |room| {
            room.active = false;
        });
        Ok(())
    }

    async fn record_top_bid(
        &self,
        auction_id: Uuid,
        user_id: Uuid,
        username: &str,
        amount: Decimal,
        timestamp_ms: i64,
        cap: usize,
    ) -> StoreResult<()> {
        self.with_room(auction_id, |room| {
            let member = format!("{user_id}:{username}");
            let entry = room.leaderboard.entry(member).or_insert((amount, timestamp_ms));
            if amount > entry.0 {
                *entry = (amount, timestamp_ms);
            }
            if room.leaderboard.len() > cap {
                let mut ranked: Vec<(String, Decimal, i64)> = room
                    .leaderboard
                    .iter()
                    .map(|(member, (amount, ts))| (member.clone(), *amount, *ts))
                    .collect();
                ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
                for (member, _, _) in ranked.into_iter().skip(cap) {
                    room.leaderboard.remove(&member);
                }
            }
        });
        Ok(())
    }

    async fn top_bids(&self, auction_id: Uuid, limit: usize) -> StoreResult<Vec<TopBid>> {
        let inner = self.inner.lock();
        let Some(room) = inner.rooms.get(&auction_id) else {
            return Ok(Vec::new());
        };
        let mut ranked: Vec<(TopBid, i64)> = room
            .leaderboard
            .iter()
            .filter_map(|(member, (amount, ts))| {
                let (id_part, username) = member.split_once(':')?;
                Some((
                    TopBid {
                        user_id: id_part.parse().ok()?,
                        username: username.to_string(),
                        amount: *amount,
                    },
                    *ts,
                ))
            })
            .collect();
        ranked.sort_by(|(a, a_ts), (b, b_ts)| b.amount.cmp(&a.amount).then(a_ts.cmp(b_ts)));
        Ok(ranked.into_iter().take(limit).map(|(bid, _)| bid).collect())
    }

    async fn add_participant(&self, auction_id: Uuid, user_id: Uuid) -> StoreResult<u32> {
        self.with_room(auction_id, |room| {
            room.participants.insert(user_id);
            let count = room.participants.len() as u32;
            room.fields
                .insert("participant_count".into(), count.to_string());
            Ok(count)
        })
    }

    async fn remove_participant(&self, auction_id: Uuid, user_id: Uuid) -> StoreResult<u32> {
        self.with_room(auction_id, |room| {
            room.participants.remove(&user_id);
            let count = room.participants.len() as u32;
            room.fields
                .insert("participant_count".into(), count.to_string());
            Ok(count)
        })
    }

    async fn participants(&self, auction_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let inner = self.inner.lock();
        Ok(inner
            .rooms
            .get(&auction_id)
            .map(|room| room.participants.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn append_chat(
        &self,
        auction_id: Uuid,
        message: &ChatMessage,
        cap: usize,
    ) -> StoreResult<()> {
        self.with_room(auction_id, |room| {
            room.chat.push_back(message.clone());
            while room.chat.len() > cap {
                room.chat.pop_front();
            }
        });
        Ok(())
    }

    async fn chat_history(&self, auction_id: Uuid, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        let inner = self.inner.lock();
        Ok(inner
            .rooms
            .get(&auction_id)
            .map(|room| {
                let skip = room.chat.len().saturating_sub(limit);
                room.chat.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn put_session(&self, session: &SessionInfo, _ttl: Duration) -> StoreResult<()> {
        self.inner
            .lock()
            .sessions
            .insert(session.session_id, session.clone());
        Ok(())
    }

    async fn session(&self, session_id: Uuid) -> StoreResult<Option<SessionInfo>> {
        Ok(self.inner.lock().sessions.get(&session_id).cloned())
    }

    async fn bind_session(&self, session_id: Uuid, auction_id: Option<Uuid>) -> StoreResult<()> {
        if let Some(session) = self.inner.lock().sessions.get_mut(&session_id) {
            session.auction_id = auction_id;
        }
        Ok(())
    }

    async fn remove_session(&self, session_id: Uuid) -> StoreResult<()> {
        self.inner.lock().sessions.remove(&session_id);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        if *self.fail_publishes.lock() {
            return Err(StoreError::Unavailable("publish disabled".into()));
        }
        self.inner
            .lock()
            .published
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
