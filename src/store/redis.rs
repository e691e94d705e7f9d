//! Redis-backed Shared State Store
//!
//! Hashes for live state, a sorted set for the leaderboard, a set for
//! participants, a capped list for chat, TTL'd strings for end-time and
//! active flags, and Lua scripts for the two atomic primitives. Scripts
//! execute atomically server-side, which is what makes per-auction
//! commits linearizable without in-process locks.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{ChatMessage, LiveState, SessionInfo, TopBid};
use crate::store::keys::Keys;
use crate::store::{
    BidAttempt, CommitOutcome, ExtendOutcome, LiveStore, StoreError, StoreResult,
};

/// Atomic bid comparison. The only read-modify-write on
/// `current_high_bid`; also the only increment of `bid_count`.
const BID_COMMIT_SCRIPT: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], 'current_high_bid') or '0')
local amount = tonumber(ARGV[1])
if amount > current then
    redis.call('HSET', KEYS[1],
        'current_high_bid', ARGV[1],
        'high_bidder_id', ARGV[2],
        'high_bidder_username', ARGV[3],
        'last_bid_time', ARGV[4])
    redis.call('HINCRBY', KEYS[1], 'bid_count', 1)
    return 1
else
    return 0
end
"#;

/// Atomic anti-snipe extension. Checks the cap, bumps the counter and
/// pushes the end time forward in one step so concurrent late bids can
/// never exceed the cap or race the counter.
const ANTI_SNIPE_SCRIPT: &str = r#"
local count = tonumber(redis.call('HGET', KEYS[1], 'anti_snipe_count') or '0')
if count >= tonumber(ARGV[2]) then
    return {0, 0, count}
end
local base = tonumber(redis.call('GET', KEYS[2]) or redis.call('HGET', KEYS[1], 'end_time') or '0')
local new_end = base + tonumber(ARGV[1])
redis.call('HSET', KEYS[1], 'end_time', tostring(new_end), 'anti_snipe_count', tostring(count + 1))
local ttl = redis.call('TTL', KEYS[2])
if ttl > 0 then
    redis.call('SET', KEYS[2], tostring(new_end), 'KEEPTTL')
else
    redis.call('SET', KEYS[2], tostring(new_end))
end
return {1, new_end, count + 1}
"#;

/// Leaderboard upsert: keep each bidder's best amount, remember the
/// commit time of that amount, trim to the cap.
const TOP_BID_SCRIPT: &str = r#"
local member = ARGV[1]
local amount = tonumber(ARGV[2])
local existing = tonumber(redis.call('ZSCORE', KEYS[1], member) or '-1')
if amount > existing then
    redis.call('ZADD', KEYS[1], amount, member)
    redis.call('HSET', KEYS[2], member, ARGV[3])
end
local cap = tonumber(ARGV[4])
local count = redis.call('ZCARD', KEYS[1])
if count > cap then
    local removed = redis.call('ZRANGE', KEYS[1], 0, count - cap - 1)
    redis.call('ZREMRANGEBYRANK', KEYS[1], 0, count - cap - 1)
    for _, m in ipairs(removed) do
        redis.call('HDEL', KEYS[2], m)
    end
end
return count
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    keys: Keys,
    bid_commit: Script,
    anti_snipe: Script,
    top_bid: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, keys: Keys) -> Self {
        Self {
            conn,
            keys,
            bid_commit: Script::new(BID_COMMIT_SCRIPT),
            anti_snipe: Script::new(ANTI_SNIPE_SCRIPT),
            top_bid: Script::new(TOP_BID_SCRIPT),
        }
    }

    pub async fn connect(url: &str, keys: Keys) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let conn = ConnectionManager::new(client).await.map_err(StoreError::from)?;
        Ok(Self::new(conn, keys))
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn member_of(user_id: Uuid, username: &str) -> String {
    format!("{user_id}:{username}")
}

fn parse_member(member: &str) -> Option<(Uuid, String)> {
    let (id_part, username) = member.split_once(':')?;
    Some((id_part.parse().ok()?, username.to_string()))
}

#[async_trait]
impl LiveStore for RedisStore {
    async fn init_live_state(
        &self,
        auction_id: Uuid,
        state: &LiveState,
        state_ttl: Duration,
        active_ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        let state_key = self.keys.state(auction_id);
        let fields = state.to_fields();
        conn.hset_multiple::<_, _, _, ()>(&state_key, &fields).await?;
        conn.expire::<_, ()>(&state_key, state_ttl.as_secs() as i64).await?;
        conn.set_ex::<_, _, ()>(
            self.keys.end_time(auction_id),
            state.end_time_ms.to_string(),
            state_ttl.as_secs(),
        )
        .await?;
        conn.set_ex::<_, _, ()>(
            self.keys.active(auction_id),
            "true",
            active_ttl.as_secs().max(1),
        )
        .await?;
        Ok(())
    }

    async fn live_state(&self, auction_id: Uuid) -> StoreResult<Option<LiveState>> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.state(auction_id)).await?;
        Ok(LiveState::from_fields(&fields))
    }

    async fn set_state_field(
        &self,
        auction_id: Uuid,
        field: &str,
        value: &str,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(self.keys.state(auction_id), field, value).await?;
        Ok(())
    }

    async fn commit_bid(
        &self,
        auction_id: Uuid,
        attempt: &BidAttempt,
    ) -> StoreResult<CommitOutcome> {
        let mut conn = self.conn();
        let state_key = self.keys.state(auction_id);
        let accepted: i64 = self
            .bid_commit
            .key(&state_key)
            .arg(attempt.amount.to_string())
            .arg(attempt.user_id.to_string())
            .arg(&attempt.username)
            .arg(attempt.timestamp_ms)
            .invoke_async(&mut conn)
            .await?;
        if accepted == 1 {
            Ok(CommitOutcome::Accepted)
        } else {
            let raw: Option<String> = conn.hget(&state_key, "current_high_bid").await?;
            let current_high = raw
                .as_deref()
                .and_then(|value| value.parse().ok())
                .unwrap_or(Decimal::ZERO);
            Ok(CommitOutcome::Outbid { current_high })
        }
    }

    async fn extend_end_time(
        &self,
        auction_id: Uuid,
        extension_ms: i64,
        max_extensions: u32,
    ) -> StoreResult<ExtendOutcome> {
        let mut conn = self.conn();
        let result: Vec<i64> = self
            .anti_snipe
            .key(self.keys.state(auction_id))
            .key(self.keys.end_time(auction_id))
            .arg(extension_ms)
            .arg(max_extensions)
            .invoke_async(&mut conn)
            .await?;
        match result.as_slice() {
            [1, new_end, count] => Ok(ExtendOutcome::Extended {
                new_end_time_ms: *new_end,
                extension_count: *count as u32,
            }),
            [0, _, count] => Ok(ExtendOutcome::CapReached {
                extension_count: *count as u32,
            }),
            other => Err(StoreError::Corrupt {
                key: self.keys.state(auction_id),
                detail: format!("unexpected anti-snipe script reply: {other:?}"),
            }),
        }
    }

    async fn end_time_ms(&self, auction_id: Uuid) -> StoreResult<Option<i64>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(self.keys.end_time(auction_id)).await?;
        Ok(raw.and_then(|value| value.parse().ok()))
    }

    async fn set_end_time(
        &self,
        auction_id: Uuid,
        end_time_ms: i64,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.set_ex::<_, _, ()>(
            self.keys.end_time(auction_id),
            end_time_ms.to_string(),
            ttl.as_secs().max(1),
        )
        .await?;
        Ok(())
    }

    async fn clear_active_flag(&self, auction_id: Uuid) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(self.keys.active(auction_id)).await?;
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
        let mut conn = self.conn();
        let amount_score = amount.to_f64().ok_or_else(|| StoreError::Corrupt {
            key: self.keys.top_bids(auction_id),
            detail: format!("amount {amount} not representable as score"),
        })?;
        let _: i64 = self
            .top_bid
            .key(self.keys.top_bids(auction_id))
            .key(self.keys.top_bid_times(auction_id))
            .arg(member_of(user_id, username))
            .arg(amount_score)
            .arg(timestamp_ms)
            .arg(cap)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn top_bids(&self, auction_id: Uuid, limit: usize) -> StoreResult<Vec<TopBid>> {
        let mut conn = self.conn();
        let raw: Vec<(String, f64)> = conn
            .zrevrange_withscores(self.keys.top_bids(auction_id), 0, limit as isize - 1)
            .await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let members: Vec<String> = raw.iter().map(|(member, _)| member.clone()).collect();
        let times: Vec<Option<i64>> = conn
            .hget(self.keys.top_bid_times(auction_id), &members)
            .await
            .unwrap_or_else(|_| vec![None; members.len()]);

        let mut entries: Vec<(TopBid, i64)> = raw
            .into_iter()
            .zip(times)
            .filter_map(|((member, score), ts)| {
                let (user_id, username) = parse_member(&member)?;
                let amount = Decimal::from_f64(score)?.round_dp(2);
                Some((
                    TopBid {
                        user_id,
                        username,
                        amount,
                    },
                    ts.unwrap_or(i64::MAX),
                ))
            })
            .collect();
        // Amount descending, then earliest commit first on ties.
        entries.sort_by(|(a, a_ts), (b, b_ts)| {
            b.amount.cmp(&a.amount).then(a_ts.cmp(b_ts))
        });
        Ok(entries.into_iter().map(|(bid, _)| bid).collect())
    }

    async fn add_participant(&self, auction_id: Uuid, user_id: Uuid) -> StoreResult<u32> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(self.keys.users(auction_id), user_id.to_string()).await?;
        let count: i64 = conn.scard(self.keys.users(auction_id)).await?;
        conn.hset::<_, _, _, ()>(
            self.keys.state(auction_id),
            "participant_count",
            count.to_string(),
        )
        .await?;
        Ok(count as u32)
    }

    async fn remove_participant(&self, auction_id: Uuid, user_id: Uuid) -> StoreResult<u32> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(self.keys.users(auction_id), user_id.to_string()).await?;
        let count: i64 = conn.scard(self.keys.users(auction_id)).await?;
        conn.hset::<_, _, _, ()>(
            self.keys.state(auction_id),
            "participant_count",
            count.to_string(),
        )
        .await?;
        Ok(count as u32)
    }

    async fn participants(&self, auction_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(self.keys.users(auction_id)).await?;
        Ok(members
            .into_iter()
            .filter_map(|raw| raw.parse().ok())
            .collect())
    }

    async fn append_chat(
        &self,
        auction_id: Uuid,
        message: &ChatMessage,
        cap: usize,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        let key = self.keys.chat_history(auction_id);
        let payload = serde_json::to_string(message).map_err(|err| StoreError::Corrupt {
            key: key.clone(),
            detail: err.to_string(),
        })?;
        conn.rpush::<_, _, ()>(&key, payload).await?;
        conn.ltrim::<_, ()>(&key, -(cap as isize), -1).await?;
        Ok(())
    }

    async fn chat_history(&self, auction_id: Uuid, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        let mut conn = self.conn();
        let raw: Vec<String> = conn
            .lrange(self.keys.chat_history(auction_id), -(limit as isize), -1)
            .await?;
        // Skip entries that fail to parse rather than failing the read.
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    async fn put_session(&self, session: &SessionInfo, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        let key = self.keys.connection(session.session_id);
        conn.hset_multiple::<_, _, _, ()>(&key, &session.to_fields()).await?;
        conn.expire::<_, ()>(&key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn session(&self, session_id: Uuid) -> StoreResult<Option<SessionInfo>> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> =
            conn.hgetall(self.keys.connection(session_id)).await?;
        Ok(SessionInfo::from_fields(session_id, &fields))
    }

    async fn bind_session(&self, session_id: Uuid, auction_id: Option<Uuid>) -> StoreResult<()> {
        let mut conn = self.conn();
        let key = self.keys.connection(session_id);
        match auction_id {
            Some(id) => conn.hset::<_, _, _, ()>(&key, "auction_id", id.to_string()).await?,
            None => conn.hdel::<_, _, ()>(&key, "auction_id").await?,
        }
        Ok(())
    }

    async fn remove_session(&self, session_id: Uuid) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(self.keys.connection(session_id)).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
