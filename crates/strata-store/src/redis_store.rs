//! Redis-backed cache store
//!
//! Commands go through a multiplexed `ConnectionManager` that reconnects on
//! its own. Multi-step primitives (compare-and-delete, counters with a
//! first-write TTL, sets whose expiry only grows) run as Lua scripts so the
//! server applies them atomically.

use crate::{CacheStore, KeyTtl};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, RedisError, Script};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use strata_core::{Result, StrataError};

/// Keys requested per SCAN round trip
const SCAN_COUNT: usize = 128;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const INCREMENT_WITH_TTL: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if existed == 0 and tonumber(ARGV[2]) > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return value
"#;

const ADD_TO_SET: &str = r#"
redis.call('SADD', KEYS[1], ARGV[1])
local remaining = redis.call('PTTL', KEYS[1])
if remaining >= 0 and remaining < tonumber(ARGV[2]) then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
elseif remaining == -1 and redis.call('SCARD', KEYS[1]) == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
"#;

fn store_err(e: RedisError) -> StrataError {
    StrataError::Store(e.to_string())
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    (ttl.as_millis() as u64).max(1)
}

/// Escape glob metacharacters so a prefix matches literally
fn glob_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// [`CacheStore`] backed by a Redis server
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to a Redis server
    ///
    /// # Arguments
    /// * `url` - e.g. `redis://127.0.0.1:6379`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(store_err)?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(store_err)?;

        tracing::info!(url, "Connected to Redis cache store");
        Ok(Self { client, connection })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.connection.clone();
        let script = Script::new(COMPARE_AND_DELETE);
        let removed: i64 = script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(removed == 1)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        conn.del(keys).await.map_err(store_err)
    }

    async fn increment(&self, key: &str, delta: i64, ttl_if_new: Option<Duration>) -> Result<i64> {
        let mut conn = self.connection.clone();
        let script = Script::new(INCREMENT_WITH_TTL);
        script
            .key(key)
            .arg(delta)
            .arg(ttl_if_new.map(millis).unwrap_or(0))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let script = Script::new(ADD_TO_SET);
        let _: i64 = script
            .key(key)
            .arg(member)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        conn.srem(key, members).await.map_err(store_err)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        conn.smembers(key).await.map_err(store_err)
    }

    fn scan(&self, prefix: &str) -> BoxStream<'static, Result<String>> {
        struct Cursor {
            conn: ConnectionManager,
            pattern: String,
            position: Option<u64>,
        }

        let cursor = Cursor {
            conn: self.connection.clone(),
            pattern: glob_prefix(prefix),
            position: Some(0),
        };

        stream::unfold(cursor, |mut cursor| async move {
            let position = cursor.position?;
            let reply: std::result::Result<(u64, Vec<String>), RedisError> =
                ::redis::cmd("SCAN")
                    .arg(position)
                    .arg("MATCH")
                    .arg(&cursor.pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut cursor.conn)
                    .await;

            match reply {
                Ok((next, keys)) => {
                    cursor.position = (next != 0).then_some(next);
                    Some((keys.into_iter().map(Ok).collect::<Vec<_>>(), cursor))
                }
                Err(e) => {
                    cursor.position = None;
                    Some((vec![Err(store_err(e))], cursor))
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.connection.clone();
        let remaining: i64 = conn.pttl(key).await.map_err(store_err)?;
        Ok(match remaining {
            -2 => KeyTtl::Absent,
            -1 => KeyTtl::NoExpiry,
            ms => KeyTtl::Remaining(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.connection.clone();
        let _receivers: i64 = conn.publish(channel, payload).await.map_err(store_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(store_err)?;
        pubsub.subscribe(channel).await.map_err(store_err)?;

        Ok(pubsub
            .into_on_message()
            .map(|message| message.get_payload_bytes().to_vec())
            .boxed())
    }

    fn name(&self) -> &str {
        "redis"
    }
}
