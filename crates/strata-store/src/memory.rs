//! In-process cache store
//!
//! Keys live in an ordered map so prefix scans can page through a range
//! with a cursor instead of copying the keyspace. Expired entries are
//! dropped lazily on access. Pub/sub is backed by tokio broadcast channels.

use crate::{CacheStore, KeyTtl};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use strata_core::{Result, StrataError};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Keys returned per scan page
const SCAN_BATCH: usize = 128;

/// Buffered messages per pub/sub channel
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    entries: Mutex<BTreeMap<String, Slot>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl Inner {
    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, Slot>>> {
        self.entries
            .lock()
            .map_err(|_| StrataError::Store("memory store lock poisoned".to_string()))
    }

    fn channels(&self) -> Result<MutexGuard<'_, HashMap<String, broadcast::Sender<Vec<u8>>>>> {
        self.channels
            .lock()
            .map_err(|_| StrataError::Store("memory store lock poisoned".to_string()))
    }

    /// One page of live keys under `prefix`, strictly after `after`
    ///
    /// Returns the page, the last key visited (live or not) and whether the
    /// range is exhausted.
    fn scan_page(
        &self,
        prefix: &str,
        after: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>, bool)> {
        let entries = self.entries()?;
        let now = Instant::now();
        let start = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Included(prefix),
        };

        let mut page = Vec::new();
        let mut last = None;
        for (key, slot) in entries.range::<str, _>((start, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                return Ok((page, last, true));
            }
            last = Some(key.clone());
            if slot.is_live(now) {
                page.push(key.clone());
                if page.len() == SCAN_BATCH {
                    return Ok((page, last, false));
                }
            }
        }
        Ok((page, last, true))
    }
}

/// In-memory [`CacheStore`]
///
/// Cloning is cheap and clones share the same keyspace, which lets tests
/// model several pipeline processes attached to one store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries()
            .map(|entries| entries.values().filter(|slot| slot.is_live(now)).count())
            .unwrap_or(0)
    }

    /// Whether the store holds no live keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.inner.entries()?;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, slot| slot.is_live(now));
        Ok(before - entries.len())
    }

    fn live<'a>(
        entries: &'a mut BTreeMap<String, Slot>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Slot> {
        let expired = entries.get(key).map(|slot| !slot.is_live(now))?;
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key)
    }
}

fn wrong_type(key: &str) -> StrataError {
    StrataError::Store(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.inner.entries()?;
        match Self::live(&mut entries, key, Instant::now()) {
            None => Ok(None),
            Some(Slot {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.inner.entries()?;
        entries.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut entries = self.inner.entries()?;
        let now = Instant::now();
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut entries = self.inner.entries()?;
        let matches = matches!(
            Self::live(&mut entries, key, Instant::now()),
            Some(Slot { value: Value::Bytes(bytes), .. }) if bytes.as_slice() == expected
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut entries = self.inner.entries()?;
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some(slot) = entries.remove(key) {
                if slot.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn increment(&self, key: &str, delta: i64, ttl_if_new: Option<Duration>) -> Result<i64> {
        let mut entries = self.inner.entries()?;
        let now = Instant::now();
        match Self::live(&mut entries, key, now) {
            Some(slot) => {
                let Value::Bytes(bytes) = &slot.value else {
                    return Err(wrong_type(key));
                };
                let current: i64 = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        StrataError::Store(format!("value at {key} is not an integer"))
                    })?;
                let next = current.checked_add(delta).ok_or_else(|| {
                    StrataError::Store(format!("increment of {key} would overflow"))
                })?;
                slot.value = Value::Bytes(next.to_string().into_bytes());
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Slot {
                        value: Value::Bytes(delta.to_string().into_bytes()),
                        expires_at: ttl_if_new.map(|ttl| now + ttl),
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.inner.entries()?;
        let now = Instant::now();
        let expires_at = now + ttl;
        match Self::live(&mut entries, key, now) {
            Some(slot) => {
                let Value::Set(members) = &mut slot.value else {
                    return Err(wrong_type(key));
                };
                members.insert(member.to_string());
                if let Some(current) = slot.expires_at {
                    slot.expires_at = Some(current.max(expires_at));
                }
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Slot {
                        value: Value::Set(BTreeSet::from([member.to_string()])),
                        expires_at: Some(expires_at),
                    },
                );
            }
        }
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, members: &[String]) -> Result<u64> {
        let mut entries = self.inner.entries()?;
        let (removed, emptied) = match Self::live(&mut entries, key, Instant::now()) {
            None => return Ok(0),
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => {
                let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
                (removed as u64, set.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if emptied {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut entries = self.inner.entries()?;
        match Self::live(&mut entries, key, Instant::now()) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn scan(&self, prefix: &str) -> BoxStream<'static, Result<String>> {
        struct Cursor {
            inner: Arc<Inner>,
            prefix: String,
            after: Option<String>,
            done: bool,
        }

        let cursor = Cursor {
            inner: Arc::clone(&self.inner),
            prefix: prefix.to_string(),
            after: None,
            done: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            match cursor
                .inner
                .scan_page(&cursor.prefix, cursor.after.as_deref())
            {
                Ok((page, last, exhausted)) => {
                    cursor.after = last;
                    cursor.done = exhausted;
                    Some((page.into_iter().map(Ok).collect::<Vec<_>>(), cursor))
                }
                Err(e) => {
                    cursor.done = true;
                    Some((vec![Err(e)], cursor))
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut entries = self.inner.entries()?;
        let now = Instant::now();
        Ok(match Self::live(&mut entries, key, now) {
            None => KeyTtl::Absent,
            Some(Slot {
                expires_at: None, ..
            }) => KeyTtl::NoExpiry,
            Some(Slot {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Remaining(at.saturating_duration_since(now)),
        })
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let channels = self.inner.channels()?;
        if let Some(sender) = channels.get(channel) {
            // No subscribers is not an error
            let _ = sender.send(payload.to_vec());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        let receiver = {
            let mut channels = self.inner.channels()?;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        Ok(stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    // Best effort: skip what a slow subscriber missed
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
