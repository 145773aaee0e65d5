//! A store that is always down
//!
//! Used to exercise the fallback path: with it, every read must degrade to
//! a miss and every write must be dropped without failing the query.

use crate::{CacheStore, KeyTtl};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strata_core::{Result, StrataError};

/// [`CacheStore`] whose every call fails with a transient error
#[derive(Debug, Default)]
pub struct FailingStore {
    calls: AtomicU64,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls attempted against the store
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn fail<T>(&self, op: &str) -> Result<T> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(StrataError::Store(format!("{op}: connection refused")))
    }
}

#[async_trait]
impl CacheStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        self.fail("GET")
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
        self.fail("SET")
    }

    async fn set_if_absent(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<bool> {
        self.fail("SET NX")
    }

    async fn compare_and_delete(&self, _key: &str, _expected: &[u8]) -> Result<bool> {
        self.fail("EVAL")
    }

    async fn delete(&self, _keys: &[String]) -> Result<u64> {
        self.fail("DEL")
    }

    async fn increment(
        &self,
        _key: &str,
        _delta: i64,
        _ttl_if_new: Option<Duration>,
    ) -> Result<i64> {
        self.fail("INCRBY")
    }

    async fn add_to_set(&self, _key: &str, _member: &str, _ttl: Duration) -> Result<()> {
        self.fail("SADD")
    }

    async fn remove_from_set(&self, _key: &str, _members: &[String]) -> Result<u64> {
        self.fail("SREM")
    }

    async fn set_members(&self, _key: &str) -> Result<Vec<String>> {
        self.fail("SMEMBERS")
    }

    fn scan(&self, _prefix: &str) -> BoxStream<'static, Result<String>> {
        let result = self.fail("SCAN");
        stream::once(async move { result }).boxed()
    }

    async fn ttl(&self, _key: &str) -> Result<KeyTtl> {
        self.fail("PTTL")
    }

    async fn publish(&self, _channel: &str, _payload: &[u8]) -> Result<()> {
        self.fail("PUBLISH")
    }

    async fn subscribe(&self, _channel: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        self.fail("SUBSCRIBE")
    }

    fn name(&self) -> &str {
        "failing"
    }
}
