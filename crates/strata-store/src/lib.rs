//! Strata Store - Cache store abstraction
//!
//! Every cache layer talks to a [`CacheStore`]: a key/value store with
//! per-key TTL and a handful of atomic primitives (set-if-absent,
//! compare-and-delete, counters, sets), cursor-based prefix scans and
//! best-effort pub/sub.
//!
//! | Store | Use |
//! |-------|-----|
//! | [`MemoryStore`] | Single process, tests |
//! | `RedisStore` | Shared by a fleet (feature `redis`) |
//! | [`FailingStore`] | Fallback testing; every call fails |
//!
//! [`ResilientStore`] wraps any of them and implements the fallback
//! contract: transient failures become misses on read and are dropped on
//! write.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use strata_core::Result;

pub mod failing;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod resilient;

pub use failing::FailingStore;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use resilient::{ErrorTally, ResilientStore};

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Absent,
    /// Key exists without expiration
    NoExpiry,
    /// Key expires after this duration
    Remaining(Duration),
}

/// Trait for cache store backends
///
/// Every operation may fail with `StrataError::Store`; callers treat that as
/// a transient condition. The atomic primitives are assumed to be
/// serialized per key by the backend.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value, replacing any previous one and its expiry
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Write only if the key is absent; returns whether the write happened
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete the key only if it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Delete keys; unknown keys are ignored. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Atomically add `delta` to an integer counter
    ///
    /// A missing key starts at zero and receives `ttl_if_new`
    /// (no expiry when `None`).
    async fn increment(&self, key: &str, delta: i64, ttl_if_new: Option<Duration>) -> Result<i64>;

    /// Add a member to a set-valued key, extending its expiry to at least `ttl`
    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<()>;

    /// Remove members from a set-valued key; an emptied set is deleted.
    /// Returns how many were present.
    async fn remove_from_set(&self, key: &str, members: &[String]) -> Result<u64>;

    /// Members of a set-valued key (empty when absent)
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Lazily list keys starting with `prefix`, one cursor page at a time
    fn scan(&self, prefix: &str) -> BoxStream<'static, Result<String>>;

    /// Remaining lifetime of a key
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Publish a message; delivery is not guaranteed
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>>;

    /// Backend name for logging
    fn name(&self) -> &str;
}
