//! Fallback wrapper around a cache store
//!
//! Every call is bounded by an operation timeout. When fallback is enabled,
//! transient failures are absorbed: reads behave like misses, writes are
//! dropped, and lock acquisition reports the store as unavailable so the
//! caller can proceed unguarded. Each absorbed failure is counted both
//! process-wide and in the caller's [`ErrorTally`].

use crate::{CacheStore, KeyTtl};
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{Result, StrataError};

/// Absorbed store failures observed by one operation
#[derive(Debug, Default)]
pub struct ErrorTally {
    count: AtomicU32,
}

impl ErrorTally {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of absorbed failures
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether any failure was absorbed
    pub fn any(&self) -> bool {
        self.count() > 0
    }
}

/// Store handle implementing the fallback contract
#[derive(Clone)]
pub struct ResilientStore {
    inner: Arc<dyn CacheStore>,
    fallback: bool,
    timeout: Duration,
    errors: Arc<AtomicU64>,
}

impl ResilientStore {
    /// Wrap a store
    ///
    /// # Arguments
    /// * `fallback` - absorb transient errors instead of surfacing them
    /// * `timeout` - upper bound for each store call
    pub fn new(inner: Arc<dyn CacheStore>, fallback: bool, timeout: Duration) -> Self {
        Self {
            inner,
            fallback,
            timeout,
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &Arc<dyn CacheStore> {
        &self.inner
    }

    /// Whether transient errors degrade instead of surfacing
    pub fn fallback_enabled(&self) -> bool {
        self.fallback
    }

    /// Store failures observed by this handle and its clones
    pub fn store_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    async fn call<T, F>(
        &self,
        op: &'static str,
        key: &str,
        tally: &ErrorTally,
        fut: F,
        degraded: T,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let outcome = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StrataError::Store(format!(
                "{op} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(value) => Ok(value),
            Err(e) if e.is_transient() => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tally.record();
                if self.fallback {
                    tracing::warn!(
                        op,
                        key,
                        store = self.inner.name(),
                        error = %e,
                        "Store call failed, degrading"
                    );
                    Ok(degraded)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Read a value; `None` on miss or absorbed failure
    pub async fn get(&self, key: &str, tally: &ErrorTally) -> Result<Option<Vec<u8>>> {
        self.call("get", key, tally, self.inner.get(key), None).await
    }

    /// Write a value; absorbed failures drop the write
    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tally: &ErrorTally,
    ) -> Result<()> {
        self.call("set", key, tally, self.inner.set(key, value, ttl), ())
            .await
    }

    /// Try to write an absent key
    ///
    /// Returns `None` when the store could not be reached.
    pub async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tally: &ErrorTally,
    ) -> Result<Option<bool>> {
        let fut = async { self.inner.set_if_absent(key, value, ttl).await.map(Some) };
        self.call("set_if_absent", key, tally, fut, None).await
    }

    /// Delete a key only if it still holds `expected`
    pub async fn compare_and_delete(
        &self,
        key: &str,
        expected: &[u8],
        tally: &ErrorTally,
    ) -> Result<bool> {
        self.call(
            "compare_and_delete",
            key,
            tally,
            self.inner.compare_and_delete(key, expected),
            false,
        )
        .await
    }

    /// Delete keys
    pub async fn delete(&self, keys: &[String], tally: &ErrorTally) -> Result<u64> {
        let first = keys.first().map(String::as_str).unwrap_or_default();
        self.call("delete", first, tally, self.inner.delete(keys), 0)
            .await
    }

    /// Add to a counter; `None` when the store could not be reached
    pub async fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl_if_new: Option<Duration>,
        tally: &ErrorTally,
    ) -> Result<Option<i64>> {
        let fut = async { self.inner.increment(key, delta, ttl_if_new).await.map(Some) };
        self.call("increment", key, tally, fut, None).await
    }

    /// Add a member to a set-valued key
    pub async fn add_to_set(
        &self,
        key: &str,
        member: &str,
        ttl: Duration,
        tally: &ErrorTally,
    ) -> Result<()> {
        self.call(
            "add_to_set",
            key,
            tally,
            self.inner.add_to_set(key, member, ttl),
            (),
        )
        .await
    }

    /// Remove members from a set-valued key
    pub async fn remove_from_set(
        &self,
        key: &str,
        members: &[String],
        tally: &ErrorTally,
    ) -> Result<u64> {
        self.call(
            "remove_from_set",
            key,
            tally,
            self.inner.remove_from_set(key, members),
            0,
        )
        .await
    }

    /// Members of a set-valued key
    pub async fn set_members(&self, key: &str, tally: &ErrorTally) -> Result<Vec<String>> {
        self.call(
            "set_members",
            key,
            tally,
            self.inner.set_members(key),
            Vec::new(),
        )
        .await
    }

    /// Remaining lifetime; absorbed failures report the key as absent
    pub async fn ttl(&self, key: &str, tally: &ErrorTally) -> Result<KeyTtl> {
        self.call("ttl", key, tally, self.inner.ttl(key), KeyTtl::Absent)
            .await
    }

    /// Lazily list keys under a prefix; errors are yielded in the stream
    pub fn scan(&self, prefix: &str) -> BoxStream<'static, Result<String>> {
        self.inner.scan(prefix)
    }

    /// Publish a hint; failures are always absorbed
    pub async fn publish(&self, channel: &str, payload: &[u8]) {
        let result = tokio::time::timeout(self.timeout, self.inner.publish(channel, payload)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel, error = %e, "Publish failed");
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel, "Publish timed out");
            }
        }
    }

    /// Subscribe to a channel
    pub async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        self.inner.subscribe(channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailingStore, MemoryStore};

    fn failing(fallback: bool) -> ResilientStore {
        ResilientStore::new(
            Arc::new(FailingStore::new()),
            fallback,
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_fallback_degrades_reads_and_writes() {
        let store = failing(true);
        let tally = ErrorTally::new();

        assert_eq!(store.get("k", &tally).await.unwrap(), None);
        store
            .set("k", b"v", Duration::from_secs(1), &tally)
            .await
            .unwrap();
        assert_eq!(
            store
                .set_if_absent("lock:k", b"n", Duration::from_secs(1), &tally)
                .await
                .unwrap(),
            None
        );
        assert_eq!(store.ttl("k", &tally).await.unwrap(), KeyTtl::Absent);

        assert_eq!(tally.count(), 4);
        assert_eq!(store.store_errors(), 4);
    }

    #[tokio::test]
    async fn test_errors_surface_without_fallback() {
        let store = failing(false);
        let tally = ErrorTally::new();

        let err = store.get("k", &tally).await.unwrap_err();
        assert!(err.is_transient());
        assert!(tally.any());
    }

    #[tokio::test]
    async fn test_healthy_store_passes_through() {
        let store = ResilientStore::new(
            Arc::new(MemoryStore::new()),
            true,
            Duration::from_millis(100),
        );
        let tally = ErrorTally::new();

        store
            .set("k", b"v", Duration::from_secs(5), &tally)
            .await
            .unwrap();
        assert_eq!(store.get("k", &tally).await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(
            store
                .set_if_absent("k", b"w", Duration::from_secs(5), &tally)
                .await
                .unwrap(),
            Some(false)
        );
        assert!(!tally.any());
    }

    #[tokio::test]
    async fn test_publish_never_fails() {
        let store = failing(false);
        store.publish("invalidate", b"{}").await;
        assert_eq!(store.store_errors(), 1);
    }
}
