//! Single-flight coordination per cache key
//!
//! A caller that wins `lock:{key}` runs the miss path; everyone else polls
//! the cache with bounded backoff until the value appears or the lock is
//! free again. The miss path runs as a spawned task, so it finishes and
//! populates the cache even when the caller that launched it is dropped.

use crate::keys;
use std::future::Future;
use std::time::Duration;
use strata_core::{PipelineConfig, Result, StrataError};
use strata_store::{ErrorTally, ResilientStore};
use uuid::Uuid;

/// How a guarded lookup was satisfied
#[derive(Debug, Clone, PartialEq)]
pub enum Guarded<T> {
    /// This caller ran the miss path
    Computed(T),
    /// Another caller's result was found in the cache
    Cached(T),
}

impl<T> Guarded<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Computed(value) | Self::Cached(value) => value,
        }
    }

    pub fn was_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

enum Acquisition<T> {
    /// Lock held with this nonce; `None` when the store is unreachable
    Leader(Option<String>),
    Found(T),
}

/// Stampede guard
#[derive(Clone)]
pub struct StampedeGuard {
    store: ResilientStore,
    lock_ttl: Duration,
    poll_initial: Duration,
    poll_max: Duration,
}

impl StampedeGuard {
    pub fn new(
        store: ResilientStore,
        lock_ttl: Duration,
        poll_initial: Duration,
        poll_max: Duration,
    ) -> Self {
        Self {
            store,
            lock_ttl,
            poll_initial,
            poll_max,
        }
    }

    pub fn from_config(store: ResilientStore, config: &PipelineConfig) -> Self {
        Self::new(
            store,
            config.lock_ttl(),
            Duration::from_millis(config.stampede_poll_initial_ms),
            Duration::from_millis(config.stampede_poll_max_ms),
        )
    }

    /// Run `miss` for `key` at most once across concurrent callers
    ///
    /// `lookup` reads the cached value; it is retried while waiting and
    /// once more right after the lock is acquired.
    pub async fn run<T, L, LF, M>(
        &self,
        key: &str,
        tally: &ErrorTally,
        lookup: L,
        miss: M,
    ) -> Result<Guarded<T>>
    where
        T: Send + 'static,
        L: Fn() -> LF,
        LF: Future<Output = Result<Option<T>>>,
        M: Future<Output = Result<T>> + Send + 'static,
    {
        let lock_key = keys::lock(key);

        let nonce = match self.acquire(&lock_key, tally, &lookup).await? {
            Acquisition::Found(value) => return Ok(Guarded::Cached(value)),
            Acquisition::Leader(nonce) => nonce,
        };

        if nonce.is_none() {
            tracing::debug!(key, "Lock store unavailable, computing unguarded");
        }

        let store = self.store.clone();
        let task = tokio::spawn(async move {
            let result = miss.await;
            if let Some(nonce) = nonce {
                release(&store, &lock_key, &nonce).await;
            }
            result
        });

        match task.await {
            Ok(result) => result.map(Guarded::Computed),
            Err(e) => Err(StrataError::Other(anyhow::anyhow!(
                "miss path for {key} did not complete: {e}"
            ))),
        }
    }

    /// Start `miss` in the background if nobody holds the lock
    ///
    /// Returns whether a task was started. Used for refreshes, where losing
    /// the race simply means someone else is already refreshing.
    pub async fn spawn_if_free<M>(&self, key: &str, miss: M) -> bool
    where
        M: Future<Output = Result<()>> + Send + 'static,
    {
        let lock_key = keys::lock(key);
        let nonce = Uuid::new_v4().to_string();
        let tally = ErrorTally::new();

        match self
            .store
            .set_if_absent(&lock_key, nonce.as_bytes(), self.lock_ttl, &tally)
            .await
        {
            Ok(Some(true)) => {}
            _ => return false,
        }

        let store = self.store.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = miss.await {
                tracing::warn!(key = %key, error = %e, "Background refresh failed");
            }
            release(&store, &lock_key, &nonce).await;
        });
        true
    }

    async fn acquire<T, L, LF>(
        &self,
        lock_key: &str,
        tally: &ErrorTally,
        lookup: &L,
    ) -> Result<Acquisition<T>>
    where
        L: Fn() -> LF,
        LF: Future<Output = Result<Option<T>>>,
    {
        let mut backoff = self.poll_initial;

        loop {
            let nonce = Uuid::new_v4().to_string();
            match self
                .store
                .set_if_absent(lock_key, nonce.as_bytes(), self.lock_ttl, tally)
                .await?
            {
                None => return Ok(Acquisition::Leader(None)),
                Some(true) => {
                    // A previous holder may have written between our miss and the lock
                    if let Some(value) = lookup().await? {
                        release(&self.store, lock_key, &nonce).await;
                        return Ok(Acquisition::Found(value));
                    }
                    return Ok(Acquisition::Leader(Some(nonce)));
                }
                Some(false) => {}
            }

            // The holder either writes the value or its lock expires after
            // lock_ttl; both end this wait.
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.poll_max);

            if let Some(value) = lookup().await? {
                return Ok(Acquisition::Found(value));
            }
        }
    }
}

async fn release(store: &ResilientStore, lock_key: &str, nonce: &str) {
    let tally = ErrorTally::new();
    match store
        .compare_and_delete(lock_key, nonce.as_bytes(), &tally)
        .await
    {
        Ok(true) => {}
        Ok(false) if !tally.any() => {
            tracing::debug!(lock_key, "Lock expired before release");
        }
        Ok(false) => {}
        Err(e) => tracing::warn!(lock_key, error = %e, "Lock release failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use strata_store::{CacheStore, FailingStore, MemoryStore};

    fn guard_over(store: Arc<dyn CacheStore>) -> (StampedeGuard, ResilientStore) {
        let resilient = ResilientStore::new(store, true, Duration::from_millis(200));
        let guard = StampedeGuard::new(
            resilient.clone(),
            Duration::from_secs(5),
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
        (guard, resilient)
    }

    async fn read(store: &ResilientStore, key: &str) -> Result<Option<String>> {
        let tally = ErrorTally::new();
        Ok(store
            .get(key, &tally)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_computation() {
        let (guard, store) = guard_over(Arc::new(MemoryStore::new()));
        let computations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let guard = guard.clone();
            let store = store.clone();
            let computations = computations.clone();
            handles.push(tokio::spawn(async move {
                let tally = ErrorTally::new();
                let writer = store.clone();
                let miss = async move {
                    computations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    writer
                        .set("k", b"value", Duration::from_secs(60), &ErrorTally::new())
                        .await?;
                    Ok::<_, StrataError>("value".to_string())
                };
                guard
                    .run("k", &tally, || read(&store, "k"), miss)
                    .await
                    .unwrap()
            }));
        }

        let mut cached = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            if outcome.was_cached() {
                cached += 1;
            }
            assert_eq!(outcome.into_inner(), "value");
        }

        assert_eq!(computations.load(Ordering::SeqCst), 1);
        assert_eq!(cached, 19);
        assert_eq!(read(&store, "lock:k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_store_runs_unguarded() {
        let (guard, _) = guard_over(Arc::new(FailingStore::new()));
        let tally = ErrorTally::new();

        let outcome = guard
            .run(
                "k",
                &tally,
                || async { Ok(None::<u32>) },
                async { Ok(7u32) },
            )
            .await
            .unwrap();

        assert_eq!(outcome, Guarded::Computed(7));
        assert!(tally.any());
    }

    #[tokio::test]
    async fn test_failed_miss_path_releases_lock() {
        let (guard, store) = guard_over(Arc::new(MemoryStore::new()));
        let tally = ErrorTally::new();

        let err = guard
            .run(
                "k",
                &tally,
                || async { Ok(None::<u32>) },
                async { Err(StrataError::Usage("boom".into())) },
            )
            .await
            .unwrap_err();
        assert!(err.is_usage());
        assert_eq!(read(&store, "lock:k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_takes_over_expired_lock() {
        let (guard, store) = guard_over(Arc::new(MemoryStore::new()));
        let tally = ErrorTally::new();

        // A crashed holder: its lock is never released
        store
            .set_if_absent("lock:k", b"dead", Duration::from_secs(1), &tally)
            .await
            .unwrap();

        let outcome = guard
            .run("k", &tally, || async { Ok(None::<u32>) }, async { Ok(1u32) })
            .await
            .unwrap();
        assert_eq!(outcome, Guarded::Computed(1));
    }

    #[tokio::test]
    async fn test_spawn_if_free_skips_held_lock() {
        let (guard, store) = guard_over(Arc::new(MemoryStore::new()));
        let tally = ErrorTally::new();

        store
            .set_if_absent("lock:k", b"other", Duration::from_secs(5), &tally)
            .await
            .unwrap();
        assert!(!guard.spawn_if_free("k", async { Ok(()) }).await);

        assert!(guard.spawn_if_free("fresh", async { Ok(()) }).await);
    }
}
