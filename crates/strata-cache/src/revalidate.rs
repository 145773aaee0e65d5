//! Stale-while-revalidate
//!
//! A hit whose remaining TTL has dropped below the threshold is still
//! served, but one background refresh is scheduled for it. The refresh
//! holds the key's single-flight lock, so concurrent readers of the same
//! near-expiry entry start at most one refresh between them.

use crate::guard::StampedeGuard;
use std::future::Future;
use std::time::Duration;
use strata_core::Result;
use strata_store::{ErrorTally, KeyTtl, ResilientStore};

#[derive(Clone)]
pub struct Revalidator {
    store: ResilientStore,
    guard: StampedeGuard,
    threshold: Duration,
}

impl Revalidator {
    pub fn new(store: ResilientStore, guard: StampedeGuard, threshold: Duration) -> Self {
        Self {
            store,
            guard,
            threshold,
        }
    }

    /// Whether an entry with this remaining lifetime should be refreshed
    pub fn is_stale(&self, ttl: KeyTtl) -> bool {
        matches!(ttl, KeyTtl::Remaining(left) if left < self.threshold)
    }

    /// Schedule `refresh` if `key` is close to expiry
    ///
    /// Returns whether a refresh was started.
    pub async fn maybe_refresh<F, M>(&self, key: &str, tally: &ErrorTally, refresh: F) -> bool
    where
        F: FnOnce() -> M,
        M: Future<Output = Result<()>> + Send + 'static,
    {
        let ttl = match self.store.ttl(key, tally).await {
            Ok(ttl) => ttl,
            Err(e) => {
                tracing::debug!(key, error = %e, "TTL check failed, not revalidating");
                return false;
            }
        };
        if !self.is_stale(ttl) {
            return false;
        }

        let started = self.guard.spawn_if_free(key, refresh()).await;
        if started {
            tracing::debug!(key, ?ttl, "Revalidating near-expiry entry");
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use strata_store::MemoryStore;

    fn revalidator() -> (Revalidator, ResilientStore) {
        let store = ResilientStore::new(
            Arc::new(MemoryStore::new()),
            true,
            Duration::from_millis(100),
        );
        let guard = StampedeGuard::new(
            store.clone(),
            Duration::from_secs(5),
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
        (
            Revalidator::new(store.clone(), guard, Duration::from_secs(10)),
            store,
        )
    }

    #[test]
    fn test_staleness() {
        let (revalidator, _) = revalidator();
        assert!(revalidator.is_stale(KeyTtl::Remaining(Duration::from_secs(3))));
        assert!(!revalidator.is_stale(KeyTtl::Remaining(Duration::from_secs(30))));
        assert!(!revalidator.is_stale(KeyTtl::NoExpiry));
        assert!(!revalidator.is_stale(KeyTtl::Absent));
    }

    #[tokio::test]
    async fn test_refresh_only_near_expiry() {
        let (revalidator, store) = revalidator();
        let tally = ErrorTally::new();
        let refreshes = Arc::new(AtomicUsize::new(0));

        store
            .set("fresh", b"v", Duration::from_secs(60), &tally)
            .await
            .unwrap();
        store
            .set("stale", b"v", Duration::from_secs(2), &tally)
            .await
            .unwrap();

        let counter = refreshes.clone();
        let started = revalidator
            .maybe_refresh("fresh", &tally, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(!started);

        let counter = refreshes.clone();
        let started = revalidator
            .maybe_refresh("stale", &tally, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(started);

        // A second reader while the first refresh holds the lock
        let counter = refreshes.clone();
        let again = revalidator
            .maybe_refresh("stale", &tally, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        for _ in 0..100 {
            if refreshes.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!again);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }
}
