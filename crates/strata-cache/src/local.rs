//! Per-process tier in front of the embedding layer
//!
//! Uses the moka crate for a bounded, TTL-aware concurrent map. The tier is
//! only coherent with the shared store while an
//! [`InvalidationListener`](crate::InvalidationListener) feeds it events.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Bounded in-process copy of embedding records
#[derive(Clone)]
pub struct LocalTier {
    cache: Cache<String, Arc<Vec<f32>>>,
}

impl LocalTier {
    /// Create a tier
    ///
    /// # Arguments
    /// * `capacity` - maximum number of entries
    /// * `ttl` - per-entry time to live
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: String, embedding: Arc<Vec<f32>>) {
        self.cache.insert(key, embedding).await;
    }

    pub async fn invalidate(&self, keys: &[String]) {
        for key in keys {
            self.cache.invalidate(key).await;
        }
    }

    /// Drop every entry
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        // Wait for all pending invalidations to complete
        self.cache.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
