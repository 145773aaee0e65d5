//! Per-layer hit/miss accounting
//!
//! Counters live in process as atomics and are mirrored, best effort, into
//! `metrics:cache:{layer}:{class}` so that a fleet sharing one store can be
//! observed as a whole.

use crate::keys;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::{LayerOutcome, Result, StrataError};
use strata_store::{ErrorTally, ResilientStore};

// ============================================================================
// Layers and Classes
// ============================================================================

/// Cache layer a counter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Embed,
    Search,
    Answer,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Embed, Layer::Search, Layer::Answer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embed => "embed",
            Self::Search => "search",
            Self::Answer => "answer",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Embed => 0,
            Self::Search => 1,
            Self::Answer => 2,
        }
    }
}

/// Counter class within a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricClass {
    Hits,
    Misses,
    Semantic,
    Skipped,
    StoreErrors,
}

impl MetricClass {
    pub const ALL: [MetricClass; 5] = [
        MetricClass::Hits,
        MetricClass::Misses,
        MetricClass::Semantic,
        MetricClass::Skipped,
        MetricClass::StoreErrors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hits => "hits",
            Self::Misses => "misses",
            Self::Semantic => "semantic",
            Self::Skipped => "skipped",
            Self::StoreErrors => "store_errors",
        }
    }
}

impl From<LayerOutcome> for MetricClass {
    fn from(outcome: LayerOutcome) -> Self {
        match outcome {
            LayerOutcome::Hit => Self::Hits,
            LayerOutcome::Miss => Self::Misses,
            LayerOutcome::Semantic => Self::Semantic,
            LayerOutcome::Skipped => Self::Skipped,
        }
    }
}

// ============================================================================
// Layer Statistics
// ============================================================================

/// Counters for one layer
#[derive(Debug)]
pub struct LayerStats {
    layer: Layer,
    hits: AtomicU64,
    misses: AtomicU64,
    semantic: AtomicU64,
    skipped: AtomicU64,
    store_errors: AtomicU64,
}

impl LayerStats {
    fn new(layer: Layer) -> Self {
        Self {
            layer,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            semantic: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    fn counter(&self, class: MetricClass) -> &AtomicU64 {
        match class {
            MetricClass::Hits => &self.hits,
            MetricClass::Misses => &self.misses,
            MetricClass::Semantic => &self.semantic,
            MetricClass::Skipped => &self.skipped,
            MetricClass::StoreErrors => &self.store_errors,
        }
    }

    fn add(&self, class: MetricClass, delta: u64) {
        self.counter(class).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, class: MetricClass) -> u64 {
        self.counter(class).load(Ordering::Relaxed)
    }

    pub fn report(&self) -> LayerStatsReport {
        LayerStatsReport::new(
            self.layer,
            self.get(MetricClass::Hits),
            self.get(MetricClass::Misses),
            self.get(MetricClass::Semantic),
            self.get(MetricClass::Skipped),
            self.get(MetricClass::StoreErrors),
        )
    }
}

/// Serializable counters of one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStatsReport {
    pub layer: Layer,
    pub hits: u64,
    pub misses: u64,
    pub semantic: u64,
    pub skipped: u64,
    pub store_errors: u64,
    /// Lookups that consulted the cache (skipped ones excluded)
    pub total_requests: u64,
    /// Exact plus semantic hits over total requests (0.0 - 1.0)
    pub hit_rate: f64,
}

impl LayerStatsReport {
    fn new(
        layer: Layer,
        hits: u64,
        misses: u64,
        semantic: u64,
        skipped: u64,
        store_errors: u64,
    ) -> Self {
        let total_requests = hits + semantic + misses;
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            (hits + semantic) as f64 / total_requests as f64
        };

        Self {
            layer,
            hits,
            misses,
            semantic,
            skipped,
            store_errors,
            total_requests,
            hit_rate,
        }
    }
}

/// Counters of all layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub layers: Vec<LayerStatsReport>,
}

impl MetricsSnapshot {
    pub fn layer(&self, layer: Layer) -> Option<&LayerStatsReport> {
        self.layers.iter().find(|report| report.layer == layer)
    }
}

// ============================================================================
// Metrics Sink
// ============================================================================

/// Records layer outcomes
#[derive(Clone)]
pub struct MetricsSink {
    layers: Arc<[LayerStats; 3]>,
    store: Option<ResilientStore>,
}

impl MetricsSink {
    /// Sink with in-process counters only
    pub fn local() -> Self {
        Self {
            layers: Arc::new(Layer::ALL.map(LayerStats::new)),
            store: None,
        }
    }

    /// Sink that also mirrors every increment into the store
    pub fn mirrored(store: ResilientStore) -> Self {
        Self {
            store: Some(store),
            ..Self::local()
        }
    }

    pub fn stats(&self, layer: Layer) -> &LayerStats {
        &self.layers[layer.index()]
    }

    /// Record what one layer did for one query
    pub async fn record(&self, layer: Layer, outcome: LayerOutcome, store_errors: u32) {
        self.increment(layer, MetricClass::from(outcome), 1).await;
        if store_errors > 0 {
            self.increment(layer, MetricClass::StoreErrors, u64::from(store_errors))
                .await;
        }
    }

    async fn increment(&self, layer: Layer, class: MetricClass, delta: u64) {
        self.stats(layer).add(class, delta);

        let Some(store) = &self.store else {
            return;
        };
        let key = keys::metrics(layer.as_str(), class.as_str());
        let tally = ErrorTally::new();
        if let Err(e) = store.increment(&key, delta as i64, None, &tally).await {
            tracing::debug!(key = %key, error = %e, "Metric mirror dropped");
        }
    }

    /// In-process counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            layers: self.layers.iter().map(LayerStats::report).collect(),
        }
    }

    /// Counters aggregated by every process sharing the store
    pub async fn fleet_snapshot(&self) -> Result<MetricsSnapshot> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| StrataError::Usage("metrics are not mirrored to a store".to_string()))?;

        let tally = ErrorTally::new();
        let mut layers = Vec::with_capacity(Layer::ALL.len());
        for layer in Layer::ALL {
            let mut values = [0u64; 5];
            for (slot, class) in values.iter_mut().zip(MetricClass::ALL) {
                let key = keys::metrics(layer.as_str(), class.as_str());
                *slot = match store.get(&key, &tally).await? {
                    Some(raw) => std::str::from_utf8(&raw)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(0),
                    None => 0,
                };
            }
            layers.push(LayerStatsReport::new(
                layer, values[0], values[1], values[2], values[3], values[4],
            ));
        }

        if tally.any() {
            return Err(StrataError::Store(
                "metrics counters could not be read".to_string(),
            ));
        }
        Ok(MetricsSnapshot { layers })
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::local()
    }
}
