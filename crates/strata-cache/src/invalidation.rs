//! Cache invalidation
//!
//! Implements the invalidation primitives, from narrow to broad:
//! - TTL expiry: passive, handled by the store
//! - Point deletion of individual keys
//! - Tag-based: `tag:{name}` sets group keys for batch deletion
//! - Version bump: incrementing `version:{namespace}` orphans every
//!   retrieval key built from the old value
//!
//! Every invalidation also publishes an [`InvalidationEvent`] on the
//! `invalidate` channel. Delivery is best effort; versions and TTLs stay
//! authoritative, the events only keep per-process tiers coherent.

use crate::keys;
use crate::local::LocalTier;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_core::{PipelineConfig, Result, StrataError};
use strata_store::{ErrorTally, ResilientStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Keys deleted per round trip while sweeping a prefix
const SWEEP_BATCH: usize = 128;

// ============================================================================
// Events
// ============================================================================

/// What was invalidated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// Individual keys were deleted
    Key { keys: Vec<String> },

    /// A tag set and its members were deleted
    Tag { name: String, keys: Vec<String> },

    /// A namespace moved to a new version
    VersionBump { namespace: String, version: u64 },
}

/// An event as published on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    #[serde(flatten)]
    pub event: InvalidationEvent,
    pub at: DateTime<Utc>,
}

impl InvalidationMessage {
    pub fn new(event: InvalidationEvent) -> Self {
        Self {
            event,
            at: Utc::now(),
        }
    }
}

// ============================================================================
// Corpus Mutations
// ============================================================================

/// Kind of change applied to the vector index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusChangeKind {
    Added,
    Updated,
    Deleted,
}

/// Documents changed in the vector index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusChange {
    pub kind: CorpusChangeKind,
    pub doc_ids: Vec<String>,
}

impl CorpusChange {
    pub fn added<I, S>(doc_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CorpusChangeKind::Added, doc_ids)
    }

    pub fn updated<I, S>(doc_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CorpusChangeKind::Updated, doc_ids)
    }

    pub fn deleted<I, S>(doc_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CorpusChangeKind::Deleted, doc_ids)
    }

    fn new<I, S>(kind: CorpusChangeKind, doc_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            doc_ids: doc_ids.into_iter().map(Into::into).collect(),
        }
    }
}

// ============================================================================
// Invalidator
// ============================================================================

/// Owns the corpus version and applies invalidations
#[derive(Clone)]
pub struct Invalidator {
    store: ResilientStore,
    namespace: String,
    sweep_on_bump: bool,
    evict_answers: bool,
}

impl Invalidator {
    pub fn new(store: ResilientStore, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            sweep_on_bump: true,
            evict_answers: false,
        }
    }

    pub fn from_config(store: ResilientStore, config: &PipelineConfig) -> Self {
        Self {
            sweep_on_bump: config.sweep_on_version_bump,
            evict_answers: config.evict_answers_on_corpus_change,
            ..Self::new(store, config.corpus_version_namespace.clone())
        }
    }

    /// Name of the version counter
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current corpus version, or `None` when the counter could not be read
    pub async fn read_version(&self, tally: &ErrorTally) -> Result<Option<u64>> {
        let before = tally.count();
        let raw = self.store.get(&keys::version(&self.namespace), tally).await?;
        if tally.count() > before {
            return Ok(None);
        }

        match raw {
            None => Ok(Some(0)),
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Some)
                .ok_or_else(|| {
                    StrataError::Invalidation(format!(
                        "version counter for {} is not an integer",
                        self.namespace
                    ))
                }),
        }
    }

    /// Current corpus version (0 before the first bump)
    pub async fn current_version(&self) -> Result<u64> {
        let tally = ErrorTally::new();
        self.read_version(&tally).await?.ok_or_else(|| {
            StrataError::Store(format!("version counter for {} unreachable", self.namespace))
        })
    }

    /// Move the namespace to a new version
    ///
    /// Every retrieval key built from the old version becomes unreachable
    /// at once. The orphans expire on their own, or are swept in the
    /// background when sweeping is enabled.
    pub async fn bump_version(&self) -> Result<u64> {
        let tally = ErrorTally::new();
        let version = self
            .store
            .increment(&keys::version(&self.namespace), 1, None, &tally)
            .await?
            .ok_or_else(|| {
                StrataError::Invalidation(format!(
                    "version counter for {} unreachable",
                    self.namespace
                ))
            })?;
        let version = u64::try_from(version).map_err(|_| {
            StrataError::Invalidation(format!("version counter for {} is negative", self.namespace))
        })?;

        tracing::info!(namespace = %self.namespace, version, "Corpus version bumped");

        self.publish(InvalidationEvent::VersionBump {
            namespace: self.namespace.clone(),
            version,
        })
        .await;

        if self.sweep_on_bump && version > 0 {
            let this = self.clone();
            let old = version - 1;
            tokio::spawn(async move { this.sweep_version(old).await });
        }

        Ok(version)
    }

    /// Delete individual keys
    pub async fn delete(&self, keys: &[String]) -> Result<u64> {
        let tally = ErrorTally::new();
        let deleted = self.store.delete(keys, &tally).await?;
        self.publish(InvalidationEvent::Key {
            keys: keys.to_vec(),
        })
        .await;
        Ok(deleted)
    }

    /// Add `key` to each tag set
    ///
    /// Tag sets live at least as long as their longest-lived member.
    pub async fn tag(
        &self,
        key: &str,
        tags: &[String],
        ttl: Duration,
        tally: &ErrorTally,
    ) -> Result<()> {
        for name in tags {
            self.store
                .add_to_set(&keys::tag(name), key, ttl, tally)
                .await?;
        }
        Ok(())
    }

    /// Delete every member of `tag:{name}` and the set itself
    pub async fn invalidate_tag(&self, name: &str) -> Result<u64> {
        let tally = ErrorTally::new();
        let tag_key = keys::tag(name);
        let members = self.store.set_members(&tag_key, &tally).await?;

        let mut doomed = members.clone();
        doomed.push(tag_key);
        let deleted = self.store.delete(&doomed, &tally).await?;

        if tally.any() {
            return Err(StrataError::Invalidation(format!(
                "tag {name} only partially invalidated"
            )));
        }

        tracing::debug!(tag = name, members = members.len(), "Tag invalidated");
        self.publish(InvalidationEvent::Tag {
            name: name.to_string(),
            keys: members,
        })
        .await;
        Ok(deleted)
    }

    /// Delete every key under a prefix, batch by batch
    pub async fn purge_prefix(&self, prefix: &str) -> Result<u64> {
        let tally = ErrorTally::new();
        let mut batches = self.store.scan(prefix).chunks(SWEEP_BATCH);
        let mut deleted = 0;

        while let Some(batch) = batches.next().await {
            let batch = batch.into_iter().collect::<Result<Vec<_>>>()?;
            deleted += self.store.delete(&batch, &tally).await?;
        }
        Ok(deleted)
    }

    /// Delete the retrieval entries and tombstones of an old version and
    /// drop them from the tag sets that still list them
    pub async fn sweep_version(&self, old: u64) {
        let prefixes = [
            keys::search_version_prefix(old),
            keys::negative(&keys::search_version_prefix(old)),
        ];

        for prefix in &prefixes {
            match self.purge_prefix(prefix).await {
                Ok(deleted) => tracing::debug!(prefix = %prefix, deleted, "Swept orphaned keys"),
                Err(e) => tracing::warn!(prefix = %prefix, error = %e, "Sweep failed"),
            }
        }

        match self.prune_tags(&prefixes).await {
            Ok(pruned) => tracing::debug!(version = old, pruned, "Pruned tag sets"),
            Err(e) => tracing::warn!(version = old, error = %e, "Tag pruning failed"),
        }
    }

    /// Remove members starting with any of `prefixes` from every tag set
    pub async fn prune_tags(&self, prefixes: &[String]) -> Result<u64> {
        let tally = ErrorTally::new();
        let mut tag_keys = self.store.scan(&keys::tag("")).chunks(SWEEP_BATCH);
        let mut pruned = 0;

        while let Some(batch) = tag_keys.next().await {
            for tag_key in batch.into_iter().collect::<Result<Vec<_>>>()? {
                let stale: Vec<String> = self
                    .store
                    .set_members(&tag_key, &tally)
                    .await?
                    .into_iter()
                    .filter(|member| prefixes.iter().any(|p| member.starts_with(p.as_str())))
                    .collect();
                if !stale.is_empty() {
                    pruned += self.store.remove_from_set(&tag_key, &stale, &tally).await?;
                }
            }
        }
        Ok(pruned)
    }

    /// React to a corpus mutation
    ///
    /// Bumps the version for every change; updates and deletions also
    /// drop the entries tagged with the affected documents. Failures are
    /// logged and never fail the caller's mutation.
    pub async fn on_corpus_change(&self, change: &CorpusChange) {
        if let Err(e) = self.bump_version().await {
            tracing::warn!(namespace = %self.namespace, error = %e, "Version bump failed");
        }

        if matches!(
            change.kind,
            CorpusChangeKind::Updated | CorpusChangeKind::Deleted
        ) {
            for doc_id in &change.doc_ids {
                let tag = keys::doc_tag(doc_id);
                if let Err(e) = self.invalidate_tag(&tag).await {
                    tracing::warn!(tag = %tag, error = %e, "Tag invalidation failed");
                }
            }
        }

        if self.evict_answers {
            if let Err(e) = self.purge_prefix(keys::ANSWER_PREFIX).await {
                tracing::warn!(error = %e, "Answer eviction failed");
            }
        }
    }

    async fn publish(&self, event: InvalidationEvent) {
        match serde_json::to_vec(&InvalidationMessage::new(event)) {
            Ok(payload) => {
                self.store
                    .publish(keys::INVALIDATE_CHANNEL, &payload)
                    .await
            }
            Err(e) => tracing::warn!(error = %e, "Invalidation event not encodable"),
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Applies published invalidation events to a per-process tier
#[derive(Clone)]
pub struct InvalidationListener {
    local: LocalTier,
}

impl InvalidationListener {
    pub fn new(local: LocalTier) -> Self {
        Self { local }
    }

    /// Apply one event
    ///
    /// A version bump clears the whole tier.
    pub async fn apply(&self, message: &InvalidationMessage) {
        match &message.event {
            InvalidationEvent::Key { keys } | InvalidationEvent::Tag { keys, .. } => {
                self.local.invalidate(keys).await;
            }
            InvalidationEvent::VersionBump { .. } => self.local.clear().await,
        }
    }

    /// Subscribe and apply events until `shutdown` fires or the stream ends
    pub async fn spawn(
        self,
        store: &ResilientStore,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mut events = store.subscribe(keys::INVALIDATE_CHANNEL).await?;

        Ok(tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    payload = events.next() => match payload {
                        Some(payload) => payload,
                        None => break,
                    },
                };

                match serde_json::from_slice::<InvalidationMessage>(&payload) {
                    Ok(message) => self.apply(&message).await,
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed invalidation event"),
                }
            }
            tracing::debug!("Invalidation listener stopped");
        }))
    }
}
