//! Deterministic key derivation
//!
//! Inputs are normalized (lowercased, whitespace collapsed and trimmed, then
//! passed through an optional domain normalizer) and digested with SHA-256
//! under a namespace. The digest is truncated to [`FINGERPRINT_BYTES`] and
//! hex-encoded. At 128 bits a collision among even 10^12 keys has
//! probability below 10^-14.

use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use strata_core::{DecodingParams, Document, Result, StrataError};

/// Bytes kept from the SHA-256 digest
pub const FINGERPRINT_BYTES: usize = 16;

const TEXT_NAMESPACE: &str = "text";
const CONTEXT_NAMESPACE: &str = "context";
const DECODING_NAMESPACE: &str = "decoding";

/// Domain-specific normalization applied after the generic steps
pub trait Normalizer: Send + Sync {
    fn normalize(&self, text: &str) -> String;
}

impl<F> Normalizer for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn normalize(&self, text: &str) -> String {
        self(text)
    }
}

/// A query after normalization, with its fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    /// Normalized text; this is what the embedding provider sees
    pub text: String,

    /// Fingerprint of `text`
    pub fingerprint: String,
}

/// Derives fingerprints for cache keys
#[derive(Clone, Default)]
pub struct Fingerprinter {
    normalizer: Option<Arc<dyn Normalizer>>,
}

impl fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fingerprinter")
            .field("normalizer", &self.normalizer.is_some())
            .finish()
    }
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a domain normalizer
    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Normalize text
    ///
    /// Empty input (after normalization) is a usage error.
    pub fn normalize(&self, text: &str) -> Result<String> {
        let collapsed = text
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        let normalized = match &self.normalizer {
            Some(normalizer) => normalizer.normalize(&collapsed),
            None => collapsed,
        };

        if normalized.is_empty() {
            return Err(StrataError::Usage("query text is empty".to_string()));
        }
        Ok(normalized)
    }

    /// Normalize raw bytes that must be UTF-8 text
    pub fn normalize_bytes(&self, bytes: &[u8]) -> Result<String> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| StrataError::Usage(format!("query is not valid UTF-8: {e}")))?;
        self.normalize(text)
    }

    /// Normalize and fingerprint a query
    pub fn query(&self, text: &str) -> Result<NormalizedQuery> {
        let text = self.normalize(text)?;
        let fingerprint = digest(TEXT_NAMESPACE, text.as_bytes());
        Ok(NormalizedQuery { text, fingerprint })
    }
}

/// Namespaced, truncated SHA-256 of `input`
pub fn digest(namespace: &str, input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(input);
    let hash = hasher.finalize();
    hex::encode(&hash[..FINGERPRINT_BYTES])
}

/// Fingerprint of an ordered context
///
/// Covers id and snippet of every document in order. Scores do not change
/// the generated answer and are left out.
pub fn context(documents: &[Document]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(CONTEXT_NAMESPACE.as_bytes());
    hasher.update([0u8]);
    for doc in documents {
        hasher.update(doc.id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(doc.snippet.as_bytes());
        hasher.update([0x1e]);
    }
    let hash = hasher.finalize();
    hex::encode(&hash[..FINGERPRINT_BYTES])
}

/// Fingerprint of decoding parameters
pub fn decoding(params: &DecodingParams) -> Result<String> {
    let canonical = serde_json::to_vec(params)?;
    Ok(digest(DECODING_NAMESPACE, &canonical))
}
