//! Cache keyspace layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `embed:{model}:{text-fp}` | little-endian f32 vector |
//! | `search:{version}:{query-fp}:k{n}` | JSON document list |
//! | `answer:{model}:{query-fp}:{context-fp}:{decoding-fp}` | UTF-8 answer |
//! | `semantic:{model}:{context-fp}:{decoding-fp}` | JSON semantic index |
//! | `neg:{key}` | tombstone |
//! | `tag:{name}` | set of keys |
//! | `lock:{key}` | holder nonce |
//! | `version:{namespace}` | integer counter |
//! | `metrics:cache:{layer}:{class}` | integer counter |

/// Channel carrying invalidation events
pub const INVALIDATE_CHANNEL: &str = "invalidate";

pub const ANSWER_PREFIX: &str = "answer:";

pub fn embed(model_id: &str, text_fp: &str) -> String {
    format!("embed:{model_id}:{text_fp}")
}

pub fn search(version: u64, query_fp: &str, k: usize) -> String {
    format!("search:{version}:{query_fp}:k{k}")
}

/// Prefix shared by every retrieval entry of one corpus version
pub fn search_version_prefix(version: u64) -> String {
    format!("search:{version}:")
}

pub fn answer(model_id: &str, query_fp: &str, context_fp: &str, decoding_fp: &str) -> String {
    format!("answer:{model_id}:{query_fp}:{context_fp}:{decoding_fp}")
}

pub fn semantic(model_id: &str, context_fp: &str, decoding_fp: &str) -> String {
    format!("semantic:{model_id}:{context_fp}:{decoding_fp}")
}

pub fn negative(key: &str) -> String {
    format!("neg:{key}")
}

pub fn lock(key: &str) -> String {
    format!("lock:{key}")
}

pub fn tag(name: &str) -> String {
    format!("tag:{name}")
}

/// Tag grouping every entry derived from one document
pub fn doc_tag(doc_id: &str) -> String {
    format!("doc:{doc_id}")
}

pub fn version(namespace: &str) -> String {
    format!("version:{namespace}")
}

pub fn metrics(layer: &str, class: &str) -> String {
    format!("metrics:cache:{layer}:{class}")
}
