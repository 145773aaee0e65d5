//! Byte encodings of cache records

use strata_core::{Document, Result, StrataError};

/// Stored at `neg:{key}` when the underlying lookup found nothing
pub const TOMBSTONE: &[u8] = &[0x00];

pub fn is_tombstone(bytes: &[u8]) -> bool {
    bytes == TOMBSTONE
}

/// Encode a vector as little-endian `f32`s
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a vector, checking its dimension when one is expected
pub fn decode_embedding(bytes: &[u8], expected_dimension: Option<usize>) -> Result<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(StrataError::Serialization(format!(
            "embedding record of {} bytes is not a f32 array",
            bytes.len()
        )));
    }

    let embedding: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    match expected_dimension {
        Some(expected) if expected != embedding.len() => Err(StrataError::DimensionMismatch {
            expected,
            actual: embedding.len(),
        }),
        _ => Ok(embedding),
    }
}

/// Encode a ranked document list, keeping provider order
pub fn encode_documents(documents: &[Document]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(documents)?)
}

pub fn decode_documents(bytes: &[u8]) -> Result<Vec<Document>> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_answer(answer: &str) -> Vec<u8> {
    answer.as_bytes().to_vec()
}

pub fn decode_answer(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|e| StrataError::Serialization(format!("answer record is not UTF-8: {e}")))
}
