//! Embedding trait and vector utilities.
//!
//! The core crate knows nothing about embedding backends; it only needs
//! something that can turn a query into a vector. Backends (OpenAI-compatible
//! HTTP, hashing, disabled) live in the server crate and implement
//! [`QueryEmbedder`] through an adapter.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::models::VectorHit;

/// Produces a query vector for semantic retrieval.
#[async_trait]
pub trait QueryEmbedder: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
}

/// Deterministic embedding id: `sha256(project|doc|chunk|model)`, hex.
///
/// Re-upserting the same `(project, doc, chunk, model)` therefore targets
/// the same row.
pub fn embedding_id(project_id: &str, doc_id: &str, chunk_id: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}|{}", project_id, doc_id, chunk_id, model).as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 of a byte slice, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Keep the `k` best hits by score (descending), using quickselect to
/// partition before sorting only the survivors.
pub fn top_k(mut hits: Vec<VectorHit>, k: usize) -> Vec<VectorHit> {
    if k == 0 || hits.is_empty() {
        return Vec::new();
    }
    let by_score_desc = |a: &VectorHit, b: &VectorHit| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    };
    if hits.len() > k {
        hits.select_nth_unstable_by(k - 1, by_score_desc);
        hits.truncate(k);
    }
    hits.sort_by(by_score_desc);
    hits
}

/// Exact cosine search over `(doc_id, chunk_id, vector)` candidates.
///
/// Candidates whose dimension differs from the query are skipped; an empty
/// query yields no hits.
pub fn cosine_search<'a, I>(query: &[f32], candidates: I, k: usize) -> Vec<VectorHit>
where
    I: IntoIterator<Item = (&'a str, &'a str, &'a [f32])>,
{
    if query.is_empty() {
        return Vec::new();
    }
    let hits: Vec<VectorHit> = candidates
        .into_iter()
        .filter(|(_, _, v)| v.len() == query.len())
        .map(|(doc_id, chunk_id, v)| VectorHit {
            doc_id: doc_id.to_string(),
            chunk_id: chunk_id.to_string(),
            score: cosine_similarity(query, v) as f64,
        })
        .collect();
    top_k(hits, k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn embedding_id_is_deterministic() {
        let a = embedding_id("p", "d", "c", "m");
        assert_eq!(a, embedding_id("p", "d", "c", "m"));
        assert_ne!(a, embedding_id("p", "d", "c", "m2"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn search_skips_other_dimensions() {
        let q = [1.0f32, 0.0];
        let a = [1.0f32, 0.0];
        let b = [1.0f32, 0.0, 0.0];
        let hits = cosine_search(&q, vec![("d1", "c1", &a[..]), ("d2", "c2", &b[..])], 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
    }

    #[test]
    fn top_k_orders_descending() {
        let hits = (0..20)
            .map(|i| VectorHit {
                doc_id: "d".into(),
                chunk_id: format!("c{:02}", i),
                score: i as f64 / 20.0,
            })
            .collect();
        let top = top_k(hits, 3);
        let ids: Vec<&str> = top.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c19", "c18", "c17"]);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let a = [1.0f32];
        assert!(cosine_search(&[], vec![("d", "c", &a[..])], 5).is_empty());
    }
}
