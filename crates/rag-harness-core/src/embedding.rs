//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, the offline [`HashEmbedder`], and pure helper functions for
//! vector serialization, validation, and similarity computation.
//!
//! Model-backed providers (fastembed) and the async batching service live
//! in the `rag-harness` app crate.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Trait for embedding providers.
///
/// `embed` is synchronous and may be CPU-heavy; async callers are expected
/// to run it on a blocking thread. Implementations that hold mutable model
/// state must serialize access internally.
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"bge-small-en-v1.5"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `384`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one of
/// `dims` buckets with a hash-derived sign, then the vector is L2
/// normalized. Texts that share words land close together, which is enough
/// for offline use and tests. Results are identical across platforms and
/// processes.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
    name: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(8);
        Self {
            dims,
            name: format!("hash-{}", dims),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        let mut tokens = tokenize(&lowered).peekable();

        if tokens.peek().is_none() {
            // Punctuation-only windows still need a usable vector.
            if !text.is_empty() {
                self.accumulate(&mut vec, text);
            }
        } else {
            for token in tokens {
                self.accumulate(&mut vec, token);
            }
            // Colliding tokens with opposite signs can cancel out entirely.
            if vec.iter().all(|v| *v == 0.0) {
                self.accumulate(&mut vec, &lowered);
            }
        }

        normalize(&mut vec);
        vec
    }

    fn accumulate(&self, vec: &mut [f32], token: &str) {
        let digest = Sha256::digest(token.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let idx = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vec[idx] += sign;
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Split lowercase text into alphanumeric word tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
}

fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Check a provider's output before it is used or persisted.
///
/// Rejects a wrong vector count, a wrong dimension, non-finite components,
/// and all-zero vectors.
pub fn validate_vectors(expected: usize, dims: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected {
        return Err(Error::Embedding(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            expected
        )));
    }

    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dims {
            return Err(Error::Embedding(format!(
                "vector {} has dimension {}, expected {}",
                i,
                v.len(),
                dims
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(Error::Embedding(format!(
                "vector {} contains non-finite values",
                i
            )));
        }
        if v.iter().all(|x| *x == 0.0) {
            return Err(Error::Embedding(format!("vector {} is all zeros", i)));
        }
    }

    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use rag_harness_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn embed(e: &HashEmbedder, text: &str) -> Vec<f32> {
        e.embed(&[text.to_string()]).unwrap().remove(0)
    }

    #[test]
    fn test_cancelling_tokens_still_embed() {
        // "w17" and "w20" share a bucket at 384 dims with opposite signs.
        let e = HashEmbedder::new(384);
        let vectors = e.embed(&["w17 w20".to_string()]).unwrap();
        validate_vectors(1, 384, &vectors).unwrap();

        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(vectors[0], embed(&e, "W17 W20"));
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_hash_embedder_deterministic() {
        let e = HashEmbedder::new(384);
        let a = embed(&e, "Neo4j is a graph database.");
        let b = embed(&e, "Neo4j is a graph database.");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_shared_words_are_closer() {
        let e = HashEmbedder::new(384);
        let q = embed(&e, "What is Neo4j?");
        let related = embed(&e, "Neo4j is a graph database.");
        let unrelated = embed(&e, "Sunny weather tomorrow afternoon");
        assert!(cosine_similarity(&q, &related) > cosine_similarity(&q, &unrelated));
        assert!(cosine_similarity(&q, &related) > 0.0);
    }

    #[test]
    fn test_hash_embedder_case_insensitive() {
        let e = HashEmbedder::new(64);
        assert_eq!(embed(&e, "Graph DATABASE"), embed(&e, "graph database"));
    }

    #[test]
    fn test_hash_embedder_punctuation_only_is_nonzero() {
        let e = HashEmbedder::new(64);
        let v = embed(&e, "...");
        assert!(validate_vectors(1, 64, &[v]).is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_vector() {
        let err = validate_vectors(1, 3, &[vec![0.0, 0.0, 0.0]]).unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
    }

    #[test]
    fn test_validate_rejects_wrong_dims_and_count() {
        assert!(validate_vectors(1, 3, &[vec![1.0, 0.0]]).is_err());
        assert!(validate_vectors(2, 2, &[vec![1.0, 0.0]]).is_err());
        assert!(validate_vectors(1, 2, &[vec![f32::NAN, 1.0]]).is_err());
        assert!(validate_vectors(1, 2, &[vec![0.5, 1.0]]).is_ok());
    }

    #[test]
    fn test_tokenize() {
        let tokens: Vec<&str> = tokenize("what is neo4j? it's a graph-db").collect();
        assert_eq!(tokens, vec!["what", "is", "neo4j", "it", "s", "a", "graph", "db"]);
    }
}
