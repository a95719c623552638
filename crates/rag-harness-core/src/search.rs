//! Hybrid retrieval over a [`Store`].
//!
//! The core search algorithm operates entirely through the [`Store`] trait,
//! with no database or configuration dependencies. The calling application
//! is responsible for embedding the query and passing the store.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch `candidate_multiplier × k` vector candidates (cosine similarity).
//! 2. Fetch `candidate_multiplier × k` keyword candidates (FTS rank).
//! 3. Normalize both sets to `[0, 1]` using min-max normalization.
//! 4. Merge by chunk id: `score = α × vector + (1 - α) × lexical`, where a
//!    chunk missing from one set contributes 0 for that side.
//! 5. Sort by score (desc), chunk index (asc), chunk id (asc).
//! 6. Truncate to `k`.
//!
//! `Vector` and `Threshold` modes skip the keyword side and report raw
//! cosine similarity, so a threshold keeps its absolute meaning.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::embedding::tokenize;
use crate::error::{Error, Result};
use crate::store::{ChunkCandidate, Store};

/// Default semantic weight for hybrid fusion.
pub const DEFAULT_ALPHA: f64 = 0.7;

/// How results are scored and filtered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SearchMode {
    /// Pure semantic ranking by cosine similarity.
    Vector,
    /// Weighted fusion of normalized vector and lexical scores.
    Hybrid { alpha: f64 },
    /// Semantic ranking, dropping anything below `min_score`.
    Threshold { min_score: f64 },
}

impl SearchMode {
    pub fn hybrid(alpha: f64) -> Result<Self> {
        if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
            return Err(Error::InvalidRequest(format!(
                "alpha must be within [0, 1], got {}",
                alpha
            )));
        }
        Ok(SearchMode::Hybrid { alpha })
    }

    pub fn threshold(min_score: f64) -> Result<Self> {
        if !min_score.is_finite() || !(-1.0..=1.0).contains(&min_score) {
            return Err(Error::InvalidRequest(format!(
                "threshold must be within [-1, 1], got {}",
                min_score
            )));
        }
        Ok(SearchMode::Threshold { min_score })
    }

    /// Build a mode from loosely-typed request fields.
    ///
    /// With no explicit mode, a threshold selects `threshold` mode and
    /// anything else selects `hybrid`.
    pub fn from_parts(
        mode: Option<&str>,
        threshold: Option<f64>,
        alpha: Option<f64>,
        default_alpha: f64,
    ) -> Result<Self> {
        let mode = match (mode, threshold) {
            (Some(m), _) => m.trim().to_ascii_lowercase(),
            (None, Some(_)) => "threshold".to_string(),
            (None, None) => "hybrid".to_string(),
        };

        match mode.as_str() {
            "vector" => Ok(SearchMode::Vector),
            "hybrid" => Self::hybrid(alpha.unwrap_or(default_alpha)),
            "threshold" => match threshold {
                Some(t) => Self::threshold(t),
                None => Err(Error::InvalidRequest(
                    "threshold mode requires a threshold".to_string(),
                )),
            },
            other => Err(Error::InvalidRequest(format!(
                "unknown search mode: {}. Use vector, hybrid, or threshold.",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Hybrid { .. } => "hybrid",
            SearchMode::Threshold { .. } => "threshold",
        }
    }
}

/// A validated retrieval request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    pub k: usize,
    pub mode: SearchMode,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, k: usize, mode: SearchMode) -> Result<Self> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(Error::InvalidRequest("query must not be empty".to_string()));
        }
        if k == 0 {
            return Err(Error::InvalidRequest("k must be at least 1".to_string()));
        }
        Ok(Self { query, k, mode })
    }
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    /// Each side fetches `candidate_multiplier × k` candidates.
    pub candidate_multiplier: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            candidate_multiplier: 4,
        }
    }
}

/// One ranked passage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub source: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f64,
    /// Vector component (raw cosine, or normalized in hybrid mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f64>,
    /// Normalized lexical component (hybrid mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f64>,
}

/// Per-request latency breakdown in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Timing {
    pub embedding_ms: f64,
    pub search_ms: f64,
    pub total_ms: f64,
    pub cached: bool,
}

/// Results of one retrieval, as returned to callers and stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub mode: SearchMode,
    pub k: usize,
    pub results: Vec<RankedChunk>,
    pub timing: Timing,
}

/// Distinct lowercase alphanumeric terms of `query`, in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut terms: Vec<String> = Vec::new();
    for t in tokenize(&lowered) {
        if !terms.iter().any(|seen| seen == t) {
            terms.push(t.to_string());
        }
    }
    terms
}

/// Run a retrieval against a [`Store`] backend.
///
/// `query_vec` must be the embedding of `req.query`. An empty result is not
/// an error.
pub async fn search<S: Store + ?Sized>(
    store: &S,
    req: &QueryRequest,
    query_vec: &[f32],
    params: &SearchParams,
) -> Result<Vec<RankedChunk>> {
    let limit = req.k.saturating_mul(params.candidate_multiplier.max(1));

    let mut results = match req.mode {
        SearchMode::Vector => store
            .vector_search(query_vec, limit)
            .await?
            .into_iter()
            .map(from_vector)
            .collect(),
        SearchMode::Threshold { min_score } => store
            .vector_search(query_vec, limit)
            .await?
            .into_iter()
            .filter(|c| c.raw_score >= min_score)
            .map(from_vector)
            .collect(),
        SearchMode::Hybrid { alpha } => {
            let vector = store.vector_search(query_vec, limit).await?;
            let terms = query_terms(&req.query);
            let lexical = if terms.is_empty() {
                Vec::new()
            } else {
                store.keyword_search(&terms.join(" "), limit).await?
            };
            fuse(&vector, &lexical, alpha)
        }
    };

    sort_ranked(&mut results);
    results.truncate(req.k);
    Ok(results)
}

fn from_vector(c: ChunkCandidate) -> RankedChunk {
    RankedChunk {
        score: c.raw_score,
        vector_score: Some(c.raw_score),
        lexical_score: None,
        chunk_id: c.chunk_id,
        document_id: c.document_id,
        source: c.source,
        chunk_index: c.chunk_index,
        text: c.text,
    }
}

/// Merge vector and lexical candidates into fused, deduplicated results.
pub fn fuse(vector: &[ChunkCandidate], lexical: &[ChunkCandidate], alpha: f64) -> Vec<RankedChunk> {
    let norm_vector = normalize_scores(vector);
    let norm_lexical = normalize_scores(lexical);

    let lex_map: HashMap<&str, f64> = norm_lexical
        .iter()
        .map(|(c, s)| (c.chunk_id.as_str(), *s))
        .collect();

    let mut merged: HashMap<&str, RankedChunk> = HashMap::new();

    for (c, v) in &norm_vector {
        let l = lex_map.get(c.chunk_id.as_str()).copied();
        merged.entry(c.chunk_id.as_str()).or_insert_with(|| RankedChunk {
            chunk_id: c.chunk_id.clone(),
            document_id: c.document_id.clone(),
            source: c.source.clone(),
            chunk_index: c.chunk_index,
            text: c.text.clone(),
            score: alpha * v + (1.0 - alpha) * l.unwrap_or(0.0),
            vector_score: Some(*v),
            lexical_score: l,
        });
    }
    for (c, l) in &norm_lexical {
        merged.entry(c.chunk_id.as_str()).or_insert_with(|| RankedChunk {
            chunk_id: c.chunk_id.clone(),
            document_id: c.document_id.clone(),
            source: c.source.clone(),
            chunk_index: c.chunk_index,
            text: c.text.clone(),
            score: (1.0 - alpha) * l,
            vector_score: None,
            lexical_score: Some(*l),
        });
    }

    merged.into_values().collect()
}

/// Score descending, then chunk index ascending, then chunk id.
pub fn sort_ranked(results: &mut [RankedChunk]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.chunk_index.cmp(&b.chunk_index))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_text, ChunkParams};
    use crate::embedding::{EmbeddingProvider, HashEmbedder};
    use crate::models::Document;
    use crate::store::memory::InMemoryStore;

    fn make_candidate(chunk_id: &str, index: i64, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: chunk_id.to_string(),
            document_id: "d1".to_string(),
            source: "test".to_string(),
            chunk_index: index,
            text: String::new(),
            raw_score: score,
        }
    }

    async fn seeded_store(embedder: &HashEmbedder, docs: &[(&str, &str)]) -> InMemoryStore {
        let store = InMemoryStore::new();
        for (id, text) in docs {
            let mut chunks = chunk_text(id, text, &ChunkParams::new(40, 10));
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            for (c, v) in chunks.iter_mut().zip(embedder.embed(&texts).unwrap()) {
                c.embedding = v;
            }
            let doc = Document {
                id: id.to_string(),
                source: format!("{}.txt", id),
                category: "general".to_string(),
                content: text.to_string(),
                created_at: 0,
            };
            store.insert_document(&doc, &chunks).await.unwrap();
        }
        store
    }

    fn embed_query(embedder: &HashEmbedder, q: &str) -> Vec<f32> {
        embedder.embed(&[q.to_string()]).unwrap().remove(0)
    }

    const NEO4J: &str = "Neo4j is a graph database. It stores data as nodes and relationships.";

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_single() {
        let candidates = vec![make_candidate("c1", 0, 5.0)];
        let result = normalize_scores(&candidates);
        assert_eq!(result.len(), 1);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("c1", 0, 10.0),
            make_candidate("c2", 1, 5.0),
            make_candidate("c3", 2, 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let candidates = vec![make_candidate("c1", 0, 3.0), make_candidate("c2", 1, 3.0)];
        for (_, score) in normalize_scores(&candidates) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_fuse_weights_and_dedupes() {
        let vector = vec![make_candidate("a", 0, 0.9), make_candidate("b", 1, 0.1)];
        let lexical = vec![make_candidate("b", 1, 8.0), make_candidate("c", 2, 2.0)];
        let mut fused = fuse(&vector, &lexical, 0.7);
        sort_ranked(&mut fused);

        assert_eq!(fused.len(), 3);
        let by_id: HashMap<&str, f64> =
            fused.iter().map(|r| (r.chunk_id.as_str(), r.score)).collect();
        assert!((by_id["a"] - 0.7).abs() < 1e-9);
        assert!((by_id["b"] - 0.3).abs() < 1e-9);
        assert!(by_id["c"].abs() < 1e-9);
        assert_eq!(fused[0].chunk_id, "a");
    }

    #[test]
    fn test_ties_break_by_chunk_index() {
        let mut results = fuse(
            &[make_candidate("z", 2, 1.0), make_candidate("y", 0, 1.0), make_candidate("x", 1, 1.0)],
            &[],
            1.0,
        );
        sort_ranked(&mut results);
        let order: Vec<i64> = results.iter().map(|r| r.chunk_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_mode_validation() {
        assert!(SearchMode::hybrid(1.5).is_err());
        assert!(SearchMode::hybrid(f64::NAN).is_err());
        assert!(SearchMode::threshold(2.0).is_err());
        assert_eq!(
            SearchMode::from_parts(None, None, None, DEFAULT_ALPHA).unwrap(),
            SearchMode::Hybrid { alpha: 0.7 }
        );
        assert_eq!(
            SearchMode::from_parts(None, Some(0.5), None, DEFAULT_ALPHA).unwrap(),
            SearchMode::Threshold { min_score: 0.5 }
        );
        assert!(SearchMode::from_parts(Some("threshold"), None, None, 0.7).is_err());
        assert!(SearchMode::from_parts(Some("bm25"), None, None, 0.7).is_err());
        assert_eq!(
            SearchMode::from_parts(Some("Vector"), None, None, 0.7).unwrap(),
            SearchMode::Vector
        );
    }

    #[test]
    fn test_request_validation() {
        assert!(QueryRequest::new("   ", 3, SearchMode::Vector).is_err());
        assert!(QueryRequest::new("hello", 0, SearchMode::Vector).is_err());
        assert!(QueryRequest::new("hello", 1, SearchMode::Vector).is_ok());
    }

    #[test]
    fn test_query_terms_dedupes() {
        assert_eq!(query_terms("What is Neo4j? what IS it"), vec!["what", "is", "neo4j", "it"]);
        assert!(query_terms("?!").is_empty());
    }

    #[tokio::test]
    async fn test_hybrid_finds_graph_database_chunk() {
        let embedder = HashEmbedder::new(384);
        let store = seeded_store(&embedder, &[("d1", NEO4J)]).await;
        let req = QueryRequest::new("What is Neo4j?", 1, SearchMode::Hybrid { alpha: 0.7 }).unwrap();
        let qv = embed_query(&embedder, &req.query);

        let results = search(&store, &req, &qv, &SearchParams::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].text.contains("graph database"));
        assert!(results[0].score > 0.0);
        assert_eq!(results[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn test_threshold_can_return_nothing() {
        let embedder = HashEmbedder::new(384);
        let store = seeded_store(&embedder, &[("d1", NEO4J)]).await;
        let req = QueryRequest::new("weather forecast", 5, SearchMode::threshold(0.9).unwrap()).unwrap();
        let qv = embed_query(&embedder, &req.query);

        let results = search(&store, &req, &qv, &SearchParams::default()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_vector_mode_reports_raw_cosine_sorted() {
        let embedder = HashEmbedder::new(384);
        let store = seeded_store(
            &embedder,
            &[("d1", NEO4J), ("d2", "Postgres is a relational database with tables and rows.")],
        )
        .await;
        let req = QueryRequest::new("relational tables", 3, SearchMode::Vector).unwrap();
        let qv = embed_query(&embedder, &req.query);

        let results = search(&store, &req, &qv, &SearchParams::default()).await.unwrap();
        assert!(results.len() <= 3);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for r in &results {
            assert!(r.score <= 1.0 + 1e-6 && r.score >= -1.0 - 1e-6);
            assert_eq!(r.vector_score, Some(r.score));
        }
        assert_eq!(results[0].document_id, "d2");
    }

    #[tokio::test]
    async fn test_empty_store_is_not_an_error() {
        let embedder = HashEmbedder::new(64);
        let store = InMemoryStore::new();
        let req = QueryRequest::new("anything", 3, SearchMode::Hybrid { alpha: 0.5 }).unwrap();
        let qv = embed_query(&embedder, &req.query);
        let results = search(&store, &req, &qv, &SearchParams::default()).await.unwrap();
        assert!(results.is_empty());
    }
}
