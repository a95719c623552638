//! Storage abstraction for the retrieval core.
//!
//! The [`Store`] trait defines all storage operations needed by ingestion
//! and the hybrid retriever, enabling pluggable backends (SQLite behind a
//! connection pool, in-memory for tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::{Chunk, Document, DocumentResponse};

/// A candidate chunk returned from keyword or vector search.
///
/// Carries everything the fusion step and the final result need, so no
/// extra round-trips are made after candidate generation.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    /// Source label of the parent document.
    pub source: String,
    pub chunk_index: i64,
    pub text: String,
    /// Raw score from the backend. Higher is better for both FTS (negated
    /// BM25 rank) and vector search (cosine similarity).
    pub raw_score: f64,
}

/// Row counts used by the stats endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub documents: i64,
    pub chunks: i64,
}

/// Connection pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolState {
    /// Connections currently leased out.
    pub active: usize,
    /// Open connections waiting in the pool.
    pub idle: usize,
    /// Maximum number of connections.
    pub capacity: usize,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_document`](Store::insert_document) | Persist a document and its embedded chunks atomically |
/// | [`get_document`](Store::get_document) | Retrieve a document with its ordered chunks |
/// | [`delete_document`](Store::delete_document) | Remove a document and its chunks |
/// | [`keyword_search`](Store::keyword_search) | Full-text keyword search |
/// | [`vector_search`](Store::vector_search) | Cosine similarity vector search |
/// | [`counts`](Store::counts) | Document and chunk totals |
/// | [`ping`](Store::ping) | Reachability check |
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a document together with all of its chunks.
    ///
    /// Either everything is written or nothing is. Every chunk must carry an
    /// embedding.
    async fn insert_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()>;

    /// Retrieve a full document with all its chunks, by ID.
    async fn get_document(&self, id: &str) -> Result<Option<DocumentResponse>>;

    /// Delete a document and its chunks. Returns `false` if it did not exist.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    /// Full-text search over chunk text, best first.
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>>;

    /// Nearest chunks by cosine similarity, best first.
    async fn vector_search(&self, query_vec: &[f32], limit: usize)
        -> Result<Vec<ChunkCandidate>>;

    async fn counts(&self) -> Result<StoreCounts>;

    /// Succeeds when the backend can serve a trivial query.
    async fn ping(&self) -> Result<()>;

    /// Pool occupancy, for backends that pool connections.
    fn pool_state(&self) -> Option<PoolState> {
        None
    }
}
