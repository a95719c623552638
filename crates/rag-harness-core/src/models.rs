//! Core data models used throughout the retrieval core.
//!
//! A [`Document`] owns one or more [`Chunk`]s. Both are created once, during
//! ingestion, and never mutated afterwards.

use serde::{Deserialize, Serialize};

/// Caller-supplied metadata attached to a document at ingestion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Where the text came from (a path, URL, or free-form label).
    pub source: String,
    /// Coarse grouping label.
    pub category: String,
}

impl DocumentMetadata {
    pub fn new(source: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            category: category.into(),
        }
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub category: String,
    /// Full original text.
    pub content: String,
    /// Unix timestamp (seconds) of ingestion.
    pub created_at: i64,
}

/// A bounded window of a document's text plus its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Zero-based ordinal, contiguous within a document.
    pub chunk_index: i64,
    /// Byte offset of this window in the document text.
    pub start: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    /// Empty until the embedding service fills it in.
    pub embedding: Vec<f32>,
}

impl Chunk {
    /// Byte offset one past the end of this window in the document text.
    pub fn end(&self) -> usize {
        self.start + self.text.len()
    }
}

/// Full document response including its ordered chunks.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub id: String,
    pub source: String,
    pub category: String,
    pub content: String,
    pub created_at: i64,
    pub chunks: Vec<ChunkResponse>,
}

/// A single chunk within a [`DocumentResponse`].
#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub index: i64,
    pub start: usize,
    pub text: String,
}
