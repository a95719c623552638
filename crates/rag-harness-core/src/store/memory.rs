//! In-memory [`Store`] implementation for testing.
//!
//! Uses `HashMap` behind `std::sync::RwLock` for thread safety. Vector
//! search is brute-force cosine similarity over all stored chunks. Keyword
//! search scores a chunk by how many distinct query terms it contains.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::{cosine_similarity, tokenize};
use crate::error::{Error, Result};
use crate::models::{Chunk, ChunkResponse, Document, DocumentResponse};

use super::{ChunkCandidate, Store, StoreCounts};

struct StoredDoc {
    doc: Document,
    chunks: Vec<Chunk>,
}

/// In-memory store for tests and embedding-free experiments.
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, StoredDoc>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Retrieval("in-memory store lock poisoned".to_string())
}

fn sort_best_first(candidates: &mut [ChunkCandidate]) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_index.cmp(&b.chunk_index))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
}

fn candidate(doc: &Document, chunk: &Chunk, raw_score: f64) -> ChunkCandidate {
    ChunkCandidate {
        chunk_id: chunk.id.clone(),
        document_id: doc.id.clone(),
        source: doc.source.clone(),
        chunk_index: chunk.chunk_index,
        text: chunk.text.clone(),
        raw_score,
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        if let Some(c) = chunks.iter().find(|c| c.embedding.is_empty()) {
            return Err(Error::Ingestion(format!(
                "chunk {} has no embedding",
                c.chunk_index
            )));
        }
        let mut docs = self
            .docs
            .write()
            .map_err(|_| Error::Ingestion("in-memory store lock poisoned".to_string()))?;
        if docs.contains_key(&doc.id) {
            return Err(Error::Ingestion(format!("document {} already exists", doc.id)));
        }
        docs.insert(
            doc.id.clone(),
            StoredDoc {
                doc: doc.clone(),
                chunks: chunks.to_vec(),
            },
        );
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentResponse>> {
        let docs = self.docs.read().map_err(poisoned)?;
        let stored = match docs.get(id) {
            Some(s) => s,
            None => return Ok(None),
        };

        let mut chunks: Vec<ChunkResponse> = stored
            .chunks
            .iter()
            .map(|c| ChunkResponse {
                index: c.chunk_index,
                start: c.start,
                text: c.text.clone(),
            })
            .collect();
        chunks.sort_by_key(|c| c.index);

        Ok(Some(DocumentResponse {
            id: stored.doc.id.clone(),
            source: stored.doc.source.clone(),
            category: stored.doc.category.clone(),
            content: stored.doc.content.clone(),
            created_at: stored.doc.created_at,
            chunks,
        }))
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        Ok(docs.remove(id).is_some())
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>> {
        let query_lower = query.to_lowercase();
        let terms: HashSet<&str> = tokenize(&query_lower).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let docs = self.docs.read().map_err(poisoned)?;
        let mut candidates: Vec<ChunkCandidate> = docs
            .values()
            .flat_map(|s| s.chunks.iter().map(move |c| (&s.doc, c)))
            .filter_map(|(doc, chunk)| {
                let text_lower = chunk.text.to_lowercase();
                let words: HashSet<&str> = tokenize(&text_lower).collect();
                let matches = terms.iter().filter(|t| words.contains(*t)).count();
                (matches > 0).then(|| candidate(doc, chunk, matches as f64))
            })
            .collect();

        sort_best_first(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let docs = self.docs.read().map_err(poisoned)?;
        let mut candidates: Vec<ChunkCandidate> = docs
            .values()
            .flat_map(|s| s.chunks.iter().map(move |c| (&s.doc, c)))
            .map(|(doc, chunk)| {
                let sim = cosine_similarity(query_vec, &chunk.embedding) as f64;
                candidate(doc, chunk, sim)
            })
            .collect();

        sort_best_first(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(StoreCounts {
            documents: docs.len() as i64,
            chunks: docs.values().map(|s| s.chunks.len() as i64).sum(),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.docs.read().map_err(poisoned).map(|_| ())
    }
}
