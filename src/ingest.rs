//! Ingestion pipeline.
//!
//! Text → validation → windowed chunking → batched embedding → one atomic
//! write of the document and all of its chunks. Nothing is persisted unless
//! every chunk was embedded successfully. Re-ingesting the same source
//! always creates a new document.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use rag_harness_core::chunk::{chunk_text, ChunkParams};
use rag_harness_core::models::{Document, DocumentMetadata};
use rag_harness_core::store::Store;
use rag_harness_core::{Error, Result};

use crate::config::Config;
use crate::embedding::EmbeddingService;

/// Category assigned when the caller supplies none.
pub const DEFAULT_CATEGORY: &str = "general";

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub max_document_bytes: usize,
    pub chunking: ChunkParams,
}

impl From<&Config> for IngestOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_document_bytes: config.ingest.max_document_bytes,
            chunking: config.chunking.params(),
        }
    }
}

/// What an ingestion produced.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub document_id: String,
    pub source: String,
    pub category: String,
    pub chunks: usize,
    pub bytes: usize,
    pub elapsed_ms: f64,
}

pub struct Ingestor<S: Store + ?Sized> {
    store: Arc<S>,
    embedder: Arc<EmbeddingService>,
    options: IngestOptions,
}

impl<S: Store + ?Sized> Ingestor<S> {
    pub fn new(store: Arc<S>, embedder: Arc<EmbeddingService>, options: IngestOptions) -> Self {
        Self {
            store,
            embedder,
            options,
        }
    }

    /// Chunk, embed, and persist `text`, returning the new document's id.
    pub async fn ingest(&self, text: &str, metadata: DocumentMetadata) -> Result<IngestReceipt> {
        let started = Instant::now();

        if text.trim().is_empty() {
            return Err(Error::Ingestion("document text is empty".to_string()));
        }
        if text.len() > self.options.max_document_bytes {
            return Err(Error::Ingestion(format!(
                "document is {} bytes, limit is {}",
                text.len(),
                self.options.max_document_bytes
            )));
        }

        let category = if metadata.category.trim().is_empty() {
            DEFAULT_CATEGORY.to_string()
        } else {
            metadata.category
        };

        let document_id = Uuid::new_v4().to_string();
        let mut chunks = chunk_text(&document_id, text, &self.options.chunking);

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.embedding = vector;
        }

        let doc = Document {
            id: document_id.clone(),
            source: metadata.source,
            category,
            content: text.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.insert_document(&doc, &chunks).await?;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            document_id = %doc.id,
            source = %doc.source,
            chunks = chunks.len(),
            elapsed_ms,
            "ingested document"
        );

        Ok(IngestReceipt {
            document_id,
            source: doc.source,
            category: doc.category,
            chunks: chunks.len(),
            bytes: text.len(),
            elapsed_ms,
        })
    }

    /// Ingest a UTF-8 text file. The source defaults to the file path.
    pub async fn ingest_file(
        &self,
        path: &Path,
        source: Option<String>,
        category: Option<String>,
    ) -> Result<IngestReceipt> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Ingestion(format!("cannot read {}: {}", path.display(), e)))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| Error::Ingestion(format!("{} is not valid UTF-8", path.display())))?;

        let metadata = DocumentMetadata::new(
            source.unwrap_or_else(|| path.display().to_string()),
            category.unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        );
        self.ingest(&text, metadata).await
    }
}
