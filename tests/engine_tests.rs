use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use rag_harness::config::Config;
use rag_harness::embedding::EmbeddingService;
use rag_harness::engine::{EngineOptions, RagEngine};
use rag_harness::sqlite_store::SqliteStore;
use rag_harness_core::embedding::HashEmbedder;
use rag_harness_core::models::{Chunk, Document, DocumentMetadata, DocumentResponse};
use rag_harness_core::search::SearchMode;
use rag_harness_core::store::memory::InMemoryStore;
use rag_harness_core::store::{ChunkCandidate, Store, StoreCounts};
use rag_harness_core::{Error, Result};

const NEO4J: &str = "Neo4j is a graph database. It stores data as nodes and relationships.";

fn test_config(dir: &Path) -> Config {
    let mut cfg = Config::minimal(dir.join("data").join("rag.sqlite"));
    cfg.chunking.max_chars = 40;
    cfg.chunking.overlap_chars = 10;
    cfg.pool.size = 4;
    cfg.pool.acquire_timeout_ms = 2_000;
    cfg
}

async fn engine_with(cfg: &Config) -> RagEngine<SqliteStore> {
    RagEngine::from_config(cfg).await.unwrap()
}

async fn setup() -> (TempDir, RagEngine<SqliteStore>) {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&test_config(tmp.path())).await;
    (tmp, engine)
}

#[tokio::test]
async fn test_neo4j_hybrid_query_and_cache_hit() {
    let (_tmp, engine) = setup().await;
    let receipt = engine
        .ingest(NEO4J, DocumentMetadata::new("wiki", "databases"))
        .await
        .unwrap();
    assert!(receipt.chunks >= 2);

    let req = engine.request("What is Neo4j?", Some(1), None, None, None).unwrap();
    assert!(matches!(req.mode, SearchMode::Hybrid { .. }));

    let first = engine.query(&req).await.unwrap();
    assert_eq!(first.results.len(), 1);
    assert!(first.results[0].text.contains("graph database"));
    assert!(first.results[0].score > 0.0);
    assert_eq!(first.results[0].document_id, receipt.document_id);
    assert!(!first.timing.cached);
    assert_eq!(engine.live_retrievals(), 1);

    let second = engine.query(&req).await.unwrap();
    assert!(second.timing.cached);
    assert_eq!(second.results, first.results);
    assert_eq!(engine.live_retrievals(), 1);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert!((stats.cache_hit_rate - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_cache_hit_echoes_request_query() {
    let (_tmp, engine) = setup().await;
    engine
        .ingest(NEO4J, DocumentMetadata::new("wiki", "databases"))
        .await
        .unwrap();

    let first = engine
        .query(&engine.request("What is Neo4j?", Some(1), None, None, None).unwrap())
        .await
        .unwrap();
    assert_eq!(first.query, "What is Neo4j?");

    // Same fingerprint after normalization, different spelling.
    let req = engine
        .request("  what IS neo4j? ", Some(1), None, None, None)
        .unwrap();
    let second = engine.query(&req).await.unwrap();
    assert!(second.timing.cached);
    assert_eq!(second.query, req.query);
    assert_ne!(second.query, first.query);
    assert_eq!(second.results, first.results);
}

/// Delegates to an in-memory store but stalls every vector search.
struct SlowVectorStore {
    inner: InMemoryStore,
    delay: Duration,
}

#[async_trait]
impl Store for SlowVectorStore {
    async fn insert_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        self.inner.insert_document(doc, chunks).await
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentResponse>> {
        self.inner.get_document(id).await
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        self.inner.delete_document(id).await
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>> {
        self.inner.keyword_search(query, limit).await
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<ChunkCandidate>> {
        tokio::time::sleep(self.delay).await;
        self.inner.vector_search(query_vec, limit).await
    }

    async fn counts(&self) -> Result<StoreCounts> {
        self.inner.counts().await
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_write_during_query_keeps_result_out_of_cache() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(SlowVectorStore {
        inner: InMemoryStore::new(),
        delay: Duration::from_millis(200),
    });
    let embedder = Arc::new(EmbeddingService::new(Arc::new(HashEmbedder::new(384)), 16));
    let options = EngineOptions::from(&Config::minimal(tmp.path().join("unused.sqlite")));
    let engine = Arc::new(RagEngine::new(store, embedder, options));

    let req = engine.request("graph database", Some(2), None, None, None).unwrap();
    let in_flight = {
        let engine = Arc::clone(&engine);
        let req = req.clone();
        tokio::spawn(async move { engine.query(&req).await.unwrap() })
    };

    // Lands while the query above is stalled in vector search.
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
        .ingest(NEO4J, DocumentMetadata::new("wiki", "databases"))
        .await
        .unwrap();

    let stale = in_flight.await.unwrap();
    assert!(!stale.timing.cached);
    assert_eq!(engine.cache().len(), 0);

    let fresh = engine.query(&req).await.unwrap();
    assert!(!fresh.timing.cached);
    assert!(!fresh.results.is_empty());
    assert!(fresh.results[0].text.contains("graph database"));
    assert_eq!(engine.live_retrievals(), 2);
}

#[tokio::test]
async fn test_threshold_filters_unrelated_query() {
    let (_tmp, engine) = setup().await;
    engine
        .ingest(NEO4J, DocumentMetadata::new("wiki", "databases"))
        .await
        .unwrap();

    let req = engine
        .request("weather forecast", Some(5), Some("threshold"), Some(0.9), None)
        .unwrap();
    let response = engine.query(&req).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_threshold_flag_implies_threshold_mode() {
    let (_tmp, engine) = setup().await;
    let req = engine.request("anything", None, None, Some(0.2), None).unwrap();
    assert!(matches!(req.mode, SearchMode::Threshold { .. }));
    assert_eq!(req.k, 5);

    let err = engine
        .request("anything", None, Some("threshold"), None, None)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_query_empty_store_returns_nothing() {
    let (_tmp, engine) = setup().await;
    let req = engine.request("graph", Some(3), None, None, None).unwrap();
    let response = engine.query(&req).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_vector_mode_ranks_related_document_first() {
    let (_tmp, engine) = setup().await;
    engine
        .ingest(NEO4J, DocumentMetadata::new("neo4j", "databases"))
        .await
        .unwrap();
    engine
        .ingest(
            "Sunny weather tomorrow afternoon with a light breeze.",
            DocumentMetadata::new("forecast", "weather"),
        )
        .await
        .unwrap();

    let req = engine
        .request("sunny weather", Some(3), Some("vector"), None, None)
        .unwrap();
    let response = engine.query(&req).await.unwrap();
    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].source, "forecast");
    for pair in response.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn test_get_and_delete_document() {
    let (_tmp, engine) = setup().await;
    let receipt = engine
        .ingest(NEO4J, DocumentMetadata::new("wiki", ""))
        .await
        .unwrap();

    let doc = engine.get_document(&receipt.document_id).await.unwrap().unwrap();
    assert_eq!(doc.content, NEO4J);
    assert_eq!(doc.category, "general");
    assert_eq!(doc.chunks.len(), receipt.chunks);
    for (i, chunk) in doc.chunks.iter().enumerate() {
        assert_eq!(chunk.index, i as i64);
    }

    assert!(engine.delete_document(&receipt.document_id).await.unwrap());
    assert!(!engine.delete_document(&receipt.document_id).await.unwrap());
    assert!(engine.get_document(&receipt.document_id).await.unwrap().is_none());

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.document_count, 0);
    assert_eq!(stats.chunk_count, 0);
}

#[tokio::test]
async fn test_delete_invalidates_cache() {
    let (_tmp, engine) = setup().await;
    let receipt = engine
        .ingest(NEO4J, DocumentMetadata::new("wiki", "databases"))
        .await
        .unwrap();

    let req = engine.request("graph database", Some(2), None, None, None).unwrap();
    let before = engine.query(&req).await.unwrap();
    assert!(!before.results.is_empty());
    assert_eq!(engine.cache().len(), 1);

    engine.delete_document(&receipt.document_id).await.unwrap();
    assert_eq!(engine.cache().len(), 0);

    let after = engine.query(&req).await.unwrap();
    assert!(!after.timing.cached);
    assert!(after.results.is_empty());
    assert_eq!(engine.live_retrievals(), 2);
}

#[tokio::test]
async fn test_ingest_rejects_empty_and_oversized() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.ingest.max_document_bytes = 32;
    let engine = engine_with(&cfg).await;

    let err = engine
        .ingest("   ", DocumentMetadata::new("s", "c"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ingestion(_)));

    let err = engine
        .ingest(NEO4J, DocumentMetadata::new("s", "c"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ingestion(_)));

    assert_eq!(engine.stats().await.unwrap().document_count, 0);
}

#[tokio::test]
async fn test_ingest_file_round_trips_content() {
    let (tmp, engine) = setup().await;
    let path = tmp.path().join("notes.txt");
    std::fs::write(&path, NEO4J).unwrap();

    let receipt = engine
        .ingest_file(&path, Some("notes".to_string()), None)
        .await
        .unwrap();
    assert_eq!(receipt.source, "notes");

    let doc = engine.get_document(&receipt.document_id).await.unwrap().unwrap();
    assert_eq!(doc.content, NEO4J);
}

#[tokio::test]
async fn test_stats_and_health() {
    let (_tmp, engine) = setup().await;
    engine
        .ingest(NEO4J, DocumentMetadata::new("a", "c"))
        .await
        .unwrap();
    engine
        .ingest("Rust has ownership.", DocumentMetadata::new("b", "c"))
        .await
        .unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.document_count, 2);
    assert!(stats.chunk_count >= 3);
    assert!(
        (stats.avg_chunks_per_document - stats.chunk_count as f64 / 2.0).abs() < 1e-9
    );
    assert_eq!(stats.embedding_model, "hash-384");
    assert_eq!(stats.cache_capacity, 1024);

    let health = engine.health().await;
    assert!(health.is_healthy());
    assert!(health.database_reachable);
    assert!(health.embedding_model_ready);
    assert_eq!(health.pool.capacity, 4);
    assert_eq!(health.pool.active, 0);
}

#[tokio::test]
async fn test_health_reports_closed_pool() {
    let (_tmp, engine) = setup().await;
    engine.close().await;

    let health = engine.health().await;
    assert!(!health.database_reachable);
    assert!(!health.is_healthy());
}

#[tokio::test]
async fn test_exhausted_pool_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.pool.size = 1;
    cfg.pool.acquire_timeout_ms = 100;
    let engine = engine_with(&cfg).await;

    let held = engine.store().pool().get().await.unwrap();
    let err = engine.stats().await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
    assert!(err.is_retryable());

    drop(held);
    assert!(engine.stats().await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queries_share_pool() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.pool.size = 2;
    let engine = Arc::new(engine_with(&cfg).await);
    engine
        .ingest(NEO4J, DocumentMetadata::new("wiki", "databases"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let query = if i % 2 == 0 { "graph database" } else { "nodes and relationships" };
            let req = engine.request(query, Some(2), None, None, None).unwrap();
            engine.query(&req).await.unwrap()
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap();
        assert!(!response.results.is_empty());
    }

    let state = engine.store().pool().state();
    assert_eq!(state.active, 0);
    assert!(state.idle <= 2);
    assert!(engine.store().pool().opened() <= 2);
}

#[tokio::test]
async fn test_reopen_keeps_documents() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());

    let engine = engine_with(&cfg).await;
    let receipt = engine
        .ingest(NEO4J, DocumentMetadata::new("wiki", "databases"))
        .await
        .unwrap();
    engine.close().await;

    let reopened = engine_with(&cfg).await;
    let doc = reopened.get_document(&receipt.document_id).await.unwrap();
    assert!(doc.is_some());
}
