//! The retrieval service: query cache in front of the hybrid retriever,
//! plus ingestion, document management, statistics, and health.
//!
//! One [`RagEngine`] owns the process-wide pool, cache, and embedding
//! model. Construct it once and share it behind an `Arc`.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use rag_harness_core::cache::{fingerprint, QueryCache};
use rag_harness_core::models::{DocumentMetadata, DocumentResponse};
use rag_harness_core::search::{QueryRequest, QueryResponse, SearchMode, SearchParams, Timing};
use rag_harness_core::store::Store;
use rag_harness_core::Result;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingService};
use crate::ingest::{IngestOptions, IngestReceipt, Ingestor};
use crate::migrate;
use crate::retriever::HybridRetriever;
use crate::sqlite_store::SqliteStore;
use crate::stats::{average, Health, Stats};
use crate::vector_index::IndexOptions;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub ingest: IngestOptions,
    pub search: SearchParams,
    pub cache_capacity: usize,
    pub invalidate_on_ingest: bool,
    pub default_k: usize,
    pub default_alpha: f64,
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            ingest: IngestOptions::from(config),
            search: config.retrieval.params(),
            cache_capacity: config.cache.capacity,
            invalidate_on_ingest: config.cache.invalidate_on_ingest,
            default_k: config.retrieval.default_k,
            default_alpha: config.retrieval.default_alpha,
        }
    }
}

pub struct RagEngine<S: Store + ?Sized> {
    store: Arc<S>,
    embedder: Arc<EmbeddingService>,
    ingestor: Ingestor<S>,
    retriever: HybridRetriever<S>,
    cache: QueryCache,
    options: EngineOptions,
}

impl RagEngine<SqliteStore> {
    /// Open the configured database, run migrations, and load the model.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config)?;
        migrate::run_migrations(&pool).await?;
        let store = Arc::new(
            SqliteStore::open(
                pool,
                config.pool.query_timeout(),
                IndexOptions::from(&config.index),
            )
            .await?,
        );

        let provider = embedding::create_provider(&config.embedding)?;
        let embedder = Arc::new(EmbeddingService::new(provider, config.embedding.batch_size));
        embedder.warm_up().await?;

        Ok(Self::new(store, embedder, EngineOptions::from(config)))
    }

    /// Close pooled connections.
    pub async fn close(&self) {
        self.store.pool().close().await;
    }
}

impl<S: Store + ?Sized> RagEngine<S> {
    pub fn new(store: Arc<S>, embedder: Arc<EmbeddingService>, options: EngineOptions) -> Self {
        Self {
            ingestor: Ingestor::new(
                Arc::clone(&store),
                Arc::clone(&embedder),
                options.ingest.clone(),
            ),
            retriever: HybridRetriever::new(Arc::clone(&store), Arc::clone(&embedder), options.search),
            cache: QueryCache::new(options.cache_capacity),
            store,
            embedder,
            options,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub async fn ingest(&self, text: &str, metadata: DocumentMetadata) -> Result<IngestReceipt> {
        let receipt = self.ingestor.ingest(text, metadata).await?;
        self.after_write();
        Ok(receipt)
    }

    pub async fn ingest_file(
        &self,
        path: &std::path::Path,
        source: Option<String>,
        category: Option<String>,
    ) -> Result<IngestReceipt> {
        let receipt = self.ingestor.ingest_file(path, source, category).await?;
        self.after_write();
        Ok(receipt)
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<DocumentResponse>> {
        self.store.get_document(id).await
    }

    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let deleted = self.store.delete_document(id).await?;
        if deleted {
            self.after_write();
        }
        Ok(deleted)
    }

    fn after_write(&self) {
        if !self.options.invalidate_on_ingest {
            return;
        }
        match self.cache.invalidate_all() {
            Ok(dropped) if dropped > 0 => debug!(dropped, "query cache invalidated"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not invalidate query cache"),
        }
    }

    /// Build a request from loosely-typed fields, filling configured defaults.
    pub fn request(
        &self,
        query: &str,
        k: Option<usize>,
        mode: Option<&str>,
        threshold: Option<f64>,
        alpha: Option<f64>,
    ) -> Result<QueryRequest> {
        let mode = SearchMode::from_parts(mode, threshold, alpha, self.options.default_alpha)?;
        QueryRequest::new(query, k.unwrap_or(self.options.default_k), mode)
    }

    /// Answer a query, from the cache when possible.
    ///
    /// A cache failure never fails the query: it is logged and the request
    /// falls through to live retrieval.
    pub async fn query(&self, req: &QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        let key = fingerprint(req);

        match self.cache.get(&key) {
            Ok(Some(hit)) => {
                let mut response = (*hit).clone();
                response.query = req.query.clone();
                response.timing = Timing {
                    embedding_ms: 0.0,
                    search_ms: 0.0,
                    total_ms: started.elapsed().as_secs_f64() * 1000.0,
                    cached: true,
                };
                debug!(mode = req.mode.name(), k = req.k, "query cache hit");
                return Ok(response);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "query cache unavailable, using live retrieval"),
        }

        // Read before touching the store so a concurrent write's
        // invalidation rejects this result.
        let generation = self.cache.generation();

        let response = self.retriever.retrieve(req).await?;
        let stored = generation
            .and_then(|g| self.cache.put_if_generation(&key, Arc::new(response.clone()), g));
        match stored {
            Ok(true) => {}
            Ok(false) => debug!("query result not cached"),
            Err(e) => warn!(error = %e, "could not store query result in cache"),
        }
        Ok(response)
    }

    /// Retrievals that missed the cache and ran against the store.
    pub fn live_retrievals(&self) -> u64 {
        self.retriever.live_retrievals()
    }

    pub async fn stats(&self) -> Result<Stats> {
        let counts = self.store.counts().await?;
        let cache = self.cache.stats();
        Ok(Stats {
            document_count: counts.documents,
            chunk_count: counts.chunks,
            avg_chunks_per_document: average(counts.chunks, counts.documents),
            cache_size: cache.entries,
            cache_capacity: cache.capacity,
            cache_hit_rate: cache.hit_rate,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_evictions: cache.evictions,
            live_retrievals: self.live_retrievals(),
            embedding_model: self.embedder.model_name().to_string(),
        })
    }

    /// Check each dependency. Never fails; problems show up as `false`.
    pub async fn health(&self) -> Health {
        let database_reachable = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "database health check failed");
                false
            }
        };
        Health {
            pool: self.store.pool_state().unwrap_or_default(),
            embedding_model_ready: self.embedder.is_ready(),
            database_reachable,
        }
    }
}
