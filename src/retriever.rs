//! Live hybrid retrieval: embed the query, then search the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use rag_harness_core::search::{search, QueryRequest, QueryResponse, SearchParams, Timing};
use rag_harness_core::store::Store;
use rag_harness_core::Result;

use crate::embedding::EmbeddingService;

pub struct HybridRetriever<S: Store + ?Sized> {
    store: Arc<S>,
    embedder: Arc<EmbeddingService>,
    params: SearchParams,
    live: AtomicU64,
}

fn millis(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

impl<S: Store + ?Sized> HybridRetriever<S> {
    pub fn new(store: Arc<S>, embedder: Arc<EmbeddingService>, params: SearchParams) -> Self {
        Self {
            store,
            embedder,
            params,
            live: AtomicU64::new(0),
        }
    }

    /// Run one uncached retrieval.
    pub async fn retrieve(&self, req: &QueryRequest) -> Result<QueryResponse> {
        self.live.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let query_vec = self.embedder.embed_one(&req.query).await?;
        let embedding_ms = millis(started);

        let search_started = Instant::now();
        let results = search(self.store.as_ref(), req, &query_vec, &self.params).await?;
        let search_ms = millis(search_started);

        let timing = Timing {
            embedding_ms,
            search_ms,
            total_ms: millis(started),
            cached: false,
        };
        debug!(
            mode = req.mode.name(),
            k = req.k,
            results = results.len(),
            embedding_ms,
            search_ms,
            "live retrieval"
        );

        Ok(QueryResponse {
            query: req.query.clone(),
            mode: req.mode,
            k: req.k,
            results,
            timing,
        })
    }

    /// Number of retrievals that reached the embedder and store.
    pub fn live_retrievals(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }
}
