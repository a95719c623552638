//! Approximate nearest-neighbour index over chunk embeddings.
//!
//! Wraps an `hnsw_rs` graph with cosine distance and maps chunk ids to the
//! graph's numeric point ids. The graph lives in memory; the database stays
//! the source of truth, and [`SqliteStore`](crate::sqlite_store::SqliteStore)
//! rebuilds the index from stored embeddings when it opens.
//!
//! HNSW graphs cannot drop points. A removed chunk loses its id mapping and
//! becomes a tombstone that searches skip; once tombstones outnumber live
//! points the owner rebuilds the graph.

use anndists::dist::distances::DistCosine;
use hnsw_rs::hnsw::Hnsw;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, trace};

use rag_harness_core::{Error, Result};

use crate::config::IndexConfig;

/// The graph crate caps the number of layers at 16.
const MAX_LAYER: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    /// Links per node.
    pub m: usize,
    pub ef_construction: usize,
    /// Candidate list size while searching; raised to the requested limit
    /// when smaller.
    pub ef_search: usize,
    /// Capacity hint for the graph's layer allocation.
    pub max_elements: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            max_elements: 100_000,
        }
    }
}

impl From<&IndexConfig> for IndexOptions {
    fn from(config: &IndexConfig) -> Self {
        Self {
            m: config.m,
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
            max_elements: config.max_elements,
        }
    }
}

struct Inner {
    graph: Hnsw<'static, f32, DistCosine>,
    by_chunk: HashMap<String, usize>,
    by_point: HashMap<usize, String>,
    next_point: usize,
    dims: Option<usize>,
    tombstones: usize,
}

impl Inner {
    fn new(options: &IndexOptions, dims: Option<usize>) -> Self {
        Self {
            graph: Hnsw::new(
                options.m,
                options.max_elements,
                MAX_LAYER,
                options.ef_construction,
                DistCosine {},
            ),
            by_chunk: HashMap::new(),
            by_point: HashMap::new(),
            next_point: 0,
            dims,
            tombstones: 0,
        }
    }

    fn insert(&mut self, chunk_id: &str, vector: &[f32]) {
        if let Some(old) = self.by_chunk.remove(chunk_id) {
            self.by_point.remove(&old);
            self.tombstones += 1;
        }
        let point = self.next_point;
        self.next_point += 1;
        self.graph.insert((vector, point));
        self.by_chunk.insert(chunk_id.to_string(), point);
        self.by_point.insert(point, chunk_id.to_string());
        self.dims.get_or_insert(vector.len());
    }
}

/// Thread-safe HNSW index keyed by chunk id.
pub struct VectorIndex {
    inner: RwLock<Inner>,
    options: IndexOptions,
}

impl VectorIndex {
    pub fn new(options: IndexOptions) -> Self {
        Self {
            inner: RwLock::new(Inner::new(&options, None)),
            options,
        }
    }

    /// Live (non-removed) points.
    pub fn len(&self) -> usize {
        self.inner.read().by_chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstones(&self) -> usize {
        self.inner.read().tombstones
    }

    /// Whether removed points dominate the graph.
    pub fn needs_rebuild(&self) -> bool {
        let inner = self.inner.read();
        inner.tombstones > 0 && inner.tombstones >= inner.by_chunk.len()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.inner.read().by_chunk.contains_key(chunk_id)
    }

    /// Reject a vector the index could not hold.
    pub fn check(&self, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::Ingestion("empty embedding".to_string()));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::Ingestion("embedding contains NaN or Inf".to_string()));
        }
        if let Some(dims) = self.inner.read().dims {
            if vector.len() != dims {
                return Err(Error::Ingestion(format!(
                    "embedding has {} dimensions, index has {}",
                    vector.len(),
                    dims
                )));
            }
        }
        Ok(())
    }

    /// Add vectors. A chunk id already present is re-pointed to the new
    /// vector.
    pub fn insert_batch<'a, I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a [f32])>,
    {
        let items: Vec<(&str, &[f32])> = items.into_iter().collect();
        for (_, vector) in &items {
            self.check(vector)?;
        }

        let mut inner = self.inner.write();
        for (chunk_id, vector) in &items {
            inner.insert(chunk_id, vector);
            trace!(chunk_id, "indexed chunk");
        }
        Ok(items.len())
    }

    /// Forget chunks. Returns how many were present.
    pub fn remove<'a, I>(&self, chunk_ids: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut inner = self.inner.write();
        let mut removed = 0;
        for chunk_id in chunk_ids {
            if let Some(point) = inner.by_chunk.remove(chunk_id) {
                inner.by_point.remove(&point);
                inner.tombstones += 1;
                removed += 1;
            }
        }
        removed
    }

    /// Replace the whole graph with `items`, dropping all tombstones.
    pub fn rebuild<'a, I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a [f32])>,
    {
        let items: Vec<(&str, &[f32])> = items.into_iter().collect();
        let dims = items.first().map(|(_, v)| v.len());
        let mut fresh = Inner::new(&self.options, dims);
        for (chunk_id, vector) in &items {
            if vector.len() != dims.unwrap_or(vector.len()) || vector.iter().any(|v| !v.is_finite())
            {
                return Err(Error::Retrieval(format!(
                    "stored embedding for chunk {} is unusable",
                    chunk_id
                )));
            }
            fresh.insert(chunk_id, vector);
        }

        *self.inner.write() = fresh;
        debug!(points = items.len(), "vector index rebuilt");
        Ok(items.len())
    }

    /// Up to `limit` nearest chunk ids with their cosine distance, closest
    /// first.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        let inner = self.inner.read();
        if limit == 0 || inner.by_chunk.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(dims) = inner.dims {
            if query.len() != dims {
                return Err(Error::Retrieval(format!(
                    "query has {} dimensions, index has {}",
                    query.len(),
                    dims
                )));
            }
        }

        // Tombstones still occupy result slots in the graph.
        let fetch = limit + inner.tombstones;
        let ef = self.options.ef_search.max(fetch);

        let mut hits: Vec<(String, f32)> = inner
            .graph
            .search(query, fetch, ef)
            .into_iter()
            .filter_map(|n| inner.by_point.get(&n.d_id).map(|id| (id.clone(), n.distance)))
            .collect();
        hits.truncate(limit);
        Ok(hits)
    }
}
