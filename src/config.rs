//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to defaults.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rag_harness_core::chunk::ChunkParams;
use rag_harness_core::search::{SearchParams, DEFAULT_ALPHA};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_pool_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            max_retries: default_pool_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

fn default_pool_size() -> usize {
    10
}
fn default_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_query_timeout_ms() -> u64 {
    10_000
}
fn default_pool_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_boundary_slack")]
    pub boundary_slack: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
            boundary_slack: default_boundary_slack(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams::new(self.max_chars, self.overlap_chars).with_slack(self.boundary_slack)
    }
}

fn default_max_chars() -> usize {
    300
}
fn default_overlap_chars() -> usize {
    50
}
fn default_boundary_slack() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

fn default_max_document_bytes() -> usize {
    2 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_alpha")]
    pub default_alpha: f64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            default_alpha: default_alpha(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> SearchParams {
        SearchParams {
            candidate_multiplier: self.candidate_multiplier,
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_alpha() -> f64 {
    DEFAULT_ALPHA
}
fn default_candidate_multiplier() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"hash"` (offline feature hashing) or `"local"` (fastembed).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Maximum cached responses; 0 disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_invalidate_on_ingest")]
    pub invalidate_on_ingest: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            invalidate_on_ingest: default_invalidate_on_ingest(),
        }
    }
}

fn default_cache_capacity() -> usize {
    1024
}
fn default_invalidate_on_ingest() -> bool {
    true
}

/// HNSW parameters for the vector index.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_m")]
    pub m: usize,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: default_index_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            max_elements: default_max_elements(),
        }
    }
}

fn default_index_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    64
}
fn default_max_elements() -> usize {
    100_000
}

impl Config {
    /// All-defaults configuration for a database at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            pool: PoolConfig::default(),
            chunking: ChunkingConfig::default(),
            ingest: IngestConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            bail!("pool.size must be > 0");
        }
        if self.pool.acquire_timeout_ms == 0 {
            bail!("pool.acquire_timeout_ms must be > 0");
        }

        if self.chunking.max_chars == 0 {
            bail!("chunking.max_chars must be > 0");
        }
        if self.chunking.overlap_chars >= self.chunking.max_chars {
            bail!("chunking.overlap_chars must be smaller than chunking.max_chars");
        }

        if self.ingest.max_document_bytes == 0 {
            bail!("ingest.max_document_bytes must be > 0");
        }

        if self.retrieval.default_k < 1 {
            bail!("retrieval.default_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.default_alpha) {
            bail!("retrieval.default_alpha must be in [0.0, 1.0]");
        }
        if self.retrieval.candidate_multiplier < 1 {
            bail!("retrieval.candidate_multiplier must be >= 1");
        }

        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }
        match self.embedding.provider.as_str() {
            "hash" | "local" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash or local.",
                other
            ),
        }

        if self.index.m < 2 {
            bail!("index.m must be >= 2");
        }
        if self.index.ef_construction == 0 || self.index.ef_search == 0 {
            bail!("index.ef_construction and index.ef_search must be > 0");
        }
        if self.index.max_elements == 0 {
            bail!("index.max_elements must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
