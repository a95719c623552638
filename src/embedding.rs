//! Embedding service and provider selection.
//!
//! [`EmbeddingService`] wraps one [`EmbeddingProvider`] loaded at startup
//! and shared by every request. Inputs are split into batches of
//! `embedding.batch_size`; each batch runs on tokio's blocking pool so model
//! inference never stalls the async workers. Every returned vector is
//! checked for count, dimension, finiteness, and a non-zero norm before it
//! reaches a caller.
//!
//! # Providers
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"hash"` | [`HashEmbedder`]: offline feature hashing, no model download |
//! | `"local"` | `FastEmbedProvider`: ONNX model via fastembed (`local-embeddings` feature) |

use anyhow::bail;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use rag_harness_core::embedding::{validate_vectors, EmbeddingProvider, HashEmbedder};
use rag_harness_core::{Error, Result};

use crate::config::EmbeddingConfig;

/// Dimensionality of the hashing embedder when `embedding.dims` is unset.
pub const DEFAULT_HASH_DIMS: usize = 384;

/// Shared, batched front-end over an embedding provider.
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    ready: AtomicBool,
    calls: AtomicU64,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            ready: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed `texts`, returning one vector per input in the same order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let dims = self.provider.dims();
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            let provider = Arc::clone(&self.provider);
            let batch = batch.to_vec();
            let expected = batch.len();

            let embedded = tokio::task::spawn_blocking(move || provider.embed(&batch))
                .await
                .map_err(|e| Error::Embedding(format!("embedding task failed: {}", e)))??;

            validate_vectors(expected, dims, &embedded)?;
            vectors.extend(embedded);
        }

        self.calls.fetch_add(1, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
        debug!(texts = texts.len(), model = self.model_name(), "embedded batch");
        Ok(vectors)
    }

    /// Embed a single text, e.g. a search query.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("empty embedding response".to_string()))
    }

    /// Run one throwaway embedding so the first request does not pay for
    /// lazy model initialisation.
    pub async fn warm_up(&self) -> Result<()> {
        self.embed_one("warm up").await?;
        info!(model = self.model_name(), dims = self.dims(), "embedding model ready");
        Ok(())
    }

    /// Whether the model has produced at least one valid embedding.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Successful `embed` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

/// Create the configured [`EmbeddingProvider`].
///
/// # Errors
///
/// Returns an error for unknown provider names, or for `"local"` when the
/// crate was built without the `local-embeddings` feature or the model
/// cannot be loaded.
pub fn create_provider(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(local::FastEmbedProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(feature = "local-embeddings")]
mod local {
    use anyhow::bail;
    use std::sync::Mutex;

    use rag_harness_core::embedding::EmbeddingProvider;
    use rag_harness_core::{Error, Result};

    use crate::config::EmbeddingConfig;

    /// Local ONNX embedding model.
    ///
    /// Downloaded from Hugging Face on first use and cached; runs offline
    /// afterwards. `TextEmbedding::embed` needs `&mut self`, so the model
    /// sits behind a mutex.
    pub struct FastEmbedProvider {
        model: Mutex<fastembed::TextEmbedding>,
        model_name: String,
        dims: usize,
    }

    impl FastEmbedProvider {
        pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "bge-small-en-v1.5".to_string());
            let (model, default_dims) = to_fastembed_model(&model_name)?;

            let embedding = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(model).with_show_download_progress(true),
            )
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

            Ok(Self {
                model: Mutex::new(embedding),
                dims: config.dims.unwrap_or(default_dims),
                model_name,
            })
        }
    }

    impl EmbeddingProvider for FastEmbedProvider {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut model = self
                .model
                .lock()
                .map_err(|_| Error::Embedding("embedding model lock poisoned".to_string()))?;
            model
                .embed(texts.to_vec(), None)
                .map_err(|e| Error::Embedding(format!("local embedding failed: {}", e)))
        }
    }

    fn to_fastembed_model(name: &str) -> anyhow::Result<(fastembed::EmbeddingModel, usize)> {
        match name {
            "all-minilm-l6-v2" => Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384)),
            "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
            "bge-base-en-v1.5" => Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768)),
            "bge-large-en-v1.5" => Ok((fastembed::EmbeddingModel::BGELargeENV15, 1024)),
            "multilingual-e5-small" => Ok((fastembed::EmbeddingModel::MultilingualE5Small, 384)),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 multilingual-e5-small",
                other
            ),
        }
    }
}
