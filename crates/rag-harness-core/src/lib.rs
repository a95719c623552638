//! # rag-harness core
//!
//! Runtime-agnostic logic for the retrieval core: data models, the error
//! taxonomy, windowed chunking, the embedder trait, the [`Store`](store::Store)
//! abstraction, hybrid score fusion, and the FIFO query cache.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. The `rag-harness`
//! application crate supplies the SQLite store, the connection pool, and
//! the embedding service that drive these pieces.

pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;

pub use error::{Error, Result};
