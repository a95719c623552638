//! # RAG Harness
//!
//! A retrieval core for retrieval-augmented generation: documents are split
//! into overlapping chunks, embedded, and stored in SQLite with an FTS5
//! index; queries are answered by fusing vector similarity with keyword
//! relevance, behind a bounded FIFO query cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────┐   ┌──────────────┐
//! │  Ingest  │──▶│ Chunk + Embed    │──▶│    SQLite     │
//! │  (text)  │   │ (batched model) │   │ FTS5 + HNSW  │
//! └──────────┘   └─────────────────┘   └──────┬───────┘
//!                                             │ bounded pool
//!              ┌──────────────┐        ┌──────┴───────┐
//! query ──────▶│ Query cache  │─miss──▶│   Hybrid     │
//!              │   (FIFO)     │◀───────│  retriever   │
//!              └──────────────┘        └──────────────┘
//! ```
//!
//! Pure logic (chunking, scoring, fusion, the cache, the storage trait)
//! lives in [`rag_harness_core`]; this crate adds the runtime: config,
//! the connection pool, the SQLite store, and the embedding service.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`pool`] | Bounded connection pool with health checks and retries |
//! | [`db`] | SQLite connection manager |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | [`Store`](rag_harness_core::store::Store) over the pool |
//! | [`vector_index`] | HNSW nearest-neighbour index over embeddings |
//! | [`embedding`] | Batched embedding service and provider selection |
//! | [`ingest`] | Chunk, embed, persist |
//! | [`retriever`] | Live hybrid retrieval |
//! | [`engine`] | Cache-fronted query service, stats, health |
//! | [`stats`] | Statistics and health reports |

pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod ingest;
pub mod migrate;
pub mod pool;
pub mod retriever;
pub mod sqlite_store;
pub mod stats;
pub mod vector_index;

pub use rag_harness_core as core;
