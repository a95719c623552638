//! SQLite implementation of the [`Store`] trait.
//!
//! Every operation leases one connection from the [`SqlitePool`] and runs
//! under the configured query timeout. A connection whose call timed out is
//! discarded rather than returned, since its state is unknown.
//!
//! Embeddings are stored as BLOBs and mirrored into an in-memory HNSW
//! [`VectorIndex`], rebuilt from the table when the store opens. Vector
//! search asks the index for neighbours, then loads only those rows and
//! scores them with exact cosine similarity.

use async_trait::async_trait;
use sqlx::{Connection, Row};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use rag_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use rag_harness_core::models::{Chunk, ChunkResponse, Document, DocumentResponse};
use rag_harness_core::search::query_terms;
use rag_harness_core::store::{ChunkCandidate, PoolState, Store, StoreCounts};
use rag_harness_core::{Error, Result};

use crate::db::{SqliteConnectionManager, SqlitePool};
use crate::pool::PooledConnection;
use crate::vector_index::{IndexOptions, VectorIndex};

enum Outcome<T> {
    Done(T),
    Failed(sqlx::Error),
    TimedOut,
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Outcome<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Outcome::Done(v),
        Ok(Err(e)) => Outcome::Failed(e),
        Err(_) => Outcome::TimedOut,
    }
}

/// Build an FTS5 expression that ORs the quoted terms of `query`.
pub fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// Pooled SQLite store.
pub struct SqliteStore {
    pool: SqlitePool,
    query_timeout: Duration,
    index: VectorIndex,
}

impl SqliteStore {
    /// Wrap a migrated pool and load every stored embedding into the
    /// vector index.
    pub async fn open(
        pool: SqlitePool,
        query_timeout: Duration,
        index: IndexOptions,
    ) -> Result<Self> {
        let store = Self {
            pool,
            query_timeout,
            index: VectorIndex::new(index),
        };
        let points = store.reindex().await?;
        info!(points, "vector index loaded");
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Rebuild the vector index from the chunks table.
    pub async fn reindex(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let outcome = bounded(
            self.query_timeout,
            sqlx::query_as::<_, (String, Vec<u8>)>("SELECT id, embedding FROM chunks")
                .fetch_all(&mut *conn),
        )
        .await;
        let rows = self
            .settle(conn, outcome, "load embeddings", Error::Retrieval)
            .await?;

        let vectors: Vec<(String, Vec<f32>)> = rows
            .into_iter()
            .map(|(id, blob)| (id, blob_to_vec(&blob)))
            .collect();
        self.index
            .rebuild(vectors.iter().map(|(id, v)| (id.as_str(), v.as_slice())))
    }

    async fn settle<T>(
        &self,
        conn: PooledConnection<SqliteConnectionManager>,
        outcome: Outcome<T>,
        what: &str,
        wrap: fn(String) -> Error,
    ) -> Result<T> {
        match outcome {
            Outcome::Done(v) => Ok(v),
            Outcome::Failed(e) => Err(wrap(format!("{}: {}", what, e))),
            Outcome::TimedOut => {
                conn.discard().await;
                Err(wrap(format!(
                    "{} timed out after {}ms",
                    what,
                    self.query_timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        if let Some(c) = chunks.iter().find(|c| c.embedding.is_empty()) {
            return Err(Error::Ingestion(format!(
                "chunk {} has no embedding",
                c.chunk_index
            )));
        }

        let mut conn = self.pool.get().await?;
        let outcome = bounded(self.query_timeout, async {
            let mut tx = conn.begin().await?;

            sqlx::query(
                "INSERT INTO documents (id, source, category, content, created) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&doc.id)
            .bind(&doc.source)
            .bind(&doc.category)
            .bind(&doc.content)
            .bind(doc.created_at)
            .execute(&mut *tx)
            .await?;

            for chunk in chunks {
                sqlx::query(
                    r#"
                    INSERT INTO chunks (id, document_id, chunk_index, start_offset, text, hash, embedding, dims)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(chunk.chunk_index)
                .bind(chunk.start as i64)
                .bind(&chunk.text)
                .bind(&chunk.hash)
                .bind(vec_to_blob(&chunk.embedding))
                .bind(chunk.embedding.len() as i64)
                .execute(&mut *tx)
                .await?;

                sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                    .bind(&chunk.id)
                    .bind(&chunk.document_id)
                    .bind(&chunk.text)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await
        })
        .await;

        self.settle(conn, outcome, "insert document", Error::Ingestion)
            .await?;

        // Rows are committed; the next rebuild picks up anything the index
        // refuses here.
        if let Err(e) = self.index.insert_batch(
            chunks
                .iter()
                .map(|c| (c.id.as_str(), c.embedding.as_slice())),
        ) {
            warn!(error = %e, document_id = %doc.id, "chunks stored but not indexed");
        }
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentResponse>> {
        let mut conn = self.pool.get().await?;
        let outcome = bounded(self.query_timeout, async {
            let doc_row = sqlx::query(
                "SELECT id, source, category, content, created FROM documents WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

            let Some(row) = doc_row else {
                return Ok::<_, sqlx::Error>(None);
            };

            let chunk_rows = sqlx::query(
                "SELECT chunk_index, start_offset, text FROM chunks WHERE document_id = ? ORDER BY chunk_index",
            )
            .bind(id)
            .fetch_all(&mut *conn)
            .await?;

            let chunks = chunk_rows
                .iter()
                .map(|r| ChunkResponse {
                    index: r.get("chunk_index"),
                    start: r.get::<i64, _>("start_offset") as usize,
                    text: r.get("text"),
                })
                .collect();

            Ok(Some(DocumentResponse {
                id: row.get("id"),
                source: row.get("source"),
                category: row.get("category"),
                content: row.get("content"),
                created_at: row.get("created"),
                chunks,
            }))
        })
        .await;

        self.settle(conn, outcome, "get document", Error::Retrieval)
            .await
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let outcome = bounded(self.query_timeout, async {
            let mut tx = conn.begin().await?;

            let chunk_ids =
                sqlx::query_scalar::<_, String>("SELECT id FROM chunks WHERE document_id = ?")
                    .bind(id)
                    .fetch_all(&mut *tx)
                    .await?;

            sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            tx.commit().await?;
            Ok::<_, sqlx::Error>((deleted > 0, chunk_ids))
        })
        .await;

        let (deleted, chunk_ids) = self
            .settle(conn, outcome, "delete document", Error::Retrieval)
            .await?;

        let removed = self.index.remove(chunk_ids.iter().map(String::as_str));
        debug!(removed, "dropped chunks from vector index");
        if self.index.needs_rebuild() {
            if let Err(e) = self.reindex().await {
                warn!(error = %e, "vector index rebuild failed");
            }
        }
        Ok(deleted)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>> {
        let Some(expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let mut conn = self.pool.get().await?;
        let outcome = bounded(
            self.query_timeout,
            sqlx::query(
                r#"
                SELECT chunks_fts.chunk_id AS chunk_id,
                       chunks_fts.document_id AS document_id,
                       chunks_fts.rank AS rank,
                       c.chunk_index AS chunk_index,
                       c.text AS text,
                       d.source AS source
                FROM chunks_fts
                JOIN chunks c ON c.id = chunks_fts.chunk_id
                JOIN documents d ON d.id = c.document_id
                WHERE chunks_fts MATCH ?
                ORDER BY chunks_fts.rank
                LIMIT ?
                "#,
            )
            .bind(&expr)
            .bind(limit as i64)
            .fetch_all(&mut *conn),
        )
        .await;

        let rows = self
            .settle(conn, outcome, "keyword search", Error::Retrieval)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    source: row.get("source"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    raw_score: -rank, // negate so higher = better
                }
            })
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let neighbours = self.index.search(query_vec, limit)?;
        if neighbours.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; neighbours.len()].join(", ");
        let sql = format!(
            r#"
            SELECT c.id AS chunk_id, c.document_id AS document_id, c.chunk_index AS chunk_index,
                   c.text AS text, c.embedding AS embedding, d.source AS source
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.id IN ({})
            "#,
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for (chunk_id, _) in &neighbours {
            query = query.bind(chunk_id);
        }

        let mut conn = self.pool.get().await?;
        let outcome = bounded(self.query_timeout, query.fetch_all(&mut *conn)).await;

        // The connection goes back to the pool before scoring.
        let rows = self
            .settle(conn, outcome, "vector search", Error::Retrieval)
            .await?;

        // Rescore exactly; the graph's distances are approximate.
        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    source: row.get("source"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    raw_score: similarity,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        candidates.truncate(limit);

        Ok(candidates)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let mut conn = self.pool.get().await?;
        let outcome = bounded(
            self.query_timeout,
            sqlx::query_as::<_, (i64, i64)>(
                "SELECT (SELECT COUNT(*) FROM documents), (SELECT COUNT(*) FROM chunks)",
            )
            .fetch_one(&mut *conn),
        )
        .await;

        let (documents, chunks) = self
            .settle(conn, outcome, "count rows", Error::Retrieval)
            .await?;
        Ok(StoreCounts { documents, chunks })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let outcome = bounded(
            self.query_timeout,
            sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&mut *conn),
        )
        .await;
        self.settle(conn, outcome, "ping", Error::Connection)
            .await
            .map(|_| ())
    }

    fn pool_state(&self) -> Option<PoolState> {
        Some(self.pool.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};

    async fn open_store(dir: &std::path::Path) -> SqliteStore {
        let config = Config::minimal(dir.join("rag.sqlite"));
        let pool = db::connect(&config).unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        SqliteStore::open(pool, Duration::from_secs(5), IndexOptions::default())
            .await
            .unwrap()
    }

    fn document(id: &str) -> Document {
        Document {
            id: id.to_string(),
            source: format!("{}.txt", id),
            category: "general".to_string(),
            content: format!("{} content", id),
            created_at: 0,
        }
    }

    fn chunk(doc: &str, id: &str, index: i64, embedding: [f32; 3]) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: doc.to_string(),
            chunk_index: index,
            start: 0,
            text: format!("{} text", id),
            hash: id.to_string(),
            embedding: embedding.to_vec(),
        }
    }

    async fn row_counts(store: &SqliteStore) -> (i64, i64, i64) {
        let mut conn = store.pool().get().await.unwrap();
        sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT (SELECT COUNT(*) FROM documents), (SELECT COUNT(*) FROM chunks), (SELECT COUNT(*) FROM chunks_fts)",
        )
        .fetch_one(&mut *conn)
        .await
        .unwrap()
    }

    #[test]
    fn test_fts_query_quotes_and_ors_terms() {
        assert_eq!(
            fts_query("What is Neo4j?").as_deref(),
            Some("\"what\" OR \"is\" OR \"neo4j\"")
        );
        assert_eq!(
            fts_query("graph-db AND NOT").as_deref(),
            Some("\"graph\" OR \"db\" OR \"and\" OR \"not\"")
        );
        assert!(fts_query("?? !!").is_none());
    }

    #[tokio::test]
    async fn test_vector_search_uses_index() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;

        store
            .insert_document(
                &document("a"),
                &[
                    chunk("a", "a0", 0, [1.0, 0.0, 0.0]),
                    chunk("a", "a1", 1, [0.0, 1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        store
            .insert_document(&document("b"), &[chunk("b", "b0", 0, [0.0, 0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(store.index().len(), 3);

        let hits = store.vector_search(&[0.1, 0.9, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "a1");
        assert_eq!(hits[0].source, "a.txt");
        assert!(hits[0].raw_score > hits[1].raw_score);
        assert!(hits[0].raw_score <= 1.0);
    }

    #[tokio::test]
    async fn test_delete_removes_from_index() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;
        store
            .insert_document(&document("a"), &[chunk("a", "a0", 0, [1.0, 0.0, 0.0])])
            .await
            .unwrap();
        store
            .insert_document(&document("b"), &[chunk("b", "b0", 0, [0.9, 0.1, 0.0])])
            .await
            .unwrap();

        assert!(store.delete_document("a").await.unwrap());
        assert!(!store.index().contains("a0"));

        let hits = store.vector_search(&[1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "b0");
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;
        store
            .insert_document(&document("a"), &[chunk("a", "a0", 0, [1.0, 0.0, 0.0])])
            .await
            .unwrap();
        store.pool().close().await;

        let reopened = open_store(tmp.path()).await;
        assert!(reopened.index().contains("a0"));
        let hits = reopened.vector_search(&[1.0, 0.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].chunk_id, "a0");
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;
        store
            .insert_document(&document("a"), &[chunk("a", "a0", 0, [1.0, 0.0, 0.0])])
            .await
            .unwrap();
        let before = row_counts(&store).await;
        assert_eq!(before, (1, 1, 1));

        // The second chunk repeats chunk_index 0, so the UNIQUE constraint
        // fails after the document row and the first chunk were written.
        let err = store
            .insert_document(
                &document("b"),
                &[
                    chunk("b", "b0", 0, [0.0, 1.0, 0.0]),
                    chunk("b", "b1", 0, [0.0, 0.0, 1.0]),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ingestion(_)));

        assert_eq!(row_counts(&store).await, before);
        assert!(store.get_document("b").await.unwrap().is_none());
        assert!(!store.index().contains("b0"));
        assert_eq!(store.index().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_mismatched_dimensions() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;
        store
            .insert_document(&document("a"), &[chunk("a", "a0", 0, [1.0, 0.0, 0.0])])
            .await
            .unwrap();

        let mut short = chunk("b", "b0", 0, [1.0, 0.0, 0.0]);
        short.embedding.pop();
        let err = store
            .insert_document(&document("b"), &[short])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ingestion(_)));
        assert_eq!(row_counts(&store).await, (1, 1, 1));
    }
}
