//! SQLite connections for the pool.
//!
//! Every connection runs in WAL mode with foreign keys on, so deleting a
//! document cascades to its chunks. `busy_timeout` follows
//! `pool.query_timeout_ms`.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::Connection;
use std::str::FromStr;
use std::time::Duration;

use rag_harness_core::Error;

use crate::config::Config;
use crate::pool::{ConnectionManager, ConnectionPool, PoolOptions};

/// Pool of raw SQLite connections.
pub type SqlitePool = ConnectionPool<SqliteConnectionManager>;

/// Opens WAL-mode SQLite connections with foreign keys enforced.
pub struct SqliteConnectionManager {
    options: SqliteConnectOptions,
}

impl SqliteConnectionManager {
    pub fn new(config: &Config) -> Result<Self> {
        let db_path = &config.db.path;

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.pool.query_timeout_ms));

        Ok(Self { options })
    }
}

#[async_trait]
impl ConnectionManager for SqliteConnectionManager {
    type Connection = SqliteConnection;

    async fn connect(&self) -> rag_harness_core::Result<SqliteConnection> {
        SqliteConnection::connect_with(&self.options)
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }

    async fn is_valid(&self, conn: &mut SqliteConnection) -> bool {
        conn.ping().await.is_ok()
    }

    async fn close(&self, conn: SqliteConnection) {
        let _ = conn.close().await;
    }
}

/// Build the connection pool for the configured database.
pub fn connect(config: &Config) -> Result<SqlitePool> {
    let manager = SqliteConnectionManager::new(config)?;
    Ok(ConnectionPool::new(manager, PoolOptions::from(&config.pool)))
}
