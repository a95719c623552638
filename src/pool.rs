//! Bounded connection pool.
//!
//! A fixed number of slots guarded by a semaphore. Each slot leases one
//! connection at a time; idle connections are kept in a stack and reused.
//! Connections are opened lazily up to capacity.
//!
//! # Lifecycle
//!
//! ```text
//! acquire ─▶ wait for a slot (≤ timeout) ─▶ pop idle ─▶ validate ─┬▶ lease
//!                 │                             │                  │
//!                 ▼                             ▼ none             ▼ dead
//!           PoolExhausted                connect (retry ×N) ◀── close + replace
//! ```
//!
//! A [`PooledConnection`] returns itself to the pool when dropped, on every
//! exit path. The idle push happens before the slot is released, so a
//! woken waiter always finds the connection.
//!
//! # Example
//!
//! ```rust,ignore
//! let pool = ConnectionPool::new(manager, PoolOptions::default());
//! let mut conn = pool.get().await?;
//! sqlx::query("SELECT 1").execute(&mut *conn).await?;
//! // Returned to the pool here.
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use rag_harness_core::store::PoolState;
use rag_harness_core::{Error, Result};

use crate::config::PoolConfig;

/// Opens, checks, and closes connections for a [`ConnectionPool`].
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection>;

    /// Cheap liveness check run before an idle connection is leased.
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;

    /// Close a connection that leaves the pool.
    async fn close(&self, conn: Self::Connection);
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of connections (default: 10).
    pub size: usize,
    /// Default wait for [`ConnectionPool::get`] (default: 5 seconds).
    pub acquire_timeout: Duration,
    /// Extra attempts after a failed connect (default: 3).
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each further attempt.
    pub retry_backoff: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 10,
            acquire_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            size: config.size,
            acquire_timeout: config.acquire_timeout(),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    options: PoolOptions,
    idle: Mutex<Vec<M::Connection>>,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    opened: AtomicU64,
    replaced: AtomicU64,
    closed: AtomicBool,
}

/// Fixed-size pool of connections produced by a [`ConnectionManager`].
///
/// Cheap to clone; clones share the same slots.
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    pub fn new(manager: M, options: PoolOptions) -> Self {
        let size = options.size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                manager,
                idle: Mutex::new(Vec::with_capacity(size)),
                semaphore: Arc::new(Semaphore::new(size)),
                active: AtomicUsize::new(0),
                opened: AtomicU64::new(0),
                replaced: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                options: PoolOptions { size, ..options },
            }),
        }
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Lease a connection, waiting at most the configured acquire timeout.
    pub async fn get(&self) -> Result<PooledConnection<M>> {
        self.acquire(self.inner.options.acquire_timeout).await
    }

    /// Lease a connection, waiting at most `timeout` for a free slot.
    ///
    /// Fails with [`Error::PoolExhausted`] if no slot frees up in time and
    /// with [`Error::Connection`] if a healthy connection cannot be opened
    /// after the configured retries or before `timeout` runs out.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<M>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("connection pool is closed".to_string()));
        }

        let started = Instant::now();
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Connection("connection pool is closed".to_string())),
            Err(_) => {
                let waited = started.elapsed();
                debug!(waited_ms = waited.as_millis() as u64, "pool acquire timed out");
                return Err(Error::PoolExhausted { waited });
            }
        };

        // Opening and validating share the same deadline. The permit is
        // dropped on error, freeing the slot.
        let remaining = timeout.saturating_sub(started.elapsed());
        let conn = match tokio::time::timeout(remaining, self.checkout()).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(Error::Connection(format!(
                    "no usable connection within {}ms",
                    timeout.as_millis()
                )))
            }
        };
        self.inner.active.fetch_add(1, Ordering::AcqRel);

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Return a leased connection. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    async fn checkout(&self) -> Result<M::Connection> {
        loop {
            let candidate = self.inner.idle.lock().pop();
            let Some(mut conn) = candidate else {
                break;
            };
            if self.inner.manager.is_valid(&mut conn).await {
                return Ok(conn);
            }
            warn!("discarding dead pooled connection");
            self.inner.manager.close(conn).await;
            self.inner.replaced.fetch_add(1, Ordering::Relaxed);
        }

        self.connect_with_retry().await
    }

    async fn connect_with_retry(&self) -> Result<M::Connection> {
        let max_retries = self.inner.options.max_retries;
        let mut last_err = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                // 1x, 2x, 4x, ... the base backoff.
                let delay = self.inner.options.retry_backoff * (1u32 << (attempt - 1).min(10));
                tokio::time::sleep(delay).await;
            }

            match self.inner.manager.connect().await {
                Ok(conn) => {
                    self.inner.opened.fetch_add(1, Ordering::Relaxed);
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "failed to open connection");
                    last_err = Some(e);
                }
            }
        }

        Err(Error::Connection(format!(
            "could not open a connection after {} attempts: {}",
            max_retries + 1,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Open connections until `count` are idle (bounded by capacity).
    pub async fn warm_up(&self, count: usize) -> Result<usize> {
        let target = count.min(self.inner.options.size);
        let mut opened = 0;
        loop {
            let present = self.inner.idle.lock().len() + self.inner.active.load(Ordering::Acquire);
            if present >= target {
                break;
            }
            let conn = self.connect_with_retry().await?;
            self.inner.idle.lock().push(conn);
            opened += 1;
        }
        if opened > 0 {
            info!(opened, capacity = self.inner.options.size, "connection pool warmed up");
        }
        Ok(opened)
    }

    pub fn state(&self) -> PoolState {
        PoolState {
            active: self.inner.active.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
            capacity: self.inner.options.size,
        }
    }

    /// Total connections opened over the pool's lifetime.
    pub fn opened(&self) -> u64 {
        self.inner.opened.load(Ordering::Relaxed)
    }

    /// Dead idle connections that were closed and replaced.
    pub fn replaced(&self) -> u64 {
        self.inner.replaced.load(Ordering::Relaxed)
    }

    /// Refuse new leases and close idle connections.
    ///
    /// Leased connections are closed when they come back.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();
        let drained: Vec<M::Connection> = std::mem::take(&mut *self.inner.idle.lock());
        let count = drained.len();
        for conn in drained {
            self.inner.manager.close(conn).await;
        }
        info!(closed = count, "connection pool closed");
    }
}

/// Exclusive lease on one pooled connection.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Close this connection instead of returning it, e.g. after an I/O
    /// error left it in an unknown state. The slot is freed.
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.active.fetch_sub(1, Ordering::AcqRel);
            self.pool.manager.close(conn).await;
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("leased", &self.conn.is_some())
            .finish()
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.active.fetch_sub(1, Ordering::AcqRel);
            // Dropped without a close handshake once the pool shuts down.
            if !self.pool.closed.load(Ordering::Acquire) {
                self.pool.idle.lock().push(conn);
            }
        }
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already released")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already released")
    }
}
