//! FIFO query cache.
//!
//! Memoizes retrieval responses by an exact fingerprint of the request.
//! Eviction is strictly first-in-first-out: reads never refresh an entry,
//! so the oldest insertion is always the next to go.
//!
//! # Cache Key Strategy
//!
//! Keys are SHA-256 hashes over the normalized query text (trimmed,
//! lowercased, whitespace collapsed), `k`, the mode name, and the bit
//! patterns of the threshold and alpha parameters. Two requests share an
//! entry only if all of these agree.
//!
//! Every [`QueryCache::invalidate_all`] starts a new generation. A caller
//! that misses records [`QueryCache::generation`] before going to the store
//! and stores its result with [`QueryCache::put_if_generation`], so a
//! response computed before an invalidation is never cached after it.
//!
//! A poisoned lock is reported as [`CacheError::Poisoned`] so callers can
//! fall back to live retrieval instead of failing the request.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::search::{QueryRequest, QueryResponse, SearchMode};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("query cache lock poisoned")]
    Poisoned,
}

/// Counters for cache monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// `hits / (hits + misses)`, or 0 before the first lookup.
    pub hit_rate: f64,
}

/// Trim, lowercase, and collapse internal whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compute the cache key for a request.
pub fn fingerprint(req: &QueryRequest) -> String {
    let (threshold, alpha) = match req.mode {
        SearchMode::Vector => (None, None),
        SearchMode::Hybrid { alpha } => (None, Some(alpha)),
        SearchMode::Threshold { min_score } => (Some(min_score), None),
    };

    let mut hasher = Sha256::new();
    hasher.update(normalize_query(&req.query).as_bytes());
    hasher.update(b"|");
    hasher.update((req.k as u64).to_le_bytes());
    hasher.update(b"|");
    hasher.update(req.mode.name().as_bytes());
    hasher.update(b"|");
    hasher.update(threshold.map_or(u64::MAX, f64::to_bits).to_le_bytes());
    hasher.update(b"|");
    hasher.update(alpha.map_or(u64::MAX, f64::to_bits).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    response: Arc<QueryResponse>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Keys with their insertion sequence, oldest at the front.
    order: VecDeque<(u64, String)>,
    next_seq: u64,
    generation: u64,
}

/// Bounded, thread-safe FIFO cache of query responses.
///
/// A capacity of zero disables caching: every `get` misses and `put` is a
/// no-op.
#[derive(Debug)]
pub struct QueryCache {
    capacity: usize,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, CacheError> {
        self.inner.lock().map_err(|_| CacheError::Poisoned)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, key: &str) -> Result<Option<Arc<QueryResponse>>, CacheError> {
        let found = self.lock()?.entries.get(key).map(|e| Arc::clone(&e.response));
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(found)
    }

    /// Insert at the tail, evicting from the head while over capacity.
    ///
    /// An existing entry for `key` is kept as is.
    pub fn put(&self, key: &str, response: Arc<QueryResponse>) -> Result<(), CacheError> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut inner = self.lock()?;
        self.insert(&mut inner, key, response);
        Ok(())
    }

    /// Like [`put`](Self::put), but only if no invalidation happened since
    /// `generation` was read. Returns whether the response was stored.
    pub fn put_if_generation(
        &self,
        key: &str,
        response: Arc<QueryResponse>,
        generation: u64,
    ) -> Result<bool, CacheError> {
        if self.capacity == 0 {
            return Ok(false);
        }
        let mut inner = self.lock()?;
        if inner.generation != generation {
            return Ok(false);
        }
        Ok(self.insert(&mut inner, key, response))
    }

    /// Current invalidation generation.
    pub fn generation(&self) -> Result<u64, CacheError> {
        Ok(self.lock()?.generation)
    }

    fn insert(&self, inner: &mut Inner, key: &str, response: Arc<QueryResponse>) -> bool {
        if inner.entries.contains_key(key) {
            return false;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(key.to_string(), Entry { seq, response });
        inner.order.push_back((seq, key.to_string()));

        while inner.entries.len() > self.capacity {
            let Some((seq, oldest)) = inner.order.pop_front() else {
                break;
            };
            // Skip queue slots left behind by invalidated entries.
            if inner.entries.get(&oldest).is_some_and(|e| e.seq == seq) {
                inner.entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Drop every entry. Counters are kept.
    pub fn invalidate_all(&self) -> Result<usize, CacheError> {
        let mut inner = self.lock()?;
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        inner.generation += 1;
        Ok(dropped)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}
