//! Statistics and health reporting.
//!
//! [`Stats`] summarises what is indexed and how well the query cache is
//! doing; [`Health`] reports whether each dependency is usable. Both
//! serialize to JSON for `--json` output and print as aligned text
//! otherwise.

use serde::Serialize;

use rag_harness_core::store::PoolState;

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub document_count: i64,
    pub chunk_count: i64,
    pub avg_chunks_per_document: f64,
    pub cache_size: usize,
    pub cache_capacity: usize,
    /// Fraction of cache lookups that hit, in `[0, 1]`.
    pub cache_hit_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub live_retrievals: u64,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub pool: PoolState,
    pub embedding_model_ready: bool,
    pub database_reachable: bool,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.embedding_model_ready && self.database_reachable
    }
}

pub fn average(chunks: i64, documents: i64) -> f64 {
    if documents > 0 {
        chunks as f64 / documents as f64
    } else {
        0.0
    }
}

pub fn print_stats(stats: &Stats, db_size: Option<u64>) {
    println!("RAG Harness - Stats");
    println!("===================");
    println!();
    if let Some(size) = db_size {
        println!("  Size:        {}", format_bytes(size));
    }
    println!("  Documents:   {}", stats.document_count);
    println!("  Chunks:      {}", stats.chunk_count);
    println!("  Avg chunks:  {:.2}", stats.avg_chunks_per_document);
    println!("  Model:       {}", stats.embedding_model);
    println!();
    println!(
        "  Cache:       {} / {} entries",
        stats.cache_size, stats.cache_capacity
    );
    println!(
        "  Hit rate:    {:.1}% ({} hits, {} misses, {} evictions)",
        stats.cache_hit_rate * 100.0,
        stats.cache_hits,
        stats.cache_misses,
        stats.cache_evictions
    );
    println!();
}

pub fn print_health(health: &Health) {
    let flag = |ok: bool| if ok { "ok" } else { "FAIL" };
    println!("  database:    {}", flag(health.database_reachable));
    println!("  embedding:   {}", flag(health.embedding_model_ready));
    println!(
        "  pool:        {} active, {} idle, {} capacity",
        health.pool.active, health.pool.idle, health.pool.capacity
    );
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_average_handles_empty() {
        assert_eq!(average(10, 0), 0.0);
        assert!((average(7, 2) - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_health_requires_both() {
        let mut health = Health {
            pool: PoolState::default(),
            embedding_model_ready: true,
            database_reachable: true,
        };
        assert!(health.is_healthy());
        health.database_reachable = false;
        assert!(!health.is_healthy());
    }
}
