use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use promptmend_core::{AnalysisResult, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Fingerprint-keyed store of finished analyses.
///
/// Entries are immutable once written. `get` hands out an owned copy, so a
/// caller can never alias a stored result. A second `put` for the same
/// fingerprint replaces the entry wholesale; readers never observe a
/// partially written value.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<AnalysisResult>>;

    async fn put(&self, fingerprint: &Fingerprint, result: &AnalysisResult) -> Result<()>;

    fn stats(&self) -> CacheStats;

    fn backend_name(&self) -> &'static str;
}

/// Lock-free counters shared by the backends
#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl StatsCounter {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);

        let counter = StatsCounter::default();
        counter.record_hit();
        counter.record_hit();
        counter.record_hit();
        counter.record_miss();
        let stats = counter.snapshot(3);
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(stats.entries, 3);
    }
}
