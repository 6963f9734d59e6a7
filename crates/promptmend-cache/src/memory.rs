use crate::fingerprint::Fingerprint;
use crate::store::{CacheStats, ResultCache, StatsCounter};
use async_trait::async_trait;
use dashmap::DashMap;
use promptmend_core::{AnalysisResult, Result};
use tracing::debug;

/// Process-local cache backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryResultCache {
    entries: DashMap<Fingerprint, AnalysisResult>,
    stats: StatsCounter,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<AnalysisResult>> {
        let found = self.entries.get(fingerprint).map(|entry| entry.value().clone());
        match found {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        debug!(%fingerprint, hit = found.is_some(), "memory cache lookup");
        Ok(found)
    }

    async fn put(&self, fingerprint: &Fingerprint, result: &AnalysisResult) -> Result<()> {
        self.entries.insert(fingerprint.clone(), result.clone());
        self.stats.record_write();
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.entries.len())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
