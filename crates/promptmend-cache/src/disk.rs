use crate::fingerprint::Fingerprint;
use crate::store::{CacheStats, ResultCache, StatsCounter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promptmend_core::{AnalysisResult, PromptMendError, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    fingerprint: Fingerprint,
    stored_at: DateTime<Utc>,
    result: AnalysisResult,
}

/// One JSON document per fingerprint under a directory.
///
/// Writes go to a uniquely named temporary file that is renamed over the
/// final path, so a concurrent reader sees either the previous entry or the
/// complete new one.
#[derive(Debug)]
pub struct DiskResultCache {
    directory: PathBuf,
    stats: StatsCounter,
    temp_counter: AtomicU64,
    /// Seeded from the directory at open, then kept by `put`
    entries: AtomicUsize,
}

impl DiskResultCache {
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await.map_err(|e| {
            PromptMendError::Cache(format!(
                "cannot create cache directory {}: {}",
                directory.display(),
                e
            ))
        })?;
        let entries = count_entries(&directory).await;
        info!(
            "💾 Disk result cache at {} ({} entries)",
            directory.display(),
            entries
        );

        Ok(Self {
            directory,
            stats: StatsCounter::default(),
            temp_counter: AtomicU64::new(0),
            entries: AtomicUsize::new(entries),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.directory.join(format!("{}.json", fingerprint))
    }

    fn temp_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.directory
            .join(format!(".{}.{}.{}.tmp", fingerprint, std::process::id(), n))
    }
}

async fn count_entries(directory: &Path) -> usize {
    let Ok(mut entries) = fs::read_dir(directory).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.path().extension().is_some_and(|ext| ext == "json") {
            count += 1;
        }
    }
    count
}

#[async_trait]
impl ResultCache for DiskResultCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<AnalysisResult>> {
        let path = self.entry_path(fingerprint);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.stats.record_miss();
                debug!(%fingerprint, "disk cache miss");
                return Ok(None);
            }
            Err(e) => {
                return Err(PromptMendError::Cache(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        match serde_json::from_slice::<StoredEntry>(&bytes) {
            Ok(entry) if entry.fingerprint == *fingerprint => {
                self.stats.record_hit();
                debug!(%fingerprint, stored_at = %entry.stored_at, "disk cache hit");
                Ok(Some(entry.result))
            }
            Ok(_) => {
                warn!(%fingerprint, "cache entry carries a different fingerprint, ignoring");
                self.stats.record_miss();
                Ok(None)
            }
            Err(e) => {
                warn!(%fingerprint, "unreadable cache entry, ignoring: {}", e);
                self.stats.record_miss();
                Ok(None)
            }
        }
    }

    async fn put(&self, fingerprint: &Fingerprint, result: &AnalysisResult) -> Result<()> {
        let entry = StoredEntry {
            fingerprint: fingerprint.clone(),
            stored_at: Utc::now(),
            result: result.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;

        let entry_path = self.entry_path(fingerprint);
        let existed = fs::try_exists(&entry_path).await.unwrap_or(false);

        let temp_path = self.temp_path(fingerprint);
        fs::write(&temp_path, bytes).await.map_err(|e| {
            PromptMendError::Cache(format!("cannot write {}: {}", temp_path.display(), e))
        })?;

        // Atomic replace
        if let Err(e) = fs::rename(&temp_path, &entry_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(PromptMendError::Cache(format!(
                "cannot commit cache entry {}: {}",
                fingerprint, e
            )));
        }

        if !existed {
            self.entries.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.record_write();
        debug!(%fingerprint, "disk cache write");
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.entries.load(Ordering::Relaxed))
    }

    fn backend_name(&self) -> &'static str {
        "disk"
    }
}
