pub mod disk;
pub mod fingerprint;
pub mod memory;
pub mod store;

pub use disk::DiskResultCache;
pub use fingerprint::{Fingerprint, FINGERPRINT_TURNS};
pub use memory::MemoryResultCache;
pub use store::{CacheStats, ResultCache};

use promptmend_core::{CacheConfig, Result};
use std::sync::Arc;

/// Build the configured backend, or `None` when caching is disabled
pub async fn create_cache(config: &CacheConfig) -> Result<Option<Arc<dyn ResultCache>>> {
    if !config.enabled {
        return Ok(None);
    }

    let cache: Arc<dyn ResultCache> = match config.backend.as_str() {
        "disk" => Arc::new(DiskResultCache::open(config.resolved_directory()).await?),
        _ => Arc::new(MemoryResultCache::new()),
    };
    Ok(Some(cache))
}
