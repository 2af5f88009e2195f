use parking_lot::RwLock;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

use ov_types::{ArtifactRef, CacheError};

use crate::key::CacheKey;
use crate::store::{CacheStats, RunCache};

/// Cache that never remembers anything. Pass outputs go to a scratch
/// directory removed when the cache is dropped.
pub struct NoopCache {
    scratch: TempDir,
    stats: RwLock<CacheStats>,
}

impl NoopCache {
    pub fn new() -> Result<Self, CacheError> {
        Ok(Self {
            scratch: tempfile::Builder::new().prefix("olivine-scratch").tempdir()?,
            stats: RwLock::new(CacheStats::default()),
        })
    }
}

impl RunCache for NoopCache {
    fn lookup(&self, _key: &CacheKey) -> Result<Option<ArtifactRef>, CacheError> {
        self.stats.write().misses += 1;
        Ok(None)
    }

    fn store(&self, _key: &CacheKey, _pass_type: &str, _artifact: &ArtifactRef) -> Result<(), CacheError> {
        Ok(())
    }

    fn invalidate(&self, _key: &CacheKey) -> Result<bool, CacheError> {
        Ok(false)
    }

    fn clear(&self) -> Result<(), CacheError> {
        *self.stats.write() = CacheStats::default();
        Ok(())
    }

    fn allocate_output(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        let dir = self
            .scratch
            .path()
            .join(key.to_hex())
            .join(uuid::Uuid::new_v4().simple().to_string());
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}
