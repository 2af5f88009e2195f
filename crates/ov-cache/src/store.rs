use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use ov_types::{ArtifactRef, CacheError};

use crate::key::CacheKey;

/// A stored pass output. Immutable; invalidation removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub pass_type: String,
    pub artifact: ArtifactRef,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, pass_type: &str, artifact: ArtifactRef) -> Self {
        Self {
            key,
            pass_type: pass_type.to_string(),
            artifact,
            created_at: Utc::now(),
        }
    }
}

/// Storage for pass outputs keyed by [`CacheKey`].
///
/// `lookup` and `store` may be called concurrently. Two callers computing the
/// same key both execute; the later `store` wins. `clear` must only be called
/// between runs.
pub trait RunCache: Send + Sync {
    fn lookup(&self, key: &CacheKey) -> Result<Option<ArtifactRef>, CacheError>;

    /// Record `artifact` under `key`, overwriting any previous entry.
    fn store(&self, key: &CacheKey, pass_type: &str, artifact: &ArtifactRef)
        -> Result<(), CacheError>;

    /// Remove the entry for `key`. Entries computed from its output are kept.
    fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError>;

    fn clear(&self) -> Result<(), CacheError>;

    /// A fresh, empty directory for a pass execution that will be stored
    /// under `key`.
    fn allocate_output(&self, key: &CacheKey) -> Result<PathBuf, CacheError>;

    fn stats(&self) -> CacheStats;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub invalidations: u64,
    /// Entries dropped because their artifact disappeared from disk.
    pub stale: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}
