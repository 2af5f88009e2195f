use dashmap::DashMap;
use parking_lot::RwLock;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use ov_types::{ArtifactRef, CacheError};

use crate::key::CacheKey;
use crate::store::{CacheEntry, CacheStats, RunCache};

/// Durable cache rooted at a directory.
///
/// Layout:
/// - `<root>/index/<first 2 hex chars>/<remaining hex chars>.json`: one entry per key
/// - `<root>/artifacts/<key hex>/<execution id>/`: pass outputs
///
/// Index files are written to a temporary file and renamed into place, so a
/// crashed writer never leaves a torn entry behind.
pub struct FsRunCache {
    root: PathBuf,
    index: DashMap<CacheKey, CacheEntry>,
    stats: RwLock<CacheStats>,
}

impl FsRunCache {
    /// Open (creating if needed) the cache at `root` and load its index.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        let unavailable = |e: std::io::Error| CacheError::Unavailable {
            path: root.display().to_string(),
            message: e.to_string(),
        };

        fs::create_dir_all(root.join("index")).map_err(unavailable)?;
        fs::create_dir_all(root.join("artifacts")).map_err(unavailable)?;
        // Fails early on a read-only index; the file is removed on drop.
        NamedTempFile::new_in(root.join("index")).map_err(unavailable)?;

        let cache = Self {
            root,
            index: DashMap::new(),
            stats: RwLock::new(CacheStats::default()),
        };
        cache.load_index()?;
        info!(
            root = %cache.root.display(),
            entries = cache.index.len(),
            "Opened run cache"
        );
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of every entry, oldest first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.index.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        entries
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let hex = key.to_hex();
        self.index_dir()
            .join(&hex[..2])
            .join(format!("{}.json", &hex[2..]))
    }

    fn load_index(&self) -> Result<(), CacheError> {
        for shard in fs::read_dir(self.index_dir())? {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for file in fs::read_dir(&shard)? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_entry(&path) {
                    Ok(entry) => {
                        self.index.insert(entry.key, entry);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry"),
                }
            }
        }
        Ok(())
    }

    /// Entries written by another process after this one opened the cache.
    fn read_through(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let entry = read_entry(&path).map_err(|e| CacheError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.index.insert(*key, entry.clone());
        Ok(Some(entry))
    }

    fn drop_entry(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let path = self.entry_path(key);
        let previous = match self.index.remove(key) {
            Some((_, entry)) => Some(entry),
            None => read_entry(&path).ok(),
        };
        let removed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => previous.is_some(),
            Err(e) => return Err(e.into()),
        };
        if let Some(entry) = previous {
            self.remove_artifact(&entry.artifact)?;
        }
        Ok(removed)
    }

    /// The `artifacts/<key>/<execution>` directory holding `artifact`, if it
    /// was allocated by this cache.
    fn execution_dir(&self, artifact: &ArtifactRef) -> Option<PathBuf> {
        let artifacts = self.artifacts_dir();
        let rel = artifact.location.path()?.strip_prefix(&artifacts).ok()?;
        let mut parts = rel.components();
        let key_dir = parts.next()?;
        let execution = parts.next()?;
        Some(artifacts.join(key_dir).join(execution))
    }

    fn remove_artifact(&self, artifact: &ArtifactRef) -> Result<(), CacheError> {
        let Some(dir) = self.execution_dir(artifact) else {
            return Ok(());
        };
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "Removed cached artifact");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Drop the per-key directory once its last execution is gone.
        if let Some(key_dir) = dir.parent() {
            fs::remove_dir(key_dir).ok();
        }
        Ok(())
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry, CacheError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl RunCache for FsRunCache {
    fn lookup(&self, key: &CacheKey) -> Result<Option<ArtifactRef>, CacheError> {
        let entry = match self.index.get(key) {
            Some(entry) => Some(entry.value().clone()),
            None => self.read_through(key)?,
        };

        let Some(entry) = entry else {
            self.stats.write().misses += 1;
            return Ok(None);
        };

        if !entry.artifact.location.exists() {
            warn!(key = %key.short(), location = %entry.artifact.location, "Cached artifact is gone, dropping entry");
            self.drop_entry(key)?;
            let mut stats = self.stats.write();
            stats.stale += 1;
            stats.misses += 1;
            return Ok(None);
        }

        self.stats.write().hits += 1;
        debug!(key = %key.short(), pass = %entry.pass_type, "Cache hit");
        Ok(Some(entry.artifact))
    }

    fn store(
        &self,
        key: &CacheKey,
        pass_type: &str,
        artifact: &ArtifactRef,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry::new(*key, pass_type, artifact.clone());
        let path = self.entry_path(key);
        let shard = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&shard)?;

        let previous = match self.index.get(key) {
            Some(existing) => Some(existing.value().clone()),
            None => read_entry(&path).ok(),
        };

        let mut tmp = NamedTempFile::new_in(&shard)?;
        tmp.write_all(&serde_json::to_vec_pretty(&entry)?)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        self.index.insert(*key, entry);
        if let Some(previous) = previous {
            if self.execution_dir(&previous.artifact) != self.execution_dir(artifact) {
                self.remove_artifact(&previous.artifact)?;
            }
        }
        self.stats.write().stores += 1;
        debug!(key = %key.short(), pass = %pass_type, "Stored cache entry");
        Ok(())
    }

    fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let removed = self.drop_entry(key)?;
        if removed {
            self.stats.write().invalidations += 1;
            info!(key = %key.short(), "Invalidated cache entry");
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<(), CacheError> {
        for dir in [self.index_dir(), self.artifacts_dir()] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir_all(&dir)?;
        }
        self.index.clear();
        *self.stats.write() = CacheStats::default();
        info!(root = %self.root.display(), "Cleared run cache");
        Ok(())
    }

    fn allocate_output(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        let dir = self
            .artifacts_dir()
            .join(key.to_hex())
            .join(uuid::Uuid::new_v4().simple().to_string());
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().clone();
        stats.entries = self.index.len();
        stats
    }
}
