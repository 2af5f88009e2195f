//! Artifact references and the digests that identify them.
//!
//! An artifact is never modified in place: every pass that transforms a model
//! materializes a new artifact, and its identity folds together the producing
//! step's cache key, the materialized location and a digest of the content.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

/// Chunk size used when streaming files through the hasher.
const CHUNK_SIZE: usize = 1024 * 1024;

/// SHA-256 digest used for every content address in the system.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First twelve hex characters, for log lines and directory names.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl FromStr for Digest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| format!("invalid digest hex: {s}"))?;
        if bytes.len() != 32 {
            return Err(format!("invalid digest length: {s}"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_hex()
    }
}

impl TryFrom<String> for Digest {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Incremental hasher over labelled, length-prefixed fields.
///
/// Length prefixes keep `("ab", "c")` and `("a", "bc")` from colliding.
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new(domain: &str) -> Self {
        let mut hasher = Self {
            inner: Sha256::new(),
        };
        hasher.field(domain.as_bytes());
        hasher
    }

    pub fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.field(value.as_bytes())
    }

    pub fn digest(&mut self, value: &Digest) -> &mut Self {
        self.field(value.as_bytes())
    }

    pub fn finish(self) -> Digest {
        let hash = self.inner.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Digest(bytes)
    }
}

/// Stable identity of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub Digest);

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a model representation lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactLocation {
    File { path: PathBuf },
    Directory { path: PathBuf },
    /// Opaque handle owned by an external runtime (e.g. an in-memory model).
    Handle { handle: String },
}

impl ArtifactLocation {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path } | Self::Directory { path } => Some(path),
            Self::Handle { .. } => None,
        }
    }

    /// Whether the backing storage is still present. Handles are assumed live.
    pub fn exists(&self) -> bool {
        match self {
            Self::File { path } => path.is_file(),
            Self::Directory { path } => path.is_dir(),
            Self::Handle { .. } => true,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::File { path } => format!("file:{}", path.display()),
            Self::Directory { path } => format!("dir:{}", path.display()),
            Self::Handle { handle } => format!("handle:{handle}"),
        }
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Immutable reference to a model representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: ArtifactId,
    pub location: ArtifactLocation,
    /// Free-form format tag ("onnx", "openvino", "hf", ...).
    pub format: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ArtifactRef {
    /// Reference to the unmodified input model. Its identity is derived from the
    /// declared location and version only, so it is cheap and stable.
    pub fn input(location: ArtifactLocation, version: Option<&str>, format: Option<String>) -> Self {
        let mut hasher = ContentHasher::new("olivine.input");
        hasher.str(&location.describe()).str(version.unwrap_or(""));
        Self {
            id: ArtifactId(hasher.finish()),
            location,
            format,
            created_at: Utc::now(),
        }
    }

    /// Reference to an artifact a pass just materialized.
    ///
    /// Fails if the location claims a file or directory that does not exist.
    pub fn produced(
        location: ArtifactLocation,
        format: Option<String>,
        producer: &Digest,
    ) -> io::Result<Self> {
        let content = match &location {
            ArtifactLocation::File { path } | ArtifactLocation::Directory { path } => {
                content_digest(path)?
            }
            ArtifactLocation::Handle { handle } => Digest::compute(handle.as_bytes()),
        };

        let mut hasher = ContentHasher::new("olivine.produced");
        hasher
            .digest(producer)
            .digest(&content)
            .str(&location.describe());

        Ok(Self {
            id: ArtifactId(hasher.finish()),
            location,
            format,
            created_at: Utc::now(),
        })
    }
}

/// Digest the content at `path`. Directories hash every regular file (in
/// parallel) together with its relative path, so renames change the digest.
/// Symlinks inside a directory are skipped.
pub fn content_digest(path: &Path) -> io::Result<Digest> {
    let meta = fs::metadata(path)?;
    if meta.is_file() {
        return file_digest(path);
    }

    let mut files = collect_files(path)?;
    files.sort();

    let digests = files
        .par_iter()
        .map(|rel| file_digest(&path.join(rel)).map(|d| (rel, d)))
        .collect::<io::Result<Vec<_>>>()?;

    let mut hasher = ContentHasher::new("olivine.dir");
    for (rel, digest) in digests {
        hasher.str(&rel.to_string_lossy()).digest(&digest);
    }
    Ok(hasher.finish())
}

fn file_digest(path: &Path) -> io::Result<Digest> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let hash = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hash);
    Ok(Digest(bytes))
}

/// Regular files under `root`, relative to it. Symlinks are not followed.
fn collect_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
    }
    Ok(files)
}
