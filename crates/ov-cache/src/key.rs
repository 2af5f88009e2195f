use serde::{Deserialize, Serialize};
use std::fmt;

use ov_types::{ArtifactId, ContentHasher, Digest, ExecutionTarget, ResolvedPass};

/// Stable key of one pass execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(pub Digest);

impl CacheKey {
    /// Hash of the pass type, its output-affecting parameters, the input
    /// artifact, the host it runs on and the calibration data it reads.
    pub fn derive(
        pass: &ResolvedPass,
        input: &ArtifactId,
        host: &ExecutionTarget,
        data_id: Option<&str>,
    ) -> Self {
        let mut hasher = ContentHasher::new("olivine.cache");
        hasher
            .digest(&pass.identity_digest())
            .digest(&input.0)
            .str(&host.name)
            .str(&format!("{:?}", host.device))
            .str(&host.execution_providers.join(","))
            .str(data_id.unwrap_or(""));
        CacheKey(hasher.finish())
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
