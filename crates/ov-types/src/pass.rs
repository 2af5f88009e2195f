//! The contract every pass implementation honors.

use std::path::PathBuf;
use std::sync::Arc;

use crate::artifact::{ArtifactLocation, ArtifactRef};
use crate::data::DataProvider;
use crate::run::ResolvedPass;
use crate::system::ExecutionTarget;

/// Everything a pass may use besides its input artifact and parameters.
#[derive(Clone)]
pub struct PassContext {
    pub step_index: usize,
    /// Fresh, empty directory owned by this execution. Outputs written here
    /// are managed by the run cache.
    pub output_dir: PathBuf,
    pub target: ExecutionTarget,
    pub data: Option<Arc<dyn DataProvider>>,
}

impl std::fmt::Debug for PassContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassContext")
            .field("step_index", &self.step_index)
            .field("output_dir", &self.output_dir)
            .field("target", &self.target.name)
            .field("data", &self.data.as_ref().map(|d| d.id().to_string()))
            .finish()
    }
}

/// What a pass hands back: where the new model lives.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutput {
    pub location: ArtifactLocation,
    pub format: Option<String>,
}

impl PassOutput {
    pub fn file(path: impl Into<PathBuf>, format: Option<&str>) -> Self {
        Self {
            location: ArtifactLocation::File { path: path.into() },
            format: format.map(str::to_string),
        }
    }

    pub fn directory(path: impl Into<PathBuf>, format: Option<&str>) -> Self {
        Self {
            location: ArtifactLocation::Directory { path: path.into() },
            format: format.map(str::to_string),
        }
    }
}

/// Errors surfaced by pass implementations.
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("{0}")]
    Failed(String),
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A model transformation step.
///
/// Implementations must be deterministic: identical input artifact, resolved
/// parameters and target must yield equivalent output. The run cache relies
/// on this and cannot verify it.
///
/// `execute` is a blocking call. The engine runs it on a worker thread and may
/// stop waiting after a timeout, but it cannot interrupt the call itself; an
/// implementation that ignores its budget keeps running in the background.
pub trait Pass: Send + Sync {
    fn execute(
        &self,
        input: &ArtifactRef,
        params: &ResolvedPass,
        ctx: &PassContext,
    ) -> Result<PassOutput, PassError>;

    /// Semantic checks beyond the declared schema (e.g. "int4 requires a
    /// group size"). A rejected configuration is pruned, not executed.
    fn validate(&self, _params: &ResolvedPass, _target: &ExecutionTarget) -> Result<(), String> {
        Ok(())
    }
}
