//! Writes the footprint, the run report and the selected models to the
//! output directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use ov_optimizer::Footprint;
use ov_types::{ArtifactLocation, EvaluationResult, OvResult};

pub const FOOTPRINT_FILE: &str = "footprint.json";
pub const REPORT_FILE: &str = "report.json";
pub const MODELS_DIR: &str = "models";

/// A selected result and where its model was copied to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    /// 1 is the best.
    pub rank: usize,
    pub result: EvaluationResult,
    pub model_dir: PathBuf,
}

pub struct OutputWriter {
    root: PathBuf,
}

impl OutputWriter {
    pub fn new(root: impl Into<PathBuf>) -> OvResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write_footprint(&self, footprint: &Footprint) -> OvResult<PathBuf> {
        let path = self.root.join(FOOTPRINT_FILE);
        footprint.save(&path)?;
        Ok(path)
    }

    pub fn write_report<T: Serialize>(&self, report: &T) -> OvResult<PathBuf> {
        let path = self.root.join(REPORT_FILE);
        fs::write(&path, serde_json::to_string_pretty(report)?)?;
        Ok(path)
    }

    /// Copy each selected model into `models/<rank>-<run id>/` next to the
    /// configuration that produced it. Handles cannot be copied; their
    /// reference is written as `artifact.json` instead.
    pub fn write_models(&self, results: &[&EvaluationResult]) -> OvResult<Vec<RankedResult>> {
        let models = self.root.join(MODELS_DIR);
        if models.exists() {
            fs::remove_dir_all(&models)?;
        }

        let mut ranked = Vec::with_capacity(results.len());
        for (i, result) in results.iter().enumerate() {
            let rank = i + 1;
            let dir = models.join(format!("{}-{}", rank, result.run_config.id.short()));
            fs::create_dir_all(&dir)?;

            match &result.artifact.location {
                ArtifactLocation::File { path } => {
                    let name = path.file_name().map(PathBuf::from).unwrap_or_else(|| "model".into());
                    fs::copy(path, dir.join(name))?;
                }
                ArtifactLocation::Directory { path } => copy_dir(path, &dir.join("model"))?,
                ArtifactLocation::Handle { .. } => {}
            }
            fs::write(
                dir.join("artifact.json"),
                serde_json::to_string_pretty(&result.artifact)?,
            )?;
            fs::write(
                dir.join("run_config.json"),
                serde_json::to_string_pretty(&result.run_config)?,
            )?;

            info!("Wrote model rank {} to {}", rank, dir.display());
            ranked.push(RankedResult {
                rank,
                result: (*result).clone(),
                model_dir: dir,
            });
        }
        Ok(ranked)
    }
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
