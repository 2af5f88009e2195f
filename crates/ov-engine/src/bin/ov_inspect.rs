//! `ov-inspect`: look at what a run left behind.
//!
//! - `footprint <file>`: list the evaluated configurations and mark the
//!   Pareto frontier
//! - `cache stats [dir]`: entry count and per pass type breakdown
//! - `cache clear [dir]`: drop every cached pass output

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::Level;

use ov_cache::{FsRunCache, RunCache};
use ov_engine::{default_cache_dir, init_tracing};
use ov_optimizer::FootprintDocument;

#[derive(Parser)]
#[command(name = "ov-inspect")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect Olivine footprints and run caches", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a footprint.json
    Footprint {
        path: PathBuf,
    },

    /// Run cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry counts
    Stats {
        /// Cache directory (default: $OLIVINE_CACHE_DIR or the user cache dir)
        dir: Option<PathBuf>,
    },
    /// Remove every entry and stored artifact
    Clear {
        dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(if cli.verbose { Level::DEBUG } else { Level::WARN });

    match cli.command {
        Commands::Footprint { path } => show_footprint(&path),
        Commands::Cache { action } => match action {
            CacheAction::Stats { dir } => {
                let cache = open_cache(dir)?;
                let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
                for entry in cache.entries() {
                    *by_type.entry(entry.pass_type).or_default() += 1;
                }
                println!("cache: {}", cache.root().display());
                println!("entries: {}", cache.stats().entries);
                for (pass_type, count) in by_type {
                    println!("  {pass_type:<24} {count}");
                }
                Ok(())
            }
            CacheAction::Clear { dir } => {
                let cache = open_cache(dir)?;
                let before = cache.stats().entries;
                cache.clear()?;
                println!("removed {} entries from {}", before, cache.root().display());
                Ok(())
            }
        },
    }
}

fn open_cache(dir: Option<PathBuf>) -> Result<FsRunCache> {
    let dir = dir.unwrap_or_else(default_cache_dir);
    FsRunCache::open(&dir).with_context(|| format!("opening cache at {}", dir.display()))
}

fn show_footprint(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let document: FootprintDocument =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    if let Some(baseline) = &document.baseline {
        println!("baseline");
        for (key, score) in &baseline.scores {
            println!("  {key:<24} {:>12.4}", score.value);
        }
    }
    println!("{} configurations", document.records.len());
    for entry in &document.records {
        let marker = if entry.pareto { "*" } else { " " };
        println!(
            "{} {}  {}",
            marker,
            entry.result.run_config.id.short(),
            entry.result.run_config.describe()
        );
        for (key, score) in &entry.result.scores {
            println!("    {key:<22} {:>12.4}", score.value);
        }
    }
    Ok(())
}
