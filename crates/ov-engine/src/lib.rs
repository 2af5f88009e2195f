//! # ov-engine
//!
//! Olivine's orchestration layer. A [`RunDocument`] names an input model, a
//! chain of passes, the metrics to score with and a search strategy; the
//! [`Engine`] validates it against the [`Registries`], evaluates the input as a
//! baseline, then drives the search: every proposed configuration runs
//! through the [`PipelineExecutor`] (served from the run cache where
//! possible) and the [`Evaluator`]. The best results are copied to the output
//! directory together with the footprint and a report.

pub mod config;
pub mod engine;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod output;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{
    default_cache_dir, default_output_dir, EngineOptions, EvaluatorConfig, InputModelConfig,
    ResolvedMetric, ResolvedSubMetric, RunDocument, ValidatedRun,
};
pub use engine::{Engine, EngineReport};
pub use evaluator::Evaluator;
pub use events::{EngineEvent, EngineEventKind, EventSink};
pub use executor::{PipelineExecutor, PipelineOutput, StepRecord};
pub use output::{OutputWriter, RankedResult};
pub use registry::{DataFactory, DataRegistry, MetricRegistry, PassRegistry, Registries};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `level`; later calls
/// are ignored.
pub fn init_tracing(level: Level) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .ok();
}
