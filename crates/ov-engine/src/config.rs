//! The run document: what to optimize, how, and where to put the results.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ov_optimizer::{SearchConfig, SearchSpace};
use ov_types::{
    ArtifactLocation, ArtifactRef, DataConfig, DataProvider, Direction, ExecutionTarget, Goal,
    MetricSpec, OvResult, PassSpec, RunTemplate, SchemaError, SystemCatalog, SystemConfig,
    TargetResolver, LOCAL_SYSTEM,
};

use crate::registry::Registries;

pub const CACHE_DIR_ENV: &str = "OLIVINE_CACHE_DIR";
pub const OUTPUT_DIR_ENV: &str = "OLIVINE_OUTPUT_DIR";

/// `$OLIVINE_CACHE_DIR`, else the platform cache directory, else `./.olivine/cache`.
pub fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("olivine"))
        .unwrap_or_else(|| PathBuf::from(".olivine").join("cache"))
}

/// `$OLIVINE_OUTPUT_DIR`, else `./olivine-output`.
pub fn default_output_dir() -> PathBuf {
    std::env::var(OUTPUT_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("olivine-output"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputModelConfig {
    pub location: ArtifactLocation,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub metrics: Vec<MetricSpec>,
}

fn local() -> String {
    LOCAL_SYSTEM.to_string()
}

fn default_true() -> bool {
    true
}

fn default_output_model_count() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// System that runs the passes.
    #[serde(default = "local")]
    pub host: String,
    /// System the metrics are measured on.
    #[serde(default = "local")]
    pub target: String,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Wipe the cache before running.
    #[serde(default)]
    pub clean_cache: bool,
    /// Score the unmodified input as the baseline for relative goals.
    #[serde(default = "default_true")]
    pub evaluate_input_model: bool,
    /// Run without caching instead of failing when the cache is unusable.
    #[serde(default)]
    pub tolerate_cache_failure: bool,
    #[serde(default)]
    pub pass_timeout_secs: Option<u64>,
    #[serde(default = "default_output_model_count")]
    pub output_model_count: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            host: local(),
            target: local(),
            cache_dir: None,
            output_dir: None,
            clean_cache: false,
            evaluate_input_model: true,
            tolerate_cache_failure: false,
            pass_timeout_secs: None,
            output_model_count: default_output_model_count(),
        }
    }
}

impl EngineOptions {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(default_output_dir)
    }
}

/// A complete run description as authored by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDocument {
    pub input_model: InputModelConfig,
    #[serde(default)]
    pub systems: BTreeMap<String, SystemConfig>,
    #[serde(default)]
    pub data_configs: BTreeMap<String, DataConfig>,
    pub passes: Vec<PassSpec>,
    #[serde(default)]
    pub evaluator: Option<EvaluatorConfig>,
    /// Absent means search is disabled: the pipeline runs once with fixed
    /// parameters.
    #[serde(default)]
    pub search_strategy: Option<SearchConfig>,
    #[serde(default)]
    pub engine: EngineOptions,
}

/// One sub-type of a metric with its priority and direction settled.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSubMetric {
    pub name: String,
    /// Footprint key, `metric.sub_type`.
    pub key: String,
    pub priority: u32,
    pub direction: Option<Direction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMetric {
    pub spec: MetricSpec,
    pub sub_types: Vec<ResolvedSubMetric>,
}

/// A document that passed validation, with every reference looked up.
pub struct ValidatedRun {
    pub template: RunTemplate,
    pub input: ArtifactRef,
    pub host: ExecutionTarget,
    pub target: ExecutionTarget,
    pub metrics: Vec<ResolvedMetric>,
    pub goals: Vec<Goal>,
    pub search: Option<SearchConfig>,
    pub data: BTreeMap<String, Arc<dyn DataProvider>>,
    pub options: EngineOptions,
}

impl ValidatedRun {
    pub fn search_enabled(&self) -> bool {
        self.search.is_some()
    }
}

impl RunDocument {
    pub fn from_json_str(json: &str) -> OvResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> OvResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check the document against the registries. Nothing is executed.
    pub fn validate(&self, registries: &Registries) -> Result<ValidatedRun, SchemaError> {
        let catalog = SystemCatalog::new(self.systems.clone());
        let resolve_system = |name: &str| {
            catalog
                .resolve(name)
                .ok_or_else(|| SchemaError::UnknownReference {
                    kind: "system".into(),
                    name: name.to_string(),
                })
        };
        let host = resolve_system(&self.engine.host)?;
        let target = resolve_system(&self.engine.target)?;

        let mut data = BTreeMap::new();
        for (name, config) in &self.data_configs {
            data.insert(name.clone(), registries.data.create(name, config)?);
        }
        let check_data_ref = |name: &Option<String>| match name {
            Some(name) if !data.contains_key(name) => Err(SchemaError::UnknownReference {
                kind: "data config".into(),
                name: name.clone(),
            }),
            _ => Ok(()),
        };

        let mut pass_names = BTreeSet::new();
        let mut passes = Vec::with_capacity(self.passes.len());
        for spec in &self.passes {
            if spec.name.is_empty() || spec.name.contains('.') {
                return Err(SchemaError::Invalid {
                    message: format!("pass name {:?} must be non-empty and contain no '.'", spec.name),
                });
            }
            if !pass_names.insert(spec.name.as_str()) {
                return Err(SchemaError::DuplicateName {
                    kind: "pass".into(),
                    name: spec.name.clone(),
                });
            }
            let template = registries.passes.template_for(spec)?;
            if registries.passes.implementation(&spec.pass_type).is_none() {
                return Err(SchemaError::MissingImplementation {
                    kind: "pass".into(),
                    name: spec.pass_type.clone(),
                });
            }
            check_data_ref(&spec.data_config)?;
            passes.push(template);
        }
        let template = RunTemplate::new(passes);

        let metric_specs = self
            .evaluator
            .as_ref()
            .map(|e| e.metrics.as_slice())
            .unwrap_or_default();
        for spec in metric_specs {
            if registries.metrics.get(&spec.metric_type).is_none() {
                return Err(SchemaError::MissingImplementation {
                    kind: "metric".into(),
                    name: spec.metric_type.clone(),
                });
            }
            check_data_ref(&spec.data_config)?;
        }
        let metrics = resolve_metrics(metric_specs)?;

        let goals = collect_goals(metric_specs);
        if !self.engine.evaluate_input_model {
            if let Some(goal) = goals.iter().find(|g| g.kind.needs_baseline()) {
                return Err(SchemaError::BaselineRequired {
                    metric: goal.metric.clone(),
                });
            }
        }

        if let Some(search) = &self.search_strategy {
            search.validate(&SearchSpace::from_template(&template))?;
        }

        Ok(ValidatedRun {
            input: ArtifactRef::input(
                self.input_model.location.clone(),
                self.input_model.version.as_deref(),
                self.input_model.format.clone(),
            ),
            template,
            host,
            target,
            metrics,
            goals,
            search: self.search_strategy.clone(),
            data,
            options: self.engine.clone(),
        })
    }
}

/// Settle priorities: explicit ranks must be unique and positive; sub-types
/// without one are ranked after every explicit rank, in declaration order.
fn resolve_metrics(specs: &[MetricSpec]) -> Result<Vec<ResolvedMetric>, SchemaError> {
    let mut names = BTreeSet::new();
    let mut explicit = BTreeSet::new();

    for spec in specs {
        let invalid = |message: String| SchemaError::InvalidMetric {
            metric: spec.name.clone(),
            message,
        };
        if spec.name.is_empty() || spec.name.contains('.') {
            return Err(invalid("name must be non-empty and contain no '.'".into()));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(SchemaError::DuplicateName {
                kind: "metric".into(),
                name: spec.name.clone(),
            });
        }
        if spec.sub_types.is_empty() {
            return Err(invalid("at least one sub_type is required".into()));
        }
        if spec.timeout_secs == Some(0) {
            return Err(invalid("timeout_secs must be positive".into()));
        }
        let mut subs = BTreeSet::new();
        for sub in &spec.sub_types {
            if !subs.insert(sub.name.as_str()) {
                return Err(invalid(format!("duplicate sub_type {}", sub.name)));
            }
            if let Some(priority) = sub.priority {
                if priority == 0 {
                    return Err(invalid(format!("priority of {} must be at least 1", sub.name)));
                }
                if !explicit.insert(priority) {
                    return Err(invalid(format!("priority {priority} is used more than once")));
                }
            }
        }
    }

    let mut next = explicit.iter().next_back().copied().unwrap_or(0);
    Ok(specs
        .iter()
        .map(|spec| ResolvedMetric {
            spec: spec.clone(),
            sub_types: spec
                .sub_types
                .iter()
                .map(|sub| ResolvedSubMetric {
                    name: sub.name.clone(),
                    key: spec.score_key(&sub.name),
                    priority: sub.priority.unwrap_or_else(|| {
                        next += 1;
                        next
                    }),
                    direction: sub.higher_is_better.map(Direction::from_higher_is_better),
                })
                .collect(),
        })
        .collect())
}

fn collect_goals(specs: &[MetricSpec]) -> Vec<Goal> {
    specs
        .iter()
        .flat_map(|spec| {
            spec.sub_types
                .iter()
                .filter_map(move |sub| sub.goal.map(|kind| Goal::new(spec.score_key(&sub.name), kind)))
        })
        .collect()
}
