//! Metric contract and the normalized scores the footprint compares.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::artifact::ArtifactRef;
use crate::data::DataProvider;
use crate::errors::EvalFailure;
use crate::goal::GoalKind;
use crate::run::RunConfig;
use crate::system::ExecutionTarget;

/// Whether larger or smaller values are preferable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

impl Direction {
    pub fn from_higher_is_better(higher: bool) -> Self {
        if higher {
            Self::HigherIsBetter
        } else {
            Self::LowerIsBetter
        }
    }

    /// `Greater` means `a` is better than `b`.
    pub fn compare(&self, a: f64, b: f64) -> Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            Self::HigherIsBetter => ord,
            Self::LowerIsBetter => ord.reverse(),
        }
    }

    /// Map a value onto a scale where larger is always better.
    pub fn oriented(&self, value: f64) -> f64 {
        match self {
            Self::HigherIsBetter => value,
            Self::LowerIsBetter => -value,
        }
    }
}

/// A metric value normalized for cross-metric comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: f64,
    pub direction: Direction,
    /// 1 is the most important metric.
    pub priority: u32,
}

/// A single value reported by a metric implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawScore {
    pub sub_type: String,
    pub value: f64,
    pub direction: Direction,
}

impl RawScore {
    pub fn new(sub_type: &str, value: f64, direction: Direction) -> Self {
        Self {
            sub_type: sub_type.to_string(),
            value,
            direction,
        }
    }
}

/// Inputs handed to a metric besides the artifact.
#[derive(Clone)]
pub struct MetricContext {
    pub target: ExecutionTarget,
    pub user_config: serde_json::Value,
    pub data: Option<Arc<dyn DataProvider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("{0}")]
    Failed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A scored evaluation of an artifact. Blocking; may run on a worker thread
/// in parallel with other metrics of the same evaluation.
pub trait Metric: Send + Sync {
    fn score(&self, artifact: &ArtifactRef, ctx: &MetricContext)
        -> Result<Vec<RawScore>, MetricError>;
}

/// One reported value of a metric that the evaluator should record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubMetricSpec {
    pub name: String,
    #[serde(default)]
    pub priority: Option<u32>,
    /// Overrides the direction reported by the implementation.
    #[serde(default)]
    pub higher_is_better: Option<bool>,
    #[serde(default)]
    pub goal: Option<GoalKind>,
}

impl SubMetricSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            priority: None,
            higher_is_better: None,
            goal: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_goal(mut self, goal: GoalKind) -> Self {
        self.goal = Some(goal);
        self
    }
}

/// A metric as declared in an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub sub_types: Vec<SubMetricSpec>,
    /// A failure of a required metric fails the whole evaluation.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub user_config: serde_json::Value,
    #[serde(default)]
    pub data_config: Option<String>,
}

impl MetricSpec {
    pub fn new(name: &str, metric_type: &str, sub_types: Vec<SubMetricSpec>) -> Self {
        Self {
            name: name.to_string(),
            metric_type: metric_type.to_string(),
            sub_types,
            required: false,
            timeout_secs: None,
            user_config: serde_json::Value::Null,
            data_config: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Footprint key of a sub-type, e.g. `latency.avg`.
    pub fn score_key(&self, sub_type: &str) -> String {
        format!("{}.{}", self.name, sub_type)
    }
}

/// The outcome of evaluating one configuration. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub run_config: RunConfig,
    pub artifact: ArtifactRef,
    pub scores: BTreeMap<String, Score>,
    /// Optional metrics that could not be scored.
    #[serde(default)]
    pub failures: Vec<EvalFailure>,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn new(run_config: RunConfig, artifact: ArtifactRef, scores: BTreeMap<String, Score>) -> Self {
        Self {
            run_config,
            artifact,
            scores,
            failures: Vec::new(),
            evaluated_at: Utc::now(),
        }
    }

    pub fn score(&self, key: &str) -> Option<&Score> {
        self.scores.get(key)
    }

    /// Score keys ordered by priority (most important first).
    pub fn priority_keys(&self) -> Vec<&str> {
        let mut keys: Vec<(&str, u32)> = self
            .scores
            .iter()
            .map(|(k, s)| (k.as_str(), s.priority))
            .collect();
        keys.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        keys.into_iter().map(|(k, _)| k).collect()
    }

    /// Highest-priority score on a larger-is-better scale; the scalar that
    /// adaptive search strategies learn from.
    pub fn objective(&self) -> Option<f64> {
        let key = self.priority_keys().into_iter().next()?;
        self.scores.get(key).map(|s| s.direction.oriented(s.value))
    }
}
