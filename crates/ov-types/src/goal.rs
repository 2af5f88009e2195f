//! Goals: selection and stopping criteria over a single metric.

use serde::{Deserialize, Serialize};

use crate::metric::{Direction, Score};

/// How the goal's target value is derived.
///
/// All relative kinds are measured against the input model's baseline score
/// and are oriented by the metric's direction: an "improvement" on a
/// lower-is-better latency means a smaller number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GoalKind {
    /// Absolute target.
    Threshold(f64),
    /// Improve on the baseline by at least this much.
    MinImprovement(f64),
    /// Improve on the baseline by at least this percentage.
    PercentMinImprovement(f64),
    /// Lose at most this much relative to the baseline.
    MaxDegradation(f64),
    /// Lose at most this percentage relative to the baseline.
    PercentMaxDegradation(f64),
}

impl GoalKind {
    pub fn needs_baseline(&self) -> bool {
        !matches!(self, Self::Threshold(_))
    }

    /// The value a score has to reach, or `None` when a relative goal has no
    /// baseline to anchor to.
    pub fn target(&self, direction: Direction, baseline: Option<f64>) -> Option<f64> {
        let sign = match direction {
            Direction::HigherIsBetter => 1.0,
            Direction::LowerIsBetter => -1.0,
        };
        match *self {
            Self::Threshold(v) => Some(v),
            Self::MinImprovement(v) => baseline.map(|b| b + sign * v),
            Self::PercentMinImprovement(v) => baseline.map(|b| b * (1.0 + sign * v / 100.0)),
            Self::MaxDegradation(v) => baseline.map(|b| b - sign * v),
            Self::PercentMaxDegradation(v) => baseline.map(|b| b * (1.0 - sign * v / 100.0)),
        }
    }
}

/// A goal attached to one score key (e.g. `latency.avg`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub metric: String,
    pub kind: GoalKind,
}

impl Goal {
    pub fn new(metric: impl Into<String>, kind: GoalKind) -> Self {
        Self {
            metric: metric.into(),
            kind,
        }
    }

    /// Whether `score` reaches the goal. A relative goal without a baseline is
    /// never met.
    pub fn is_met(&self, score: &Score, baseline: Option<&Score>) -> bool {
        match self.kind.target(score.direction, baseline.map(|b| b.value)) {
            Some(target) => match score.direction {
                Direction::HigherIsBetter => score.value >= target,
                Direction::LowerIsBetter => score.value <= target,
            },
            None => false,
        }
    }
}
