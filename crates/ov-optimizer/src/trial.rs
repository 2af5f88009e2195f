//! Trial tracking and search configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use ov_types::{Assignment, EvalFailure, PassFailure, RunConfigId, SchemaError};

use crate::driver::{SearchLimits, SearchState};
use crate::search::{BayesianSearch, ExhaustiveSearch, RandomSearch, SearchSpace, SearchStrategy};

/// Which proposal strategy drives the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchAlgorithm {
    Exhaustive,
    Random,
    Bayesian,
}

impl Default for SearchAlgorithm {
    fn default() -> Self {
        Self::Exhaustive
    }
}

fn default_max_consecutive_failures() -> usize {
    3
}

fn default_grid_steps() -> usize {
    5
}

fn default_exploration_weight() -> f64 {
    0.3
}

/// The `search_strategy` section of a run document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub algorithm: SearchAlgorithm,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub max_time_secs: Option<u64>,
    /// Stop as soon as one configuration meets every goal.
    #[serde(default)]
    pub stop_when_goals_met: bool,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,
    /// Points per continuous dimension for exhaustive search.
    #[serde(default = "default_grid_steps")]
    pub grid_steps: usize,
    /// Probability that model-based search explores instead of exploiting.
    #[serde(default = "default_exploration_weight")]
    pub exploration_weight: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            algorithm: SearchAlgorithm::default(),
            seed: None,
            max_iterations: None,
            max_time_secs: None,
            stop_when_goals_met: false,
            max_consecutive_failures: default_max_consecutive_failures(),
            grid_steps: default_grid_steps(),
            exploration_weight: default_exploration_weight(),
        }
    }
}

impl SearchConfig {
    pub fn new(algorithm: SearchAlgorithm) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_max_consecutive_failures(mut self, n: usize) -> Self {
        self.max_consecutive_failures = n;
        self
    }

    pub fn stop_when_goals_met(mut self) -> Self {
        self.stop_when_goals_met = true;
        self
    }

    /// Reject settings that could never terminate.
    pub fn validate(&self, space: &SearchSpace) -> Result<(), SchemaError> {
        if self.max_consecutive_failures == 0 {
            return Err(SchemaError::Invalid {
                message: "max_consecutive_failures must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.exploration_weight) {
            return Err(SchemaError::Invalid {
                message: format!(
                    "exploration_weight must be within [0, 1], got {}",
                    self.exploration_weight
                ),
            });
        }
        let bounded = self.max_iterations.is_some() || self.max_time_secs.is_some();
        let unbounded_sampling = match self.algorithm {
            SearchAlgorithm::Exhaustive => false,
            SearchAlgorithm::Random => !space.is_finite(),
            SearchAlgorithm::Bayesian => true,
        };
        if unbounded_sampling && !bounded {
            return Err(SchemaError::Invalid {
                message: format!(
                    "{:?} search over this space needs max_iterations or max_time_secs",
                    self.algorithm
                )
                .to_lowercase(),
            });
        }
        Ok(())
    }

    pub fn limits(&self) -> SearchLimits {
        SearchLimits {
            max_iterations: self.max_iterations,
            max_time: self.max_time_secs.map(Duration::from_secs),
            max_consecutive_failures: self.max_consecutive_failures,
            stop_when_goals_met: self.stop_when_goals_met,
        }
    }

    pub fn build_strategy(&self, space: SearchSpace) -> Box<dyn SearchStrategy> {
        match self.algorithm {
            SearchAlgorithm::Exhaustive => Box::new(ExhaustiveSearch::new(&space, self.grid_steps)),
            SearchAlgorithm::Random => Box::new(RandomSearch::new(space, self.seed)),
            SearchAlgorithm::Bayesian => Box::new(BayesianSearch::new(
                space,
                self.exploration_weight,
                self.seed,
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Rejected by a pass's semantic validation; never executed.
    Pruned,
}

/// Why a trial produced no evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum TrialFailure {
    Pass(PassFailure),
    Eval(EvalFailure),
}

impl std::fmt::Display for TrialFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass(failure) => write!(f, "{failure}"),
            Self::Eval(failure) => write!(f, "{failure}"),
        }
    }
}

/// A single proposed configuration and what became of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub trial_number: usize,
    pub run_config_id: RunConfigId,
    pub assignment: Assignment,
    pub status: TrialStatus,
    pub objective: Option<f64>,
    pub failure: Option<TrialFailure>,
    pub prune_reason: Option<String>,
    pub executed_passes: usize,
    pub cache_hits: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(trial_number: usize, run_config_id: RunConfigId, assignment: Assignment) -> Self {
        Self {
            id: Uuid::new_v4(),
            trial_number,
            run_config_id,
            assignment,
            status: TrialStatus::Pending,
            objective: None,
            failure: None,
            prune_reason: None,
            executed_passes: 0,
            cache_hits: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn record_execution(&mut self, executed_passes: usize, cache_hits: usize) {
        self.executed_passes = executed_passes;
        self.cache_hits = cache_hits;
    }

    pub fn mark_completed(&mut self, objective: Option<f64>) {
        self.status = TrialStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.objective = objective;
    }

    pub fn mark_failed(&mut self, failure: TrialFailure) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.failure = Some(failure);
    }

    pub fn mark_pruned(&mut self, reason: String) {
        self.status = TrialStatus::Pruned;
        self.finished_at = Some(Utc::now());
        self.prune_reason = Some(reason);
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Aggregate status of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStatus {
    pub strategy: String,
    pub state: SearchState,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub trials_pruned: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SearchStatus {
    pub fn new(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            state: SearchState::Proposing,
            trials_completed: 0,
            trials_failed: 0,
            trials_pruned: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn count(&mut self, trial: &Trial) {
        match trial.status {
            TrialStatus::Completed => self.trials_completed += 1,
            TrialStatus::Failed => self.trials_failed += 1,
            TrialStatus::Pruned => self.trials_pruned += 1,
            TrialStatus::Pending | TrialStatus::Running => {}
        }
    }

    pub fn mark_finished(&mut self, state: SearchState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ov_types::{Digest, Domain, FailureCause};

    fn lr_space() -> SearchSpace {
        SearchSpace::new().add(
            "tune.lr",
            Domain::FloatRange {
                low: 1e-4,
                high: 1e-1,
                log: true,
            },
        )
    }

    #[test]
    fn config_defaults_from_json() {
        let config: SearchConfig = serde_json::from_str(r#"{"algorithm": "random", "seed": 5}"#).unwrap();
        assert_eq!(config.algorithm, SearchAlgorithm::Random);
        assert_eq!(config.seed, Some(5));
        assert_eq!(config.max_consecutive_failures, 3);
        assert_eq!(config.grid_steps, 5);
        assert!(!config.stop_when_goals_met);
    }

    #[test]
    fn unbounded_sampling_is_rejected() {
        let space = lr_space();
        assert!(SearchConfig::new(SearchAlgorithm::Random).validate(&space).is_err());
        assert!(SearchConfig::new(SearchAlgorithm::Bayesian).validate(&space).is_err());
        assert!(SearchConfig::new(SearchAlgorithm::Exhaustive).validate(&space).is_ok());
        assert!(SearchConfig::new(SearchAlgorithm::Random)
            .with_max_iterations(10)
            .validate(&space)
            .is_ok());
    }

    #[test]
    fn zero_failure_bound_is_rejected() {
        let config = SearchConfig::new(SearchAlgorithm::Exhaustive).with_max_consecutive_failures(0);
        assert!(config.validate(&SearchSpace::new()).is_err());
    }

    #[test]
    fn build_strategy_names() {
        let space = lr_space();
        let config = SearchConfig::new(SearchAlgorithm::Bayesian).with_seed(1);
        assert_eq!(config.build_strategy(space.clone()).name(), "bayesian");
        assert_eq!(
            SearchConfig::default().build_strategy(space).name(),
            "exhaustive"
        );
    }

    #[test]
    fn wide_random_search_builds_lazily() {
        let wide = Domain::IntRange {
            low: 0,
            high: 200_000,
            step: 1,
        };
        let space = SearchSpace::new().add("a.x", wide.clone()).add("b.y", wide);
        let config = SearchConfig::new(SearchAlgorithm::Random).with_max_iterations(5);
        assert!(config.validate(&space).is_ok());
        let mut strategy = config.build_strategy(space);
        assert_eq!(strategy.suggest(5).len(), 5);
    }

    #[test]
    fn trial_lifecycle() {
        let id = RunConfigId(Digest::compute(b"cfg"));
        let mut trial = Trial::new(1, id, Assignment::new());
        assert_eq!(trial.status, TrialStatus::Pending);

        trial.mark_running();
        trial.record_execution(2, 1);
        trial.mark_completed(Some(-12.5));
        assert_eq!(trial.status, TrialStatus::Completed);
        assert_eq!(trial.objective, Some(-12.5));
        assert!(trial.duration().is_some());

        let mut status = SearchStatus::new("exhaustive");
        status.count(&trial);
        assert_eq!(status.trials_completed, 1);
    }

    #[test]
    fn trial_failure() {
        let mut trial = Trial::new(0, RunConfigId(Digest::compute(b"x")), Assignment::new());
        trial.mark_running();
        trial.mark_failed(TrialFailure::Pass(PassFailure {
            step_index: 1,
            pass_name: "quantize".into(),
            pass_type: "Quantize".into(),
            cause: FailureCause::error("unsupported op"),
        }));
        assert_eq!(trial.status, TrialStatus::Failed);
        assert!(trial.failure.as_ref().unwrap().to_string().contains("unsupported op"));
    }
}
