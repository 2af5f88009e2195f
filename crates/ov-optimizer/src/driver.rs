//! The search state machine: budgets, duplicate suppression, failure bounds.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use ov_types::{internal_error, EvaluationResult, Goal, OvResult, RunConfig, RunConfigId, RunTemplate};

use crate::footprint::Footprint;
use crate::search::SearchStrategy;
use crate::trial::TrialFailure;

/// Consecutive skipped draws (already seen or unbindable) tolerated before an
/// unbounded strategy is treated as exhausted.
const MAX_DUPLICATE_DRAWS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchState {
    Proposing,
    AwaitingResult,
    /// Stopped early because a configuration met every goal.
    Converged,
    /// Nothing left to propose, or a budget ran out.
    Exhausted,
    /// Too many consecutive configurations failed.
    Failed,
}

impl SearchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::Exhausted | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchLimits {
    pub max_iterations: Option<usize>,
    pub max_time: Option<Duration>,
    pub max_consecutive_failures: usize,
    pub stop_when_goals_met: bool,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            max_iterations: None,
            max_time: None,
            max_consecutive_failures: 3,
            stop_when_goals_met: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Proposal {
    Next(RunConfig),
    Done(SearchState),
}

/// What happened to a proposed configuration.
#[derive(Debug, Clone)]
pub enum TrialOutcome {
    Evaluated(EvaluationResult),
    Failed(TrialFailure),
    /// Rejected before execution. Not a failure.
    Pruned(String),
}

/// Drives a [`SearchStrategy`] over a run template.
///
/// Strictly alternates `propose` and `observe`; calling either out of turn is
/// an internal error.
pub struct Search {
    template: RunTemplate,
    strategy: Box<dyn SearchStrategy>,
    limits: SearchLimits,
    goals: Vec<Goal>,
    state: SearchState,
    started: Option<Instant>,
    iterations: usize,
    consecutive_failures: usize,
    seen: HashSet<RunConfigId>,
    pending: Option<RunConfigId>,
}

impl Search {
    pub fn new(
        template: RunTemplate,
        strategy: Box<dyn SearchStrategy>,
        limits: SearchLimits,
        goals: Vec<Goal>,
    ) -> Self {
        Self {
            template,
            strategy,
            limits,
            goals,
            state: SearchState::Proposing,
            started: None,
            iterations: 0,
            consecutive_failures: 0,
            seen: HashSet::new(),
            pending: None,
        }
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    fn finish(&mut self, state: SearchState) -> Proposal {
        info!(
            strategy = self.strategy.name(),
            iterations = self.iterations,
            state = ?state,
            "Search finished"
        );
        self.state = state;
        Proposal::Done(state)
    }

    pub fn propose(&mut self) -> OvResult<Proposal> {
        match self.state {
            SearchState::AwaitingResult => {
                return Err(internal_error!(
                    "propose called while a configuration is awaiting its result"
                ))
            }
            state if state.is_terminal() => return Ok(Proposal::Done(state)),
            _ => {}
        }

        let started = *self.started.get_or_insert_with(Instant::now);
        if let Some(max) = self.limits.max_iterations {
            if self.iterations >= max {
                return Ok(self.finish(SearchState::Exhausted));
            }
        }
        if let Some(max_time) = self.limits.max_time {
            if started.elapsed() >= max_time {
                return Ok(self.finish(SearchState::Exhausted));
            }
        }

        let mut skipped = 0;
        loop {
            let Some(assignment) = self.strategy.suggest(1).into_iter().next() else {
                return Ok(self.finish(SearchState::Exhausted));
            };
            match self.template.bind(&assignment) {
                Ok(config) if self.seen.insert(config.id) => {
                    self.iterations += 1;
                    self.pending = Some(config.id);
                    self.state = SearchState::AwaitingResult;
                    debug!(
                        run_id = %config.id.short(),
                        iteration = self.iterations,
                        params = %config.describe(),
                        "Proposed configuration"
                    );
                    return Ok(Proposal::Next(config));
                }
                Ok(config) => {
                    debug!(run_id = %config.id.short(), "Skipping duplicate proposal");
                }
                Err(e) => {
                    warn!(
                        strategy = self.strategy.name(),
                        error = %e,
                        "Skipping proposal that does not bind"
                    );
                }
            }

            skipped += 1;
            if skipped >= MAX_DUPLICATE_DRAWS && !self.strategy.is_finite() {
                return Ok(self.finish(SearchState::Exhausted));
            }
        }
    }

    pub fn observe(
        &mut self,
        config: &RunConfig,
        outcome: &TrialOutcome,
        footprint: &Footprint,
    ) -> OvResult<SearchState> {
        if self.state != SearchState::AwaitingResult || self.pending != Some(config.id) {
            return Err(internal_error!(
                "observed configuration {} that was not proposed",
                config.id.short()
            ));
        }
        self.pending = None;

        self.state = match outcome {
            TrialOutcome::Evaluated(result) => {
                self.consecutive_failures = 0;
                self.strategy.report(&config.assignment, result.objective());
                if self.limits.stop_when_goals_met
                    && !self.goals.is_empty()
                    && footprint.meets_all(result, &self.goals)
                {
                    info!(run_id = %config.id.short(), "Every goal met, stopping search");
                    SearchState::Converged
                } else {
                    SearchState::Proposing
                }
            }
            TrialOutcome::Failed(failure) => {
                self.consecutive_failures += 1;
                self.strategy.report(&config.assignment, None);
                warn!(
                    run_id = %config.id.short(),
                    consecutive = self.consecutive_failures,
                    error = %failure,
                    "Configuration failed"
                );
                if self.consecutive_failures >= self.limits.max_consecutive_failures {
                    SearchState::Failed
                } else {
                    SearchState::Proposing
                }
            }
            TrialOutcome::Pruned(reason) => {
                debug!(run_id = %config.id.short(), reason = %reason, "Configuration pruned");
                SearchState::Proposing
            }
        };
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{ExhaustiveSearch, FixedPipeline, RandomSearch, SearchSpace};
    use ov_types::{
        ArtifactLocation, ArtifactRef, Direction, Domain, FailureCause, GoalKind, ParamSetting,
        ParamValue, PassFailure, PassTemplate, Score,
    };
    use std::collections::BTreeMap;

    fn template(bits: Vec<i64>) -> RunTemplate {
        let mut params = BTreeMap::new();
        params.insert(
            "bits".to_string(),
            ParamSetting::Searchable(Domain::discrete(bits.into_iter().map(ParamValue::Int).collect())),
        );
        RunTemplate::new(vec![PassTemplate {
            name: "quantize".into(),
            pass_type: "Quantize".into(),
            params,
            defaults: BTreeMap::new(),
            informational: Default::default(),
            data_config: None,
        }])
    }

    fn exhaustive(template: &RunTemplate, limits: SearchLimits, goals: Vec<Goal>) -> Search {
        let strategy = ExhaustiveSearch::new(&SearchSpace::from_template(template), 5);
        Search::new(template.clone(), Box::new(strategy), limits, goals)
    }

    fn evaluated(config: &RunConfig, latency: f64) -> EvaluationResult {
        let mut scores = BTreeMap::new();
        scores.insert(
            "latency.avg".to_string(),
            Score {
                value: latency,
                direction: Direction::LowerIsBetter,
                priority: 1,
            },
        );
        let artifact = ArtifactRef::input(
            ArtifactLocation::Handle {
                handle: config.id.short(),
            },
            None,
            None,
        );
        EvaluationResult::new(config.clone(), artifact, scores)
    }

    fn failure() -> TrialOutcome {
        TrialOutcome::Failed(TrialFailure::Pass(PassFailure {
            step_index: 0,
            pass_name: "quantize".into(),
            pass_type: "Quantize".into(),
            cause: FailureCause::error("boom"),
        }))
    }

    fn next(search: &mut Search) -> RunConfig {
        match search.propose().unwrap() {
            Proposal::Next(config) => config,
            Proposal::Done(state) => panic!("search ended early: {state:?}"),
        }
    }

    #[test]
    fn exhaustive_visits_each_then_exhausts() {
        let template = template(vec![2, 4, 8]);
        let mut search = exhaustive(&template, SearchLimits::default(), vec![]);
        let footprint = Footprint::new();

        let mut seen = Vec::new();
        loop {
            match search.propose().unwrap() {
                Proposal::Next(config) => {
                    seen.push(config.assignment["quantize.bits"].clone());
                    let result = evaluated(&config, 10.0);
                    search
                        .observe(&config, &TrialOutcome::Evaluated(result), &footprint)
                        .unwrap();
                }
                Proposal::Done(state) => {
                    assert_eq!(state, SearchState::Exhausted);
                    break;
                }
            }
        }
        assert_eq!(seen, vec![ParamValue::Int(2), ParamValue::Int(4), ParamValue::Int(8)]);
        assert!(matches!(search.propose().unwrap(), Proposal::Done(SearchState::Exhausted)));
    }

    #[test]
    fn always_failing_reaches_failed_within_bound() {
        let template = template((1..=10).collect());
        let limits = SearchLimits {
            max_consecutive_failures: 3,
            ..Default::default()
        };
        let mut search = exhaustive(&template, limits, vec![]);
        let footprint = Footprint::new();

        let mut attempts = 0;
        let final_state = loop {
            match search.propose().unwrap() {
                Proposal::Next(config) => {
                    attempts += 1;
                    search.observe(&config, &failure(), &footprint).unwrap();
                }
                Proposal::Done(state) => break state,
            }
        };
        assert_eq!(final_state, SearchState::Failed);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn success_resets_failure_count_and_prunes_do_not_count() {
        let template = template((1..=10).collect());
        let limits = SearchLimits {
            max_consecutive_failures: 2,
            ..Default::default()
        };
        let mut search = exhaustive(&template, limits, vec![]);
        let footprint = Footprint::new();

        let c = next(&mut search);
        search.observe(&c, &failure(), &footprint).unwrap();
        let c = next(&mut search);
        let state = search
            .observe(&c, &TrialOutcome::Pruned("needs group size".into()), &footprint)
            .unwrap();
        assert_eq!(state, SearchState::Proposing);
        assert_eq!(search.consecutive_failures(), 1);

        let c = next(&mut search);
        search
            .observe(&c, &TrialOutcome::Evaluated(evaluated(&c, 5.0)), &footprint)
            .unwrap();
        assert_eq!(search.consecutive_failures(), 0);
    }

    #[test]
    fn stops_when_goals_met() {
        let template = template(vec![2, 4, 8]);
        let goal = Goal::new("latency.avg", GoalKind::Threshold(20.0));
        let limits = SearchLimits {
            stop_when_goals_met: true,
            ..Default::default()
        };
        let mut search = exhaustive(&template, limits, vec![goal]);
        let mut footprint = Footprint::new();

        let c = next(&mut search);
        let slow = evaluated(&c, 30.0);
        footprint.record(slow.clone());
        assert_eq!(
            search.observe(&c, &TrialOutcome::Evaluated(slow), &footprint).unwrap(),
            SearchState::Proposing
        );

        let c = next(&mut search);
        let fast = evaluated(&c, 15.0);
        footprint.record(fast.clone());
        assert_eq!(
            search.observe(&c, &TrialOutcome::Evaluated(fast), &footprint).unwrap(),
            SearchState::Converged
        );
        assert!(matches!(search.propose().unwrap(), Proposal::Done(SearchState::Converged)));
    }

    #[test]
    fn max_iterations_exhausts() {
        let template = template((1..=10).collect());
        let limits = SearchLimits {
            max_iterations: Some(2),
            ..Default::default()
        };
        let mut search = exhaustive(&template, limits, vec![]);
        let footprint = Footprint::new();
        for _ in 0..2 {
            let c = next(&mut search);
            search
                .observe(&c, &TrialOutcome::Evaluated(evaluated(&c, 1.0)), &footprint)
                .unwrap();
        }
        assert!(matches!(search.propose().unwrap(), Proposal::Done(SearchState::Exhausted)));
        assert_eq!(search.iterations(), 2);
    }

    #[test]
    fn zero_time_budget_exhausts_immediately() {
        let template = template(vec![4, 8]);
        let limits = SearchLimits {
            max_time: Some(Duration::ZERO),
            ..Default::default()
        };
        let mut search = exhaustive(&template, limits, vec![]);
        assert!(matches!(search.propose().unwrap(), Proposal::Done(SearchState::Exhausted)));
    }

    #[test]
    fn fixed_pipeline_runs_once() {
        let template = template(vec![4, 8]);
        let strategy = FixedPipeline::new(template.fixed_assignment());
        let mut search = Search::new(template, Box::new(strategy), SearchLimits::default(), vec![]);
        let footprint = Footprint::new();

        let c = next(&mut search);
        assert_eq!(c.assignment["quantize.bits"], ParamValue::Int(4));
        search
            .observe(&c, &TrialOutcome::Evaluated(evaluated(&c, 1.0)), &footprint)
            .unwrap();
        assert!(matches!(search.propose().unwrap(), Proposal::Done(SearchState::Exhausted)));
    }

    #[test]
    fn duplicates_are_skipped() {
        let template = template(vec![4, 8]);
        // Two-point space sampled by a model-based strategy repeats itself;
        // the driver must still only hand out each configuration once.
        let strategy = crate::search::BayesianSearch::new(
            SearchSpace::from_template(&template),
            1.0,
            Some(11),
        );
        let limits = SearchLimits {
            max_iterations: Some(10),
            ..Default::default()
        };
        let mut search = Search::new(template, Box::new(strategy), limits, vec![]);
        let footprint = Footprint::new();

        let mut ids = HashSet::new();
        while let Proposal::Next(c) = search.propose().unwrap() {
            assert!(ids.insert(c.id));
            search
                .observe(&c, &TrialOutcome::Evaluated(evaluated(&c, 1.0)), &footprint)
                .unwrap();
        }
        assert_eq!(ids.len(), 2);
        assert_eq!(search.state(), SearchState::Exhausted);
    }

    #[test]
    fn unbindable_proposals_are_skipped() {
        let mut params = BTreeMap::new();
        params.insert(
            "n".to_string(),
            ParamSetting::Searchable(Domain::IntRange {
                low: 0,
                high: 10,
                step: 3,
            }),
        );
        let template = RunTemplate::new(vec![PassTemplate {
            name: "p".into(),
            pass_type: "Prune".into(),
            params,
            defaults: BTreeMap::new(),
            informational: Default::default(),
            data_config: None,
        }]);
        let strategy = crate::search::BayesianSearch::new(
            SearchSpace::from_template(&template),
            0.0,
            Some(5),
        );
        let limits = SearchLimits {
            max_iterations: Some(50),
            ..Default::default()
        };
        let mut search = Search::new(template, Box::new(strategy), limits, vec![]);
        let footprint = Footprint::new();

        let mut values = HashSet::new();
        while let Proposal::Next(c) = search.propose().unwrap() {
            let n = c.assignment["p.n"].as_i64().unwrap();
            assert!([0, 3, 6, 9].contains(&n), "off-grid value {n}");
            values.insert(n);
            let latency = 10.0 - n as f64;
            search
                .observe(&c, &TrialOutcome::Evaluated(evaluated(&c, latency)), &footprint)
                .unwrap();
        }
        assert!(!values.is_empty());
        assert_eq!(search.state(), SearchState::Exhausted);
    }

    #[test]
    fn exhaustive_is_not_cut_off_by_repeated_identities() {
        let mut params = BTreeMap::new();
        params.insert(
            "bits".to_string(),
            ParamSetting::Searchable(Domain::discrete(vec![4i64.into(), 8i64.into()])),
        );
        params.insert(
            "verbosity".to_string(),
            ParamSetting::Searchable(Domain::IntRange {
                low: 0,
                high: 99,
                step: 1,
            }),
        );
        let template = RunTemplate::new(vec![PassTemplate {
            name: "quantize".into(),
            pass_type: "Quantize".into(),
            params,
            defaults: BTreeMap::new(),
            informational: ["verbosity".to_string()].into_iter().collect(),
            data_config: None,
        }]);
        let mut search = exhaustive(&template, SearchLimits::default(), vec![]);
        let footprint = Footprint::new();

        let mut bits = Vec::new();
        while let Proposal::Next(c) = search.propose().unwrap() {
            bits.push(c.assignment["quantize.bits"].clone());
            search
                .observe(&c, &TrialOutcome::Evaluated(evaluated(&c, 1.0)), &footprint)
                .unwrap();
        }
        assert_eq!(bits, vec![ParamValue::Int(4), ParamValue::Int(8)]);
        assert_eq!(search.state(), SearchState::Exhausted);
    }

    #[test]
    fn out_of_turn_calls_are_rejected() {
        let template = template(vec![4, 8]);
        let strategy = RandomSearch::new(SearchSpace::from_template(&template), Some(1));
        let mut search = Search::new(template.clone(), Box::new(strategy), SearchLimits::default(), vec![]);
        let footprint = Footprint::new();

        let c = next(&mut search);
        assert!(search.propose().is_err());

        let other = template
            .bind(&[("quantize.bits".to_string(), ParamValue::Int(
                if c.assignment["quantize.bits"] == ParamValue::Int(4) { 8 } else { 4 },
            ))]
            .into_iter()
            .collect())
            .unwrap();
        assert!(search.observe(&other, &failure(), &footprint).is_err());
    }
}
