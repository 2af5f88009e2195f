//! The run engine: baseline, search loop, selection and outputs.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use ov_cache::{CacheStats, FsRunCache, NoopCache, RunCache};
use ov_optimizer::{
    FixedPipeline, Footprint, Proposal, Search, SearchLimits, SearchSpace, SearchState,
    SearchStatus, SearchStrategy, Trial, TrialFailure, TrialOutcome,
};
use ov_types::{internal_error, EvaluationResult, OvError, OvResult, RunConfig};

use crate::config::{RunDocument, ValidatedRun};
use crate::evaluator::Evaluator;
use crate::events::{EngineEvent, EngineEventKind, EventSink};
use crate::executor::PipelineExecutor;
use crate::output::{OutputWriter, RankedResult};
use crate::registry::Registries;

/// Everything a finished run hands back. Also written as `report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineReport {
    pub state: SearchState,
    pub strategy: String,
    /// Whether `best` satisfies every goal. Trivially true without goals.
    pub goals_met: bool,
    pub best: Vec<RankedResult>,
    pub trials: Vec<Trial>,
    pub status: SearchStatus,
    pub baseline: Option<EvaluationResult>,
    pub cache_stats: CacheStats,
    pub output_dir: PathBuf,
}

pub struct Engine {
    run: ValidatedRun,
    executor: PipelineExecutor,
    evaluator: Evaluator,
    events: EventSink,
}

impl Engine {
    /// Validate `document` and open the run cache. Nothing runs yet.
    pub fn new(document: &RunDocument, registries: &Registries) -> OvResult<Self> {
        let run = document.validate(registries)?;

        let cache_dir = run.options.cache_dir();
        let cache: Arc<dyn RunCache> = match FsRunCache::open(&cache_dir) {
            Ok(cache) => Arc::new(cache),
            Err(e) if run.options.tolerate_cache_failure => {
                warn!("Run cache unavailable, continuing without it: {}", e);
                Arc::new(NoopCache::new()?)
            }
            Err(e) => return Err(e.into()),
        };

        let mut executor = PipelineExecutor::new(cache, run.host.clone())
            .with_data(run.data.clone())
            .with_timeout(run.options.pass_timeout_secs.map(Duration::from_secs));
        for pass in &run.template.passes {
            let implementation = registries
                .passes
                .implementation(&pass.pass_type)
                .ok_or_else(|| internal_error!("pass type {} lost its implementation", pass.pass_type))?;
            executor = executor.with_pass(&pass.pass_type, implementation);
        }

        let mut evaluator = Evaluator::new(run.target.clone()).with_data(run.data.clone());
        for metric in &run.metrics {
            let implementation = registries
                .metrics
                .get(&metric.spec.metric_type)
                .ok_or_else(|| internal_error!("metric type {} lost its implementation", metric.spec.metric_type))?;
            evaluator = evaluator.with_metric(metric.clone(), implementation);
        }

        info!(
            "Engine ready: {} passes, {} metrics, cache at {}",
            run.template.passes.len(),
            run.metrics.len(),
            cache_dir.display()
        );
        Ok(Self {
            run,
            executor,
            evaluator,
            events: EventSink::disabled(),
        })
    }

    /// Publish progress on `sender`. Events are dropped when the channel is full.
    pub fn with_events(mut self, sender: Sender<EngineEvent>) -> Self {
        self.events = EventSink::new(sender);
        self.executor = self.executor.with_events(self.events.clone());
        self
    }

    pub fn cache(&self) -> &Arc<dyn RunCache> {
        self.executor.cache()
    }

    fn build_search(&self) -> Search {
        let template = self.run.template.clone();
        let (strategy, limits): (Box<dyn SearchStrategy>, SearchLimits) = match &self.run.search {
            Some(config) => (
                config.build_strategy(SearchSpace::from_template(&template)),
                config.limits(),
            ),
            None => (
                Box::new(FixedPipeline::new(template.fixed_assignment())),
                SearchLimits::default(),
            ),
        };
        Search::new(template, strategy, limits, self.run.goals.clone())
    }

    pub async fn run(&self) -> OvResult<EngineReport> {
        let options = &self.run.options;
        if options.clean_cache {
            self.cache().clear()?;
        }

        let mut search = self.build_search();
        let mut status = SearchStatus::new(search.strategy_name());
        status.mark_running();
        self.events.emit(EngineEventKind::RunStarted {
            strategy: search.strategy_name().to_string(),
            searchable_params: self.run.template.searchable().len(),
        });
        info!("Starting run with {} search", search.strategy_name());

        let mut footprint = Footprint::new();
        if options.evaluate_input_model && !self.evaluator.is_empty() {
            let baseline = self.evaluator.evaluate(&RunConfig::empty(), &self.run.input).await?;
            info!("Baseline evaluated: {} scores", baseline.scores.len());
            self.events.emit(EngineEventKind::BaselineEvaluated {
                objective: baseline.objective(),
            });
            footprint.set_baseline(baseline);
        }

        let mut trials: Vec<Trial> = Vec::new();
        let state = loop {
            let config = match search.propose()? {
                Proposal::Next(config) => config,
                Proposal::Done(state) => break state,
            };

            let mut trial = Trial::new(trials.len() + 1, config.id, config.assignment.clone());
            trial.mark_running();
            self.events.emit(EngineEventKind::TrialStarted {
                trial_number: trial.trial_number,
                run_config: config.id,
                description: config.describe(),
            });

            let outcome = self.run_trial(&config, &mut trial).await?;
            match &outcome {
                TrialOutcome::Evaluated(result) => {
                    trial.mark_completed(result.objective());
                    footprint.record(result.clone());
                    self.events.emit(EngineEventKind::TrialCompleted {
                        trial_number: trial.trial_number,
                        objective: trial.objective,
                    });
                }
                TrialOutcome::Failed(failure) => {
                    trial.mark_failed(failure.clone());
                    self.events.emit(EngineEventKind::TrialFailed {
                        trial_number: trial.trial_number,
                        reason: failure.to_string(),
                    });
                    // Without search there is nothing else to try.
                    if !self.run.search_enabled() {
                        return Err(match failure.clone() {
                            TrialFailure::Pass(f) => OvError::Pass(f),
                            TrialFailure::Eval(f) => OvError::Eval(f),
                        });
                    }
                }
                TrialOutcome::Pruned(reason) => {
                    trial.mark_pruned(reason.clone());
                    self.events.emit(EngineEventKind::TrialPruned {
                        trial_number: trial.trial_number,
                        reason: reason.clone(),
                    });
                }
            }

            search.observe(&config, &outcome, &footprint)?;
            status.count(&trial);
            trials.push(trial);
        };
        status.mark_finished(state);

        let selection = footprint.select(&self.run.goals, options.output_model_count);
        let writer = OutputWriter::new(options.output_dir())?;
        let best = writer.write_models(&selection.results)?;
        writer.write_footprint(&footprint)?;

        let report = EngineReport {
            state,
            strategy: status.strategy.clone(),
            goals_met: selection.goals_met,
            best,
            trials,
            status,
            baseline: footprint.baseline().cloned(),
            cache_stats: self.cache().stats(),
            output_dir: writer.root().to_path_buf(),
        };
        writer.write_report(&report)?;

        self.events.emit(EngineEventKind::RunFinished {
            state,
            goals_met: report.goals_met,
            trials: report.trials.len(),
        });
        info!(
            "Run finished: {:?} after {} trials, {} selected, goals met: {}",
            state,
            report.trials.len(),
            report.best.len(),
            report.goals_met
        );
        Ok(report)
    }

    /// Prevalidate, execute and evaluate one configuration. Only failures of
    /// the configuration itself become a trial outcome; anything else aborts
    /// the run.
    async fn run_trial(&self, config: &RunConfig, trial: &mut Trial) -> OvResult<TrialOutcome> {
        if let Err(reason) = self.executor.prevalidate(config) {
            return Ok(TrialOutcome::Pruned(reason));
        }

        let output = match self.executor.run(config, &self.run.input, trial.trial_number).await {
            Ok(output) => output,
            Err(OvError::Pass(failure)) => return Ok(TrialOutcome::Failed(TrialFailure::Pass(failure))),
            Err(e) => return Err(e),
        };
        trial.record_execution(output.executed_count(), output.cache_hits());

        Ok(match self.evaluator.evaluate(config, &output.artifact).await {
            Ok(result) => TrialOutcome::Evaluated(result),
            Err(failure) => TrialOutcome::Failed(TrialFailure::Eval(failure)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{FOOTPRINT_FILE, REPORT_FILE};
    use crate::test_support::{document, registries};
    use ov_optimizer::TrialStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn quantize_search(dir: &TempDir, goal: serde_json::Value) -> RunDocument {
        document(
            dir,
            json!([
                {"name": "quantize", "type": "Quantize", "params": {"bits": {"search": {"type": "discrete", "values": [4, 8]}}}}
            ]),
            json!([
                {"name": "latency", "type": "latency", "sub_types": [{"name": "avg", "priority": 1, "goal": goal}]},
                {"name": "accuracy", "type": "accuracy", "sub_types": [{"name": "top1", "priority": 2}]}
            ]),
            Some(json!({"algorithm": "exhaustive"})),
        )
    }

    #[tokio::test]
    async fn exhaustive_search_selects_goal_satisfying_model() {
        let dir = TempDir::new().unwrap();
        let (registries, calls) = registries();
        let doc = quantize_search(&dir, json!({"type": "percent_min_improvement", "value": 20}));

        let report = Engine::new(&doc, &registries).unwrap().run().await.unwrap();

        assert_eq!(report.state, SearchState::Exhausted);
        assert_eq!(report.trials.len(), 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(report.goals_met);
        // 4 bits is the faster of the two and both beat the baseline by 20%.
        let best = &report.best[0].result;
        assert_eq!(best.run_config.assignment["quantize.bits"].as_i64(), Some(4));
        assert_eq!(report.baseline.as_ref().unwrap().score("latency.avg").unwrap().value, 100.0);
        assert!(report.output_dir.join(FOOTPRINT_FILE).is_file());
        assert!(report.output_dir.join(REPORT_FILE).is_file());
        assert!(report.best[0].model_dir.join("model.txt").is_file());
    }

    #[tokio::test]
    async fn unmet_goal_falls_back_to_frontier() {
        let dir = TempDir::new().unwrap();
        let (registries, _) = registries();
        let doc = quantize_search(&dir, json!({"type": "percent_min_improvement", "value": 95}));

        let report = Engine::new(&doc, &registries).unwrap().run().await.unwrap();

        assert!(!report.goals_met);
        assert_eq!(report.state, SearchState::Exhausted);
        // The frontier still ranks 4 bits first on latency.
        assert!(!report.best.is_empty());
        assert_eq!(report.best[0].result.run_config.assignment["quantize.bits"].as_i64(), Some(4));
    }

    #[tokio::test]
    async fn rerun_with_warm_cache_executes_nothing() {
        let dir = TempDir::new().unwrap();
        let (registries, calls) = registries();
        let doc = quantize_search(&dir, json!({"type": "threshold", "value": 50}));

        let first = Engine::new(&doc, &registries).unwrap().run().await.unwrap();
        let second = Engine::new(&doc, &registries).unwrap().run().await.unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(second.trials.iter().all(|t| t.executed_passes == 0 && t.cache_hits == 1));
        assert_eq!(first.best[0].result.artifact.id, second.best[0].result.artifact.id);
    }

    #[tokio::test]
    async fn clean_cache_forces_reexecution() {
        let dir = TempDir::new().unwrap();
        let (registries, calls) = registries();
        let mut doc = quantize_search(&dir, json!({"type": "threshold", "value": 50}));

        Engine::new(&doc, &registries).unwrap().run().await.unwrap();
        doc.engine.clean_cache = true;
        Engine::new(&doc, &registries).unwrap().run().await.unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn always_failing_pass_ends_in_failed_state() {
        let dir = TempDir::new().unwrap();
        let (registries, _) = registries();
        let doc = document(
            &dir,
            json!([
                {"name": "broken", "type": "Broken", "params": {"level": {"search": {"type": "int_range", "low": 1, "high": 10}}}}
            ]),
            json!([{"name": "latency", "type": "latency", "sub_types": [{"name": "avg"}]}]),
            Some(json!({"algorithm": "random", "seed": 7, "max_iterations": 10, "max_consecutive_failures": 3})),
        );

        let report = Engine::new(&doc, &registries).unwrap().run().await.unwrap();

        assert_eq!(report.state, SearchState::Failed);
        assert_eq!(report.trials.len(), 3);
        assert!(report.trials.iter().all(|t| t.status == TrialStatus::Failed));
        assert_eq!(report.status.trials_failed, 3);
        assert!(report.best.is_empty());
    }

    #[tokio::test]
    async fn rejected_configurations_are_pruned() {
        let dir = TempDir::new().unwrap();
        let (registries, calls) = registries();
        let doc = document(
            &dir,
            json!([
                {"name": "quantize", "type": "PickyQuantize", "params": {"bits": {"search": {"type": "discrete", "values": [4, 8]}}}}
            ]),
            json!([{"name": "latency", "type": "latency", "sub_types": [{"name": "avg"}]}]),
            Some(json!({"algorithm": "exhaustive"})),
        );

        let report = Engine::new(&doc, &registries).unwrap().run().await.unwrap();

        assert_eq!(report.status.trials_pruned, 1);
        assert_eq!(report.status.trials_completed, 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(report.best.len(), 1);
    }

    #[tokio::test]
    async fn fixed_pipeline_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (registries, _) = registries();
        let doc = document(
            &dir,
            json!([{"name": "broken", "type": "Broken", "params": {"level": 3}}]),
            json!([{"name": "latency", "type": "latency", "sub_types": [{"name": "avg"}]}]),
            None,
        );

        let err = Engine::new(&doc, &registries).unwrap().run().await.unwrap_err();
        assert!(matches!(err, OvError::Pass(_)));
    }

    #[tokio::test]
    async fn fixed_pipeline_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let (registries, calls) = registries();
        let doc = document(
            &dir,
            json!([{"name": "quantize", "type": "Quantize"}]),
            json!([{"name": "latency", "type": "latency", "sub_types": [{"name": "avg"}]}]),
            None,
        );

        let report = Engine::new(&doc, &registries).unwrap().run().await.unwrap();

        assert_eq!(report.trials.len(), 1);
        assert_eq!(report.strategy, "fixed");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Schema default of 8 bits: 100 * 8 / 32.
        assert_eq!(report.best[0].result.score("latency.avg").unwrap().value, 25.0);
    }

    #[tokio::test]
    async fn events_trace_the_run() {
        let dir = TempDir::new().unwrap();
        let (registries, _) = registries();
        let doc = quantize_search(&dir, json!({"type": "threshold", "value": 50}));
        let (tx, rx) = crossbeam_channel::unbounded();

        Engine::new(&doc, &registries)
            .unwrap()
            .with_events(tx)
            .run()
            .await
            .unwrap();

        let events: Vec<EngineEventKind> = rx.try_iter().map(|e| e.kind).collect();
        assert!(matches!(events.first(), Some(EngineEventKind::RunStarted { .. })));
        assert!(matches!(events.last(), Some(EngineEventKind::RunFinished { .. })));
        let steps = events
            .iter()
            .filter(|e| matches!(e, EngineEventKind::StepCompleted { .. }))
            .count();
        assert_eq!(steps, 2);
    }

    #[test]
    fn unusable_cache_is_fatal_unless_tolerated() {
        let dir = TempDir::new().unwrap();
        let (registries, _) = registries();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let mut doc = quantize_search(&dir, json!({"type": "threshold", "value": 50}));
        doc.engine.cache_dir = Some(blocker);
        assert!(matches!(
            Engine::new(&doc, &registries),
            Err(OvError::Cache(_))
        ));

        doc.engine.tolerate_cache_failure = true;
        assert!(Engine::new(&doc, &registries).is_ok());
    }
}
