//! Scores artifacts with every configured metric concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use ov_types::{
    ArtifactRef, DataProvider, EvalFailure, EvaluationResult, ExecutionTarget, FailureCause,
    Metric, MetricContext, RawScore, RunConfig, Score,
};

use crate::config::ResolvedMetric;
use crate::executor::join_failure;

type MetricOutcome = Result<Vec<RawScore>, FailureCause>;

pub struct Evaluator {
    metrics: Vec<(ResolvedMetric, Arc<dyn Metric>)>,
    target: ExecutionTarget,
    data: BTreeMap<String, Arc<dyn DataProvider>>,
}

impl Evaluator {
    pub fn new(target: ExecutionTarget) -> Self {
        Self {
            metrics: Vec::new(),
            target,
            data: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, metric: ResolvedMetric, implementation: Arc<dyn Metric>) -> Self {
        self.metrics.push((metric, implementation));
        self
    }

    pub fn with_data(mut self, data: BTreeMap<String, Arc<dyn DataProvider>>) -> Self {
        self.data = data;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Score `artifact`. Metrics run in parallel on worker threads; results are
    /// merged in declaration order.
    ///
    /// A failed required metric fails the evaluation. A failed optional metric
    /// is recorded in [`EvaluationResult::failures`] and its keys are absent.
    /// A non-finite value counts as not reported.
    pub async fn evaluate(
        &self,
        config: &RunConfig,
        artifact: &ArtifactRef,
    ) -> Result<EvaluationResult, EvalFailure> {
        let mut tasks = JoinSet::new();
        for (index, (metric, implementation)) in self.metrics.iter().enumerate() {
            let implementation = Arc::clone(implementation);
            let artifact = artifact.clone();
            let ctx = MetricContext {
                target: self.target.clone(),
                user_config: metric.spec.user_config.clone(),
                data: metric
                    .spec
                    .data_config
                    .as_ref()
                    .and_then(|name| self.data.get(name).cloned()),
            };
            let timeout = metric.spec.timeout_secs;

            tasks.spawn(async move {
                let handle =
                    tokio::task::spawn_blocking(move || implementation.score(&artifact, &ctx));
                let joined = match timeout {
                    Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), handle).await {
                        Ok(joined) => joined,
                        Err(_) => return (index, Err(FailureCause::Timeout { seconds: secs })),
                    },
                    None => handle.await,
                };
                let outcome: MetricOutcome = match joined {
                    Ok(Ok(scores)) => Ok(scores),
                    Ok(Err(e)) => Err(FailureCause::error(e.to_string())),
                    Err(e) => Err(join_failure(e)),
                };
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<MetricOutcome>> = vec![None; self.metrics.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!("Metric task aborted: {}", e),
            }
        }

        let mut scores = BTreeMap::new();
        let mut failures = Vec::new();
        for ((metric, _), outcome) in self.metrics.iter().zip(outcomes) {
            let outcome = outcome
                .unwrap_or_else(|| Err(FailureCause::error("metric task did not complete")));
            let raw = match outcome {
                Ok(raw) => raw,
                Err(cause) => {
                    let failure = EvalFailure {
                        metric: metric.spec.name.clone(),
                        cause,
                    };
                    if metric.spec.required {
                        return Err(failure);
                    }
                    warn!("Optional metric failed: {}", failure);
                    failures.push(failure);
                    continue;
                }
            };

            for sub in &metric.sub_types {
                let reported = raw
                    .iter()
                    .find(|r| r.sub_type == sub.name)
                    .filter(|r| r.value.is_finite());
                match reported {
                    Some(r) => {
                        scores.insert(
                            sub.key.clone(),
                            Score {
                                value: r.value,
                                direction: sub.direction.unwrap_or(r.direction),
                                priority: sub.priority,
                            },
                        );
                    }
                    None => {
                        let failure = EvalFailure {
                            metric: sub.key.clone(),
                            cause: FailureCause::error("no finite value reported"),
                        };
                        if metric.spec.required {
                            return Err(failure);
                        }
                        warn!("Optional metric failed: {}", failure);
                        failures.push(failure);
                    }
                }
            }
        }

        debug!(run_id = %config.id.short(), scores = scores.len(), "Evaluated artifact");
        let mut result = EvaluationResult::new(config.clone(), artifact.clone(), scores);
        result.failures = failures;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolvedSubMetric;
    use crate::test_support::{input_model, ConstantMetric, FailingMetric, ModelMetric, SleepyMetric};
    use ov_types::{Direction, MetricSpec, SubMetricSpec};
    use tempfile::TempDir;

    fn resolved(name: &str, required: bool, subs: &[(&str, u32)]) -> ResolvedMetric {
        let mut spec = MetricSpec::new(
            name,
            name,
            subs.iter().map(|(s, _)| SubMetricSpec::new(s)).collect(),
        );
        spec.required = required;
        ResolvedMetric {
            sub_types: subs
                .iter()
                .map(|(s, p)| ResolvedSubMetric {
                    name: s.to_string(),
                    key: spec.score_key(s),
                    priority: *p,
                    direction: None,
                })
                .collect(),
            spec,
        }
    }

    #[tokio::test]
    async fn scores_are_keyed_by_metric_and_sub_type() {
        let dir = TempDir::new().unwrap();
        let evaluator = Evaluator::new(ExecutionTarget::local())
            .with_metric(
                resolved("latency", true, &[("avg", 1), ("p90", 3)]),
                Arc::new(ModelMetric::Latency),
            )
            .with_metric(
                resolved("accuracy", true, &[("top1", 2)]),
                Arc::new(ModelMetric::Accuracy),
            );

        let result = evaluator
            .evaluate(&RunConfig::empty(), &input_model(&dir))
            .await
            .unwrap();
        assert_eq!(result.scores.len(), 3);
        let avg = result.score("latency.avg").unwrap();
        assert_eq!(avg.value, 100.0);
        assert_eq!(avg.direction, Direction::LowerIsBetter);
        assert_eq!(result.score("accuracy.top1").unwrap().priority, 2);
        assert_eq!(result.priority_keys()[0], "latency.avg");
    }

    #[tokio::test]
    async fn optional_failure_is_recorded_not_fatal() {
        let dir = TempDir::new().unwrap();
        let evaluator = Evaluator::new(ExecutionTarget::local())
            .with_metric(resolved("latency", true, &[("avg", 1)]), Arc::new(ModelMetric::Latency))
            .with_metric(resolved("power", false, &[("watts", 2)]), Arc::new(FailingMetric));

        let result = evaluator
            .evaluate(&RunConfig::empty(), &input_model(&dir))
            .await
            .unwrap();
        assert!(result.score("power.watts").is_none());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].metric, "power");
    }

    #[tokio::test]
    async fn required_failure_fails_evaluation() {
        let dir = TempDir::new().unwrap();
        let evaluator = Evaluator::new(ExecutionTarget::local())
            .with_metric(resolved("power", true, &[("watts", 1)]), Arc::new(FailingMetric));

        let failure = evaluator
            .evaluate(&RunConfig::empty(), &input_model(&dir))
            .await
            .unwrap_err();
        assert_eq!(failure.metric, "power");
    }

    #[tokio::test]
    async fn nan_counts_as_missing() {
        let dir = TempDir::new().unwrap();
        let evaluator = Evaluator::new(ExecutionTarget::local()).with_metric(
            resolved("latency", false, &[("avg", 1)]),
            Arc::new(ConstantMetric::latency(f64::NAN)),
        );

        let result = evaluator
            .evaluate(&RunConfig::empty(), &input_model(&dir))
            .await
            .unwrap();
        assert!(result.scores.is_empty());
        assert_eq!(result.failures[0].metric, "latency.avg");
    }

    #[tokio::test]
    async fn direction_override_wins() {
        let dir = TempDir::new().unwrap();
        let mut metric = resolved("latency", true, &[("avg", 1)]);
        metric.sub_types[0].direction = Some(Direction::HigherIsBetter);
        let evaluator = Evaluator::new(ExecutionTarget::local())
            .with_metric(metric, Arc::new(ConstantMetric::latency(5.0)));

        let result = evaluator
            .evaluate(&RunConfig::empty(), &input_model(&dir))
            .await
            .unwrap();
        assert_eq!(
            result.score("latency.avg").unwrap().direction,
            Direction::HigherIsBetter
        );
    }

    fn slow(required: bool) -> ResolvedMetric {
        let mut metric = resolved("latency", required, &[("avg", 1)]);
        metric.spec.timeout_secs = Some(1);
        metric
    }

    #[tokio::test]
    async fn optional_metric_timeout_is_recorded() {
        let dir = TempDir::new().unwrap();
        let evaluator = Evaluator::new(ExecutionTarget::local())
            .with_metric(
                resolved("accuracy", true, &[("top1", 1)]),
                Arc::new(ModelMetric::Accuracy),
            )
            .with_metric(slow(false), Arc::new(SleepyMetric(Duration::from_millis(1500))));

        let result = evaluator
            .evaluate(&RunConfig::empty(), &input_model(&dir))
            .await
            .unwrap();
        assert!(result.score("accuracy.top1").is_some());
        assert!(result.score("latency.avg").is_none());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].metric, "latency");
        assert!(matches!(
            result.failures[0].cause,
            FailureCause::Timeout { seconds: 1 }
        ));
    }

    #[tokio::test]
    async fn required_metric_timeout_fails_evaluation() {
        let dir = TempDir::new().unwrap();
        let evaluator = Evaluator::new(ExecutionTarget::local())
            .with_metric(slow(true), Arc::new(SleepyMetric(Duration::from_millis(1500))));

        let failure = evaluator
            .evaluate(&RunConfig::empty(), &input_model(&dir))
            .await
            .unwrap_err();
        assert_eq!(failure.metric, "latency");
        assert!(matches!(failure.cause, FailureCause::Timeout { seconds: 1 }));
    }

    #[tokio::test]
    async fn metric_within_its_timeout_is_scored() {
        let dir = TempDir::new().unwrap();
        let evaluator = Evaluator::new(ExecutionTarget::local())
            .with_metric(slow(true), Arc::new(SleepyMetric(Duration::from_millis(10))));

        let result = evaluator
            .evaluate(&RunConfig::empty(), &input_model(&dir))
            .await
            .unwrap();
        assert_eq!(result.score("latency.avg").unwrap().value, 1.0);
    }
}
