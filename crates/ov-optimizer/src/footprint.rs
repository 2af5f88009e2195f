//! Append-only record of evaluated configurations and the queries over it.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ov_types::{EvaluationResult, Goal, OvResult, RunConfigId, Score};

/// Every evaluation of a search, plus the optional input-model baseline.
///
/// The Pareto frontier is never cached: each query rescans all records.
#[derive(Debug, Clone, Default)]
pub struct Footprint {
    records: Vec<EvaluationResult>,
    baseline: Option<EvaluationResult>,
}

/// What to hand back to the user at the end of a run.
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    /// True when `results` all satisfy every goal; false when no record did
    /// and the ranked Pareto frontier is returned instead.
    pub goals_met: bool,
    pub results: Vec<&'a EvaluationResult>,
}

/// `Greater` when `a` is better on `key`. A missing score is worse than any
/// present one.
fn compare_metric(a: &EvaluationResult, b: &EvaluationResult, key: &str) -> Ordering {
    match (a.score(key), b.score(key)) {
        (Some(x), Some(y)) => x.direction.compare(x.value, y.value),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Union of both score sets, most important first.
fn priority_keys<'a>(a: &'a EvaluationResult, b: &'a EvaluationResult) -> Vec<&'a str> {
    let mut keys: BTreeMap<&str, u32> = BTreeMap::new();
    for (key, score) in a.scores.iter().chain(b.scores.iter()) {
        keys.entry(key.as_str()).or_insert(score.priority);
    }
    let mut keys: Vec<(&str, u32)> = keys.into_iter().collect();
    keys.sort_by(|x, y| x.1.cmp(&y.1).then_with(|| x.0.cmp(y.0)));
    keys.into_iter().map(|(k, _)| k).collect()
}

/// Lexicographic comparison in priority order. `Greater` when `a` is better.
pub(crate) fn compare_by_priority(a: &EvaluationResult, b: &EvaluationResult) -> Ordering {
    for key in priority_keys(a, b) {
        let ord = compare_metric(a, b, key);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

impl Footprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result; returns its insertion index.
    pub fn record(&mut self, result: EvaluationResult) -> usize {
        self.records.push(result);
        self.records.len() - 1
    }

    pub fn set_baseline(&mut self, result: EvaluationResult) {
        self.baseline = Some(result);
    }

    pub fn baseline(&self) -> Option<&EvaluationResult> {
        self.baseline.as_ref()
    }

    pub fn baseline_score(&self, key: &str) -> Option<&Score> {
        self.baseline.as_ref().and_then(|b| b.score(key))
    }

    pub fn records(&self) -> &[EvaluationResult] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &RunConfigId) -> Option<&EvaluationResult> {
        self.records.iter().find(|r| &r.run_config.id == id)
    }

    /// `a` is at least as good as `b` on every metric either reports and
    /// strictly better on at least one.
    pub fn dominates(a: &EvaluationResult, b: &EvaluationResult) -> bool {
        let mut strictly_better = false;
        for key in priority_keys(a, b) {
            match compare_metric(a, b, key) {
                Ordering::Less => return false,
                Ordering::Greater => strictly_better = true,
                Ordering::Equal => {}
            }
        }
        strictly_better
    }

    /// Records not dominated by any other record, in insertion order.
    pub fn pareto_frontier(&self) -> Vec<&EvaluationResult> {
        self.pareto_indices()
            .into_iter()
            .map(|i| &self.records[i])
            .collect()
    }

    fn pareto_indices(&self) -> Vec<usize> {
        (0..self.records.len())
            .filter(|&i| {
                !self
                    .records
                    .iter()
                    .enumerate()
                    .any(|(j, other)| j != i && Self::dominates(other, &self.records[i]))
            })
            .collect()
    }

    pub fn meets(&self, result: &EvaluationResult, goal: &Goal) -> bool {
        match result.score(&goal.metric) {
            Some(score) => goal.is_met(score, self.baseline_score(&goal.metric)),
            None => false,
        }
    }

    pub fn meets_all(&self, result: &EvaluationResult, goals: &[Goal]) -> bool {
        goals.iter().all(|goal| self.meets(result, goal))
    }

    /// The record meeting `goal` with the best value on the goal's metric.
    /// Ties fall back to the remaining metrics in priority order, then to
    /// insertion order.
    pub fn best(&self, goal: &Goal) -> Option<&EvaluationResult> {
        let mut best: Option<&EvaluationResult> = None;
        for candidate in self.records.iter().filter(|r| self.meets(r, goal)) {
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    let ord = compare_metric(candidate, current, &goal.metric)
                        .then_with(|| compare_by_priority(candidate, current));
                    if ord == Ordering::Greater {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best
    }

    /// Records meeting every goal, best first by priority order.
    pub fn satisfying(&self, goals: &[Goal]) -> Vec<&EvaluationResult> {
        let mut matches: Vec<&EvaluationResult> = self
            .records
            .iter()
            .filter(|r| self.meets_all(r, goals))
            .collect();
        // Stable sort keeps insertion order among equals.
        matches.sort_by(|a, b| compare_by_priority(b, a));
        matches
    }

    /// Up to `count` results to report: the best goal-satisfying records, or
    /// the ranked Pareto frontier when none satisfies every goal.
    pub fn select(&self, goals: &[Goal], count: usize) -> Selection<'_> {
        let satisfying = self.satisfying(goals);
        if !satisfying.is_empty() {
            return Selection {
                goals_met: true,
                results: satisfying.into_iter().take(count).collect(),
            };
        }
        let mut frontier = self.pareto_frontier();
        frontier.sort_by(|a, b| compare_by_priority(b, a));
        Selection {
            goals_met: false,
            results: frontier.into_iter().take(count).collect(),
        }
    }

    pub fn to_document(&self) -> FootprintDocument {
        let pareto = self.pareto_indices();
        FootprintDocument {
            baseline: self.baseline.clone(),
            records: self
                .records
                .iter()
                .enumerate()
                .map(|(i, result)| FootprintEntry {
                    result: result.clone(),
                    pareto: pareto.contains(&i),
                })
                .collect(),
        }
    }

    pub fn from_document(document: FootprintDocument) -> Self {
        Self {
            records: document.records.into_iter().map(|e| e.result).collect(),
            baseline: document.baseline,
        }
    }

    pub fn save(&self, path: &Path) -> OvResult<()> {
        let json = serde_json::to_string_pretty(&self.to_document())?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> OvResult<Self> {
        let bytes = fs::read(path)?;
        let document: FootprintDocument = serde_json::from_slice(&bytes)?;
        Ok(Self::from_document(document))
    }
}

/// On-disk form of a footprint. `pareto` marks are informational; loading
/// recomputes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintDocument {
    #[serde(default)]
    pub baseline: Option<EvaluationResult>,
    pub records: Vec<FootprintEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintEntry {
    #[serde(flatten)]
    pub result: EvaluationResult,
    pub pareto: bool,
}
