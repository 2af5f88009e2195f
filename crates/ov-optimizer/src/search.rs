//! Search space definitions and proposal strategies.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use ov_types::{Assignment, Domain, ParamValue, RunTemplate};

/// One searchable parameter, keyed `pass.param`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub key: String,
    pub domain: Domain,
}

/// The full search space: an ordered list of dimensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub dimensions: Vec<Dimension>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dimensions of every searchable parameter left open in `template`.
    pub fn from_template(template: &RunTemplate) -> Self {
        Self {
            dimensions: template
                .searchable()
                .into_iter()
                .map(|(key, domain)| Dimension { key, domain })
                .collect(),
        }
    }

    pub fn add(mut self, key: impl Into<String>, domain: Domain) -> Self {
        self.dimensions.push(Dimension {
            key: key.into(),
            domain,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Number of distinct assignments, or `None` if any dimension is
    /// continuous.
    pub fn size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for dim in &self.dimensions {
            total = total.checked_mul(dim.domain.size()?)?;
        }
        Some(total)
    }

    pub fn is_finite(&self) -> bool {
        self.size().is_some()
    }

    /// Number of grid points, saturating at `usize::MAX`.
    pub fn grid_len(&self, float_steps: usize) -> usize {
        self.dimensions.iter().fold(1usize, |total, dim| {
            total.saturating_mul(dim.domain.grid_len(float_steps))
        })
    }

    /// The `index`-th point of the Cartesian product, decoded as a mixed-radix
    /// number; the last dimension varies fastest.
    pub fn grid_point(&self, index: usize, float_steps: usize) -> Option<Assignment> {
        let mut rest = index;
        let mut assignment = Assignment::new();
        for dim in self.dimensions.iter().rev() {
            let radix = dim.domain.grid_len(float_steps);
            if radix == 0 {
                return None;
            }
            let value = dim.domain.grid_point(rest % radix, float_steps)?;
            assignment.insert(dim.key.clone(), value);
            rest /= radix;
        }
        (rest == 0).then_some(assignment)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Assignment {
        self.dimensions
            .iter()
            .map(|dim| (dim.key.clone(), dim.domain.sample(rng)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Common trait for all search strategies.
pub trait SearchStrategy: Send {
    /// Generate up to `count` assignments. An empty batch means the strategy
    /// has nothing left to propose.
    fn suggest(&mut self, count: usize) -> Vec<Assignment>;

    /// Feed back the outcome of an assignment. `objective` is larger-is-better
    /// and `None` when the configuration failed.
    fn report(&mut self, _assignment: &Assignment, _objective: Option<f64>) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;

    /// Whether the strategy runs dry on its own after finitely many
    /// proposals.
    fn is_finite(&self) -> bool {
        false
    }
}

fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}

// ---- Exhaustive search ----

/// Visits every grid point exactly once, in order.
#[derive(Debug, Clone)]
pub struct ExhaustiveSearch {
    space: SearchSpace,
    float_steps: usize,
    cursor: usize,
    total: usize,
}

impl ExhaustiveSearch {
    pub fn new(space: &SearchSpace, float_steps: usize) -> Self {
        Self {
            space: space.clone(),
            float_steps,
            cursor: 0,
            total: space.grid_len(float_steps),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

impl SearchStrategy for ExhaustiveSearch {
    fn suggest(&mut self, count: usize) -> Vec<Assignment> {
        let end = self.cursor.saturating_add(count).min(self.total);
        let batch = (self.cursor..end)
            .map_while(|i| self.space.grid_point(i, self.float_steps))
            .collect();
        self.cursor = end;
        batch
    }

    fn name(&self) -> &str {
        "exhaustive"
    }

    fn is_finite(&self) -> bool {
        true
    }
}

// ---- Random search ----

/// Independent random sampling. Finite spaces are drawn without replacement
/// and run dry once every point has been proposed.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: ChaCha8Rng,
    finite: Option<Drawn>,
}

/// Grid indices already handed out from a finite space.
#[derive(Debug, Clone)]
struct Drawn {
    total: usize,
    indices: HashSet<usize>,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, seed: Option<u64>) -> Self {
        let finite = space.size().map(|total| Drawn {
            total,
            indices: HashSet::new(),
        });
        Self {
            space,
            rng: seeded_rng(seed),
            finite,
        }
    }

    fn sample_one(&mut self) -> Option<Assignment> {
        let Some(drawn) = &mut self.finite else {
            return Some(self.space.sample(&mut self.rng));
        };
        if drawn.indices.len() >= drawn.total {
            return None;
        }
        loop {
            let index = self.rng.gen_range(0..drawn.total);
            if drawn.indices.insert(index) {
                return self.space.grid_point(index, 0);
            }
        }
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<Assignment> {
        (0..count).map_while(|_| self.sample_one()).collect()
    }

    fn name(&self) -> &str {
        "random"
    }

    fn is_finite(&self) -> bool {
        self.finite.is_some()
    }
}

// ---- Model-based search ----

/// Sequential model-based search.
///
/// Tracks observed (assignment, objective) pairs and biases sampling toward
/// the best one seen so far: with probability `exploration_weight` it draws a
/// fresh random point, otherwise it perturbs the incumbent one step along each
/// dimension.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    space: SearchSpace,
    rng: ChaCha8Rng,
    observations: Vec<(Assignment, f64)>,
    exploration_weight: f64,
}

impl BayesianSearch {
    pub fn new(space: SearchSpace, exploration_weight: f64, seed: Option<u64>) -> Self {
        Self {
            space,
            rng: seeded_rng(seed),
            observations: Vec::new(),
            exploration_weight,
        }
    }

    fn explore(&mut self) -> Assignment {
        self.space.sample(&mut self.rng)
    }

    /// Perturb the best-known point.
    fn exploit(&mut self) -> Assignment {
        let best = self
            .observations
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(assignment, _)| assignment.clone());

        let Some(base) = best else {
            return self.explore();
        };

        let mut perturbed = Assignment::new();
        for dim in &self.space.dimensions {
            let value = match base.get(&dim.key) {
                Some(current) => perturb(&dim.domain, current, &mut self.rng),
                None => dim.domain.sample(&mut self.rng),
            };
            perturbed.insert(dim.key.clone(), value);
        }
        perturbed
    }
}

fn perturb<R: Rng + ?Sized>(domain: &Domain, current: &ParamValue, rng: &mut R) -> ParamValue {
    match (domain, current) {
        (Domain::IntRange { low, step, .. }, ParamValue::Int(v)) => {
            let Some(top) = domain.aligned_high() else {
                return domain.sample(rng);
            };
            // Work in step units so the result stays on the grid.
            let slots = (top - low) / step;
            let current = v.checked_sub(*low).map_or(0, |offset| offset / step);
            let delta: i64 = rng.gen_range(-2..=2);
            let slot = current.saturating_add(delta).clamp(0, slots);
            ParamValue::Int(low + slot * step)
        }
        (Domain::FloatRange { low, high, log }, _) => {
            let Some(v) = current.as_f64() else {
                return domain.sample(rng);
            };
            if low == high {
                return ParamValue::Float(*low);
            }
            if *log {
                let range = high.ln() - low.ln();
                let noise = rng.gen_range(-0.1..0.1) * range;
                ParamValue::Float((v.ln() + noise).exp().clamp(*low, *high))
            } else {
                let noise = rng.gen_range(-0.1..0.1) * (high - low);
                ParamValue::Float((v + noise).clamp(*low, *high))
            }
        }
        (Domain::Discrete { values }, _) => match values.iter().position(|v| v == current) {
            Some(idx) => {
                let lo = idx.saturating_sub(1);
                let hi = (idx + 1).min(values.len() - 1);
                values[rng.gen_range(lo..=hi)].clone()
            }
            None => domain.sample(rng),
        },
        // Categorical values have no neighbours.
        _ => domain.sample(rng),
    }
}

impl SearchStrategy for BayesianSearch {
    fn suggest(&mut self, count: usize) -> Vec<Assignment> {
        (0..count)
            .map(|_| {
                if self.observations.is_empty() || self.rng.gen::<f64>() < self.exploration_weight {
                    self.explore()
                } else {
                    self.exploit()
                }
            })
            .collect()
    }

    fn report(&mut self, assignment: &Assignment, objective: Option<f64>) {
        if let Some(objective) = objective.filter(|o| o.is_finite()) {
            self.observations.push((assignment.clone(), objective));
        }
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}

// ---- Fixed pipeline ----

/// Used when search is disabled: proposes exactly one assignment.
#[derive(Debug, Clone)]
pub struct FixedPipeline {
    assignment: Option<Assignment>,
}

impl FixedPipeline {
    pub fn new(assignment: Assignment) -> Self {
        Self {
            assignment: Some(assignment),
        }
    }
}

impl SearchStrategy for FixedPipeline {
    fn suggest(&mut self, count: usize) -> Vec<Assignment> {
        if count == 0 {
            return Vec::new();
        }
        self.assignment.take().into_iter().collect()
    }

    fn name(&self) -> &str {
        "fixed"
    }

    fn is_finite(&self) -> bool {
        true
    }
}
