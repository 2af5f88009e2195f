//! Pass parameters: concrete values, search domains and declared schemas.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Json(serde_json::Value),
}

impl ParamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// The set of values a searchable parameter may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Domain {
    /// Ordered finite set; neighbours are meaningful.
    Discrete { values: Vec<ParamValue> },
    /// Unordered finite set.
    Categorical { values: Vec<ParamValue> },
    /// Integers in `[low, high]` with the given stride.
    IntRange {
        low: i64,
        high: i64,
        #[serde(default = "default_step")]
        step: i64,
    },
    /// Continuous interval `[low, high]`, optionally sampled in log-space.
    FloatRange {
        low: f64,
        high: f64,
        #[serde(default)]
        log: bool,
    },
}

fn default_step() -> i64 {
    1
}

/// Number of whole steps between `low` and the highest aligned value, or
/// `None` when the range is empty or its span does not fit in an `i64`.
fn int_slots(low: i64, high: i64, step: i64) -> Option<i64> {
    if step <= 0 {
        return None;
    }
    high.checked_sub(low)
        .filter(|span| *span >= 0)
        .map(|span| span / step)
}

impl Domain {
    pub fn discrete(values: Vec<ParamValue>) -> Self {
        Self::Discrete { values }
    }

    pub fn categorical(values: Vec<ParamValue>) -> Self {
        Self::Categorical { values }
    }

    /// Structural checks independent of any parameter type.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Discrete { values } | Self::Categorical { values } => {
                if values.is_empty() {
                    return Err("domain has no values".to_string());
                }
            }
            Self::IntRange { low, high, step } => {
                if low > high {
                    return Err(format!("low {low} is greater than high {high}"));
                }
                if *step <= 0 {
                    return Err(format!("step must be positive, got {step}"));
                }
                if high.checked_sub(*low).is_none() {
                    return Err(format!("range [{low}, {high}] is too wide"));
                }
            }
            Self::FloatRange { low, high, log } => {
                if !(low.is_finite() && high.is_finite()) || low > high {
                    return Err(format!("invalid interval [{low}, {high}]"));
                }
                if *log && *low <= 0.0 {
                    return Err("log-scaled range needs a positive lower bound".to_string());
                }
            }
        }
        Ok(())
    }

    /// Number of distinct values, or `None` for continuous domains.
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::Discrete { values } | Self::Categorical { values } => Some(values.len()),
            Self::IntRange { low, high, step } => Some(
                int_slots(*low, *high, *step)
                    .and_then(|slots| usize::try_from(slots).ok())
                    .map_or(0, |slots| slots.saturating_add(1)),
            ),
            Self::FloatRange { .. } => None,
        }
    }

    /// The highest value of an integer range that lies on its step grid.
    pub fn aligned_high(&self) -> Option<i64> {
        match self {
            Self::IntRange { low, high, step } => {
                int_slots(*low, *high, *step).map(|slots| low + slots * step)
            }
            _ => None,
        }
    }

    /// Number of points [`Domain::enumerate`] yields, computed without
    /// building them.
    pub fn grid_len(&self, float_steps: usize) -> usize {
        match self {
            Self::FloatRange { low, high, .. } if low == high => 1,
            Self::FloatRange { .. } => float_steps.max(2),
            _ => self.size().unwrap_or(0),
        }
    }

    /// The `index`-th grid point in enumeration order, or `None` past the end.
    pub fn grid_point(&self, index: usize, float_steps: usize) -> Option<ParamValue> {
        if index >= self.grid_len(float_steps) {
            return None;
        }
        match self {
            Self::Discrete { values } | Self::Categorical { values } => values.get(index).cloned(),
            Self::IntRange { low, step, .. } => {
                let offset = i64::try_from(index).ok()?.checked_mul(*step)?;
                low.checked_add(offset).map(ParamValue::Int)
            }
            Self::FloatRange { low, high, log } => {
                if low == high {
                    return Some(ParamValue::Float(*low));
                }
                let steps = float_steps.max(2);
                let (lo, hi) = if *log { (low.ln(), high.ln()) } else { (*low, *high) };
                let t = index as f64 / (steps - 1) as f64;
                let v = lo + t * (hi - lo);
                Some(ParamValue::Float(if *log { v.exp() } else { v }))
            }
        }
    }

    /// Grid points in deterministic order. Continuous ranges are sampled at
    /// `float_steps` evenly spaced points (log-spaced when `log` is set).
    pub fn enumerate(&self, float_steps: usize) -> Vec<ParamValue> {
        (0..self.grid_len(float_steps))
            .map_while(|i| self.grid_point(i, float_steps))
            .collect()
    }

    pub fn contains(&self, value: &ParamValue) -> bool {
        match self {
            Self::Discrete { values } | Self::Categorical { values } => values.contains(value),
            Self::IntRange { low, high, step } => match value.as_i64() {
                Some(v) if *step > 0 && v >= *low && v <= *high => {
                    v.checked_sub(*low).is_some_and(|offset| offset % step == 0)
                }
                _ => false,
            },
            Self::FloatRange { low, high, .. } => match value.as_f64() {
                Some(v) => v >= *low && v <= *high,
                None => false,
            },
        }
    }

    /// The value used when search is disabled and no default applies.
    pub fn first(&self) -> Option<ParamValue> {
        match self {
            Self::Discrete { values } | Self::Categorical { values } => values.first().cloned(),
            Self::IntRange { low, .. } => Some(ParamValue::Int(*low)),
            Self::FloatRange { low, .. } => Some(ParamValue::Float(*low)),
        }
    }

    /// Draw one value uniformly (log-uniformly for log ranges).
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match self {
            Self::Discrete { values } | Self::Categorical { values } => {
                values[rng.gen_range(0..values.len())].clone()
            }
            Self::IntRange { low, high, step } => {
                let slots = int_slots(*low, *high, *step).unwrap_or(0);
                ParamValue::Int(low + rng.gen_range(0..=slots) * step)
            }
            Self::FloatRange { low, high, log } => {
                if low == high {
                    return ParamValue::Float(*low);
                }
                if *log {
                    ParamValue::Float(rng.gen_range(low.ln()..=high.ln()).exp())
                } else {
                    ParamValue::Float(rng.gen_range(*low..=*high))
                }
            }
        }
    }
}

/// Either a literal value or a search space to be resolved by the optimizer.
///
/// In documents a searchable parameter is written as `{"search": <domain>}`;
/// anything else is a fixed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSetting", into = "RawSetting")]
pub enum ParamSetting {
    Fixed(ParamValue),
    Searchable(Domain),
}

impl ParamSetting {
    pub fn is_searchable(&self) -> bool {
        matches!(self, Self::Searchable(_))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSetting {
    Search { search: Domain },
    Value(ParamValue),
}

impl From<RawSetting> for ParamSetting {
    fn from(raw: RawSetting) -> Self {
        match raw {
            RawSetting::Search { search } => Self::Searchable(search),
            RawSetting::Value(v) => Self::Fixed(v),
        }
    }
}

impl From<ParamSetting> for RawSetting {
    fn from(setting: ParamSetting) -> Self {
        match setting {
            ParamSetting::Searchable(search) => Self::Search { search },
            ParamSetting::Fixed(v) => Self::Value(v),
        }
    }
}

/// Declared type of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamType {
    Bool,
    Int,
    Float,
    String,
    /// String restricted to a fixed vocabulary.
    Enum { allowed: Vec<String> },
    /// Anything JSON can express (lists, nested configs).
    Any,
}

impl ParamType {
    /// Check `value` against this type, widening ints to floats where needed.
    pub fn coerce(&self, value: &ParamValue) -> Result<ParamValue, String> {
        match (self, value) {
            (Self::Any, v) => Ok(v.clone()),
            (Self::Bool, ParamValue::Bool(_)) => Ok(value.clone()),
            (Self::Int, ParamValue::Int(_)) => Ok(value.clone()),
            (Self::Float, ParamValue::Float(_)) => Ok(value.clone()),
            (Self::Float, ParamValue::Int(v)) => Ok(ParamValue::Float(*v as f64)),
            (Self::String, ParamValue::Str(_)) => Ok(value.clone()),
            (Self::Enum { allowed }, ParamValue::Str(s)) => {
                if allowed.iter().any(|a| a == s) {
                    Ok(value.clone())
                } else {
                    Err(format!("{s} is not one of [{}]", allowed.join(", ")))
                }
            }
            (ty, v) => Err(format!("expected {ty:?}, got {v}")),
        }
    }

    /// Coerce every value a domain can produce.
    pub fn coerce_domain(&self, domain: &Domain) -> Result<Domain, String> {
        domain.validate()?;
        match domain {
            Domain::Discrete { values } => Ok(Domain::Discrete {
                values: values.iter().map(|v| self.coerce(v)).collect::<Result<_, _>>()?,
            }),
            Domain::Categorical { values } => Ok(Domain::Categorical {
                values: values.iter().map(|v| self.coerce(v)).collect::<Result<_, _>>()?,
            }),
            Domain::IntRange { .. } => match self {
                Self::Int | Self::Any => Ok(domain.clone()),
                other => Err(format!("integer range is not valid for {other:?}")),
            },
            Domain::FloatRange { .. } => match self {
                Self::Float | Self::Any => Ok(domain.clone()),
                other => Err(format!("float range is not valid for {other:?}")),
            },
        }
    }
}

fn default_true() -> bool {
    true
}

/// Declaration of one parameter accepted by a pass type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    pub param_type: ParamType,
    #[serde(default)]
    pub default: Option<ParamValue>,
    #[serde(default)]
    pub required: bool,
    /// `false` for informational parameters (log levels, progress flags);
    /// those are left out of cache keys and configuration identities.
    #[serde(default = "default_true")]
    pub affects_output: bool,
    /// Search space used when the author leaves the parameter unset and
    /// search is enabled for the pass.
    #[serde(default)]
    pub search_default: Option<Domain>,
    #[serde(default)]
    pub description: String,
}

impl ParamSchema {
    pub fn new(param_type: ParamType) -> Self {
        Self {
            param_type,
            default: None,
            required: false,
            affects_output: true,
            search_default: None,
            description: String::new(),
        }
    }

    pub fn with_default(mut self, value: impl Into<ParamValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn informational(mut self) -> Self {
        self.affects_output = false;
        self
    }

    pub fn with_search_default(mut self, domain: Domain) -> Self {
        self.search_default = Some(domain);
        self
    }

    pub fn describe(mut self, text: &str) -> Self {
        self.description = text.to_string();
        self
    }
}

/// Everything a pass type accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassSchema {
    pub params: BTreeMap<String, ParamSchema>,
    #[serde(default)]
    pub description: String,
}

impl PassSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, schema: ParamSchema) -> Self {
        self.params.insert(name.into(), schema);
        self
    }

    pub fn describe(mut self, text: &str) -> Self {
        self.description = text.to_string();
        self
    }
}
