//! Sample-input providers used for calibration and evaluation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A data config as declared in a run document. `data_type` selects a
/// registered provider factory; `params` is handed to it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Dense row-major tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One representative input, keyed by model input name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub inputs: BTreeMap<String, Tensor>,
    #[serde(default)]
    pub label: Option<serde_json::Value>,
}

/// Supplies samples for calibration or evaluation.
pub trait DataProvider: Send + Sync {
    /// Stable identity of the dataset (name plus version, path, split...).
    fn id(&self) -> &str;

    fn samples(&self) -> Box<dyn Iterator<Item = Sample> + Send + '_>;
}

/// Fixed in-memory dataset.
#[derive(Debug, Clone)]
pub struct InMemoryData {
    id: String,
    samples: Vec<Sample>,
}

impl InMemoryData {
    pub fn new(id: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            id: id.into(),
            samples,
        }
    }
}

impl DataProvider for InMemoryData {
    fn id(&self) -> &str {
        &self.id
    }

    fn samples(&self) -> Box<dyn Iterator<Item = Sample> + Send + '_> {
        Box::new(self.samples.iter().cloned())
    }
}
