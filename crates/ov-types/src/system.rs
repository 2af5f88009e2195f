//! Execution targets: where passes run and where metrics are measured.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the implicit local CPU system.
pub const LOCAL_SYSTEM: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Gpu,
    Npu,
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

/// A system as declared in a run document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub device: Device,
    /// Execution providers in preference order (e.g. "CUDAExecutionProvider").
    #[serde(default)]
    pub execution_providers: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// A resolved compute context. Opaque to the engine beyond routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTarget {
    pub name: String,
    pub device: Device,
    pub execution_providers: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ExecutionTarget {
    pub fn local() -> Self {
        Self {
            name: LOCAL_SYSTEM.to_string(),
            device: Device::Cpu,
            execution_providers: vec!["CPUExecutionProvider".to_string()],
            properties: BTreeMap::new(),
        }
    }

    fn from_config(name: &str, config: &SystemConfig) -> Self {
        Self {
            name: name.to_string(),
            device: config.device,
            execution_providers: config.execution_providers.clone(),
            properties: config.properties.clone(),
        }
    }
}

/// Looks up a declared target name.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<ExecutionTarget>;
}

/// Resolver backed by the `systems` section of a run document. Always knows
/// about [`LOCAL_SYSTEM`] unless the document overrides it.
#[derive(Debug, Clone, Default)]
pub struct SystemCatalog {
    systems: BTreeMap<String, SystemConfig>,
}

impl SystemCatalog {
    pub fn new(systems: BTreeMap<String, SystemConfig>) -> Self {
        Self { systems }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.systems.keys().cloned().collect();
        if !self.systems.contains_key(LOCAL_SYSTEM) {
            names.push(LOCAL_SYSTEM.to_string());
        }
        names
    }
}

impl TargetResolver for SystemCatalog {
    fn resolve(&self, name: &str) -> Option<ExecutionTarget> {
        match self.systems.get(name) {
            Some(config) => Some(ExecutionTarget::from_config(name, config)),
            None if name == LOCAL_SYSTEM => Some(ExecutionTarget::local()),
            None => None,
        }
    }
}
