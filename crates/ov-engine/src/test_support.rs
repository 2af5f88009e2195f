//! Fake passes, metrics and documents shared by the unit tests.
//!
//! Models are text files holding `bits=<n>`. Quantizing rewrites the bit
//! width, latency scales with it and accuracy drops as it shrinks.

use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ov_types::{
    ArtifactLocation, ArtifactRef, Assignment, Direction, Domain, ExecutionTarget, Metric,
    MetricContext, MetricError, ParamSchema, ParamType, ParamValue, Pass, PassContext, PassError,
    PassOutput, PassSchema, RawScore, ResolvedPass, RunConfig,
};
use tempfile::TempDir;

use crate::config::RunDocument;
use crate::registry::{MetricRegistry, PassRegistry, Registries};

pub const INPUT_BITS: i64 = 32;

pub fn quantize_schema() -> PassSchema {
    PassSchema::new().param(
        "bits",
        ParamSchema::new(ParamType::Int)
            .with_default(8i64)
            .with_search_default(Domain::discrete(vec![4i64.into(), 8i64.into()])),
    )
}

fn write_model(ctx: &PassContext, content: String) -> Result<PassOutput, PassError> {
    let path = ctx.output_dir.join("model.txt");
    fs::write(&path, content)?;
    Ok(PassOutput::file(path, Some("txt")))
}

fn read_model(artifact: &ArtifactRef) -> std::io::Result<String> {
    let path = artifact.location.path().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "artifact has no path")
    })?;
    fs::read_to_string(path)
}

fn bits_of(artifact: &ArtifactRef) -> Result<i64, MetricError> {
    let text = read_model(artifact)?;
    text.trim()
        .strip_prefix("bits=")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| MetricError::Failed(format!("not a model: {text}")))
}

/// Never executed; lets documents validate.
pub struct NoopPass;

impl Pass for NoopPass {
    fn execute(
        &self,
        input: &ArtifactRef,
        _params: &ResolvedPass,
        _ctx: &PassContext,
    ) -> Result<PassOutput, PassError> {
        Err(PassError::UnsupportedInput(input.location.to_string()))
    }
}

/// Writes `bits=<bits>` when it has a `bits` parameter and copies its input
/// otherwise. Counts executions and can reject one bit width.
pub struct CountingPass {
    calls: Arc<AtomicUsize>,
    reject_bits: Option<i64>,
}

impl CountingPass {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
                reject_bits: None,
            },
            calls,
        )
    }

    pub fn sharing(calls: &Arc<AtomicUsize>) -> Self {
        Self {
            calls: calls.clone(),
            reject_bits: None,
        }
    }

    pub fn rejecting(mut self, bits: i64) -> Self {
        self.reject_bits = Some(bits);
        self
    }
}

impl Pass for CountingPass {
    fn execute(
        &self,
        input: &ArtifactRef,
        params: &ResolvedPass,
        ctx: &PassContext,
    ) -> Result<PassOutput, PassError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = match params.get("bits") {
            Some(bits) => format!("bits={bits}"),
            None => read_model(input)?,
        };
        write_model(ctx, content)
    }

    fn validate(&self, params: &ResolvedPass, _target: &ExecutionTarget) -> Result<(), String> {
        match (self.reject_bits, params.get("bits").and_then(ParamValue::as_i64)) {
            (Some(rejected), Some(bits)) if rejected == bits => {
                Err(format!("{bits}-bit kernels are not available"))
            }
            _ => Ok(()),
        }
    }
}

pub struct FailingPass;

impl Pass for FailingPass {
    fn execute(
        &self,
        _input: &ArtifactRef,
        _params: &ResolvedPass,
        _ctx: &PassContext,
    ) -> Result<PassOutput, PassError> {
        Err(PassError::Failed("calibration diverged".into()))
    }
}

pub struct PanickingPass;

impl Pass for PanickingPass {
    fn execute(
        &self,
        _input: &ArtifactRef,
        _params: &ResolvedPass,
        _ctx: &PassContext,
    ) -> Result<PassOutput, PassError> {
        panic!("kernel exploded")
    }
}

pub struct SleepyPass(pub Duration);

impl Pass for SleepyPass {
    fn execute(
        &self,
        input: &ArtifactRef,
        _params: &ResolvedPass,
        ctx: &PassContext,
    ) -> Result<PassOutput, PassError> {
        std::thread::sleep(self.0);
        write_model(ctx, read_model(input)?)
    }
}

/// Latency is `100 * bits / 32`; accuracy loses half a point per dropped bit.
pub enum ModelMetric {
    Latency,
    Accuracy,
}

impl Metric for ModelMetric {
    fn score(&self, artifact: &ArtifactRef, _ctx: &MetricContext) -> Result<Vec<RawScore>, MetricError> {
        let bits = bits_of(artifact)? as f64;
        Ok(match self {
            Self::Latency => {
                let avg = 100.0 * bits / INPUT_BITS as f64;
                vec![
                    RawScore::new("avg", avg, Direction::LowerIsBetter),
                    RawScore::new("p90", avg * 1.2, Direction::LowerIsBetter),
                ]
            }
            Self::Accuracy => vec![RawScore::new(
                "top1",
                0.9 - (INPUT_BITS as f64 - bits) * 0.005,
                Direction::HigherIsBetter,
            )],
        })
    }
}

pub struct ConstantMetric {
    sub_type: &'static str,
    value: f64,
    direction: Direction,
}

impl ConstantMetric {
    pub fn latency(value: f64) -> Self {
        Self {
            sub_type: "avg",
            value,
            direction: Direction::LowerIsBetter,
        }
    }
}

impl Metric for ConstantMetric {
    fn score(&self, _artifact: &ArtifactRef, _ctx: &MetricContext) -> Result<Vec<RawScore>, MetricError> {
        Ok(vec![RawScore::new(self.sub_type, self.value, self.direction)])
    }
}

pub struct FailingMetric;

impl Metric for FailingMetric {
    fn score(&self, _artifact: &ArtifactRef, _ctx: &MetricContext) -> Result<Vec<RawScore>, MetricError> {
        Err(MetricError::Failed("power meter offline".into()))
    }
}

/// Reports a constant latency after sleeping.
pub struct SleepyMetric(pub Duration);

impl Metric for SleepyMetric {
    fn score(&self, _artifact: &ArtifactRef, _ctx: &MetricContext) -> Result<Vec<RawScore>, MetricError> {
        std::thread::sleep(self.0);
        Ok(vec![RawScore::new("avg", 1.0, Direction::LowerIsBetter)])
    }
}

/// A 32-bit input model on disk.
pub fn input_model(dir: &TempDir) -> ArtifactRef {
    let path = dir.path().join("input-model.txt");
    fs::write(&path, format!("bits={INPUT_BITS}")).unwrap();
    ArtifactRef::input(ArtifactLocation::File { path }, Some("1"), Some("txt".into()))
}

fn resolved(name: &str, pass_type: &str, params: &[(&str, ParamValue)]) -> ResolvedPass {
    ResolvedPass {
        name: name.into(),
        pass_type: pass_type.into(),
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
        informational: Default::default(),
        data_config: None,
    }
}

pub fn quantize_config(bits: i64) -> RunConfig {
    RunConfig::new(
        vec![resolved("quantize", "Quantize", &[("bits", ParamValue::Int(bits))])],
        Assignment::new(),
    )
}

/// Quantize, then copy.
pub fn two_step_config(bits: i64) -> RunConfig {
    RunConfig::new(
        vec![
            resolved("quantize", "Quantize", &[("bits", ParamValue::Int(bits))]),
            resolved("copy", "Copy", &[]),
        ],
        Assignment::new(),
    )
}

/// Registries with `Quantize`, `PickyQuantize` (rejects 4 bits), `Copy` and
/// `Broken` passes plus `latency`, `accuracy` and `power` metrics. The counter
/// tracks executions of every counting pass.
pub fn registries() -> (Registries, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let passes = PassRegistry::new()
        .with_pass("Quantize", quantize_schema(), Arc::new(CountingPass::sharing(&calls)))
        .and_then(|r| {
            r.with_pass(
                "PickyQuantize",
                quantize_schema(),
                Arc::new(CountingPass::sharing(&calls).rejecting(4)),
            )
        })
        .and_then(|r| r.with_pass("Copy", PassSchema::new(), Arc::new(CountingPass::sharing(&calls))))
        .and_then(|r| {
            r.with_pass(
                "Broken",
                PassSchema::new().param("level", ParamSchema::new(ParamType::Int)),
                Arc::new(FailingPass),
            )
        })
        .unwrap();
    let metrics = MetricRegistry::new()
        .with_metric("latency", Arc::new(ModelMetric::Latency))
        .with_metric("accuracy", Arc::new(ModelMetric::Accuracy))
        .with_metric("power", Arc::new(FailingMetric));
    (Registries::new(passes, metrics), calls)
}

/// A run document over a fresh input model with cache and outputs under `dir`.
pub fn document(
    dir: &TempDir,
    passes: serde_json::Value,
    metrics: serde_json::Value,
    search: Option<serde_json::Value>,
) -> RunDocument {
    let input = input_model(dir);
    let mut doc = serde_json::json!({
        "input_model": {"location": input.location, "version": "1", "format": "txt"},
        "passes": passes,
        "evaluator": {"metrics": metrics},
        "engine": {
            "cache_dir": dir.path().join("cache"),
            "output_dir": dir.path().join("out")
        }
    });
    if let Some(search) = search {
        doc["search_strategy"] = search;
    }
    serde_json::from_value(doc).unwrap()
}
