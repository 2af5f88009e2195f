//! Pipeline executor: runs the passes of one configuration in order, reusing
//! cached step outputs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use ov_cache::{CacheKey, RunCache};
use ov_types::{
    internal_error, ArtifactRef, DataProvider, ExecutionTarget, FailureCause, OvResult, Pass,
    PassContext, PassFailure, PassOutput, ResolvedPass, RunConfig,
};

use crate::events::{EngineEventKind, EventSink};

/// What happened at one step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: usize,
    pub pass_name: String,
    pub pass_type: String,
    pub cache_key: CacheKey,
    pub cached: bool,
    pub output: ArtifactRef,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    /// Output of the last step, or the input itself for an empty pipeline.
    pub artifact: ArtifactRef,
    pub steps: Vec<StepRecord>,
}

impl PipelineOutput {
    pub fn executed_count(&self) -> usize {
        self.steps.iter().filter(|s| !s.cached).count()
    }

    pub fn cache_hits(&self) -> usize {
        self.steps.iter().filter(|s| s.cached).count()
    }
}

/// Turn a worker join error into a failure cause, keeping the panic message
/// when there is one.
pub(crate) fn join_failure(err: JoinError) -> FailureCause {
    if !err.is_panic() {
        return FailureCause::error(format!("worker cancelled: {err}"));
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    FailureCause::Panicked { message }
}

pub struct PipelineExecutor {
    passes: HashMap<String, Arc<dyn Pass>>,
    cache: Arc<dyn RunCache>,
    data: BTreeMap<String, Arc<dyn DataProvider>>,
    host: ExecutionTarget,
    pass_timeout: Option<Duration>,
    events: EventSink,
}

impl PipelineExecutor {
    pub fn new(cache: Arc<dyn RunCache>, host: ExecutionTarget) -> Self {
        Self {
            passes: HashMap::new(),
            cache,
            data: BTreeMap::new(),
            host,
            pass_timeout: None,
            events: EventSink::disabled(),
        }
    }

    pub fn with_pass(mut self, pass_type: &str, implementation: Arc<dyn Pass>) -> Self {
        self.passes.insert(pass_type.to_string(), implementation);
        self
    }

    pub fn with_data(mut self, data: BTreeMap<String, Arc<dyn DataProvider>>) -> Self {
        self.data = data;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pass_timeout = timeout;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn cache(&self) -> &Arc<dyn RunCache> {
        &self.cache
    }

    /// Ask every pass whether it accepts its parameters on the host. The first
    /// rejection is returned as `"<pass name>: <reason>"`.
    pub fn prevalidate(&self, config: &RunConfig) -> Result<(), String> {
        for pass in &config.passes {
            if let Some(implementation) = self.passes.get(&pass.pass_type) {
                implementation
                    .validate(pass, &self.host)
                    .map_err(|reason| format!("{}: {}", pass.name, reason))?;
            }
        }
        Ok(())
    }

    fn data_for(&self, pass: &ResolvedPass) -> OvResult<Option<Arc<dyn DataProvider>>> {
        match &pass.data_config {
            None => Ok(None),
            Some(name) => self
                .data
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| internal_error!("data config {} was not created", name)),
        }
    }

    /// Run `config` against `input`.
    ///
    /// A pass error, timeout or panic ends the chain with [`OvError::Pass`].
    /// Cache errors are returned as they are; the caller decides whether a
    /// broken cache is fatal.
    ///
    /// [`OvError::Pass`]: ov_types::OvError::Pass
    pub async fn run(
        &self,
        config: &RunConfig,
        input: &ArtifactRef,
        trial_number: usize,
    ) -> OvResult<PipelineOutput> {
        let mut current = input.clone();
        let mut steps = Vec::with_capacity(config.len());

        for (step_index, pass) in config.passes.iter().enumerate() {
            let started = Instant::now();
            let data = self.data_for(pass)?;
            let key = CacheKey::derive(pass, &current.id, &self.host, data.as_ref().map(|d| d.id()));

            let (output, cached) = match self.cache.lookup(&key)? {
                Some(hit) => {
                    debug!(step = step_index, pass = %pass.name, key = %key.short(), "Cache hit");
                    (hit, true)
                }
                None => {
                    let output = self.execute_step(step_index, pass, &current, &key, data).await?;
                    self.cache.store(&key, &pass.pass_type, &output)?;
                    (output, false)
                }
            };

            self.events.emit(EngineEventKind::StepCompleted {
                trial_number,
                step_index,
                pass_name: pass.name.clone(),
                cached,
                artifact: output.id,
            });
            steps.push(StepRecord {
                step_index,
                pass_name: pass.name.clone(),
                pass_type: pass.pass_type.clone(),
                cache_key: key,
                cached,
                output: output.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
            current = output;
        }

        Ok(PipelineOutput {
            artifact: current,
            steps,
        })
    }

    async fn execute_step(
        &self,
        step_index: usize,
        pass: &ResolvedPass,
        input: &ArtifactRef,
        key: &CacheKey,
        data: Option<Arc<dyn DataProvider>>,
    ) -> OvResult<ArtifactRef> {
        let failure = |cause: FailureCause| PassFailure {
            step_index,
            pass_name: pass.name.clone(),
            pass_type: pass.pass_type.clone(),
            cause,
        };

        let implementation = self.passes.get(&pass.pass_type).cloned().ok_or_else(|| {
            internal_error!("no implementation bound for pass type {}", pass.pass_type)
        })?;
        let ctx = PassContext {
            step_index,
            output_dir: self.cache.allocate_output(key)?,
            target: self.host.clone(),
            data,
        };

        info!("Running step {} ({}: {})", step_index, pass.name, pass.pass_type);
        let output = self
            .call_pass(implementation, input.clone(), pass.clone(), ctx)
            .await
            .map_err(|cause| {
                warn!(step = step_index, pass = %pass.name, error = %cause, "Pass failed");
                failure(cause)
            })?;

        let artifact = ArtifactRef::produced(output.location, output.format, &key.0)
            .map_err(|e| failure(FailureCause::error(format!("output is not readable: {e}"))))?;
        Ok(artifact)
    }

    async fn call_pass(
        &self,
        implementation: Arc<dyn Pass>,
        input: ArtifactRef,
        params: ResolvedPass,
        ctx: PassContext,
    ) -> Result<PassOutput, FailureCause> {
        let handle =
            tokio::task::spawn_blocking(move || implementation.execute(&input, &params, &ctx));

        // The worker cannot be interrupted; on timeout it is left to finish alone.
        let joined = match self.pass_timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    return Err(FailureCause::Timeout {
                        seconds: limit.as_secs(),
                    })
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(FailureCause::error(e.to_string())),
            Err(e) => Err(join_failure(e)),
        }
    }
}
