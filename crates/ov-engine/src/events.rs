//! Progress events published while a run is in flight.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use ov_optimizer::SearchState;
use ov_types::{ArtifactId, RunConfigId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EngineEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEventKind {
    RunStarted {
        strategy: String,
        searchable_params: usize,
    },
    BaselineEvaluated {
        objective: Option<f64>,
    },
    TrialStarted {
        trial_number: usize,
        run_config: RunConfigId,
        description: String,
    },
    StepCompleted {
        trial_number: usize,
        step_index: usize,
        pass_name: String,
        cached: bool,
        artifact: ArtifactId,
    },
    TrialCompleted {
        trial_number: usize,
        objective: Option<f64>,
    },
    TrialFailed {
        trial_number: usize,
        reason: String,
    },
    TrialPruned {
        trial_number: usize,
        reason: String,
    },
    RunFinished {
        state: SearchState,
        goals_met: bool,
        trials: usize,
    },
}

/// Non-blocking publisher. A full or disconnected channel drops the event.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<Sender<EngineEvent>>,
}

impl EventSink {
    pub fn new(sender: Sender<EngineEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, kind: EngineEventKind) {
        if let Some(tx) = &self.sender {
            let _ = tx.try_send(EngineEvent {
                timestamp: Utc::now(),
                kind,
            });
        }
    }
}
