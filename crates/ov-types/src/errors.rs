use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the Olivine system
#[derive(Error, Debug)]
pub enum OvError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Pass failure: {0}")]
    Pass(#[from] PassFailure),

    #[error("Evaluation failure: {0}")]
    Eval(#[from] EvalFailure),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration and schema errors. Always raised before any pass runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Unknown pass type: {pass_type}")]
    UnknownPassType { pass_type: String },

    #[error("Pass type {pass_type} has no parameter named {parameter}")]
    UnknownParameter { pass_type: String, parameter: String },

    #[error("Pass type {pass_type} requires parameter {parameter}")]
    MissingParameter { pass_type: String, parameter: String },

    #[error("Invalid value for {pass_type}.{parameter}: {message}")]
    InvalidValue {
        pass_type: String,
        parameter: String,
        message: String,
    },

    #[error("Invalid search domain for {pass_type}.{parameter}: {message}")]
    InvalidDomain {
        pass_type: String,
        parameter: String,
        message: String,
    },

    #[error("No implementation registered for {kind} {name}")]
    MissingImplementation { kind: String, name: String },

    #[error("Unknown {kind} referenced: {name}")]
    UnknownReference { kind: String, name: String },

    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: String, name: String },

    #[error("Invalid metric {metric}: {message}")]
    InvalidMetric { metric: String, message: String },

    #[error("Goal on {metric} is relative to the input model; enable evaluate_input_model")]
    BaselineRequired { metric: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Why a pass or a metric did not produce a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The implementation returned an error.
    Error { message: String },
    /// The engine stopped waiting after the configured timeout.
    Timeout { seconds: u64 },
    /// The implementation panicked on its worker thread.
    Panicked { message: String },
}

impl FailureCause {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error { message } => write!(f, "{message}"),
            Self::Timeout { seconds } => write!(f, "timed out after {seconds}s"),
            Self::Panicked { message } => write!(f, "panicked: {message}"),
        }
    }
}

/// A pass raised an error or timed out; the rest of the chain was abandoned.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("step {step_index} ({pass_name}: {pass_type}) failed: {cause}")]
pub struct PassFailure {
    pub step_index: usize,
    pub pass_name: String,
    pub pass_type: String,
    pub cause: FailureCause,
}

/// A metric could not be scored.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("metric {metric} failed: {cause}")]
pub struct EvalFailure {
    pub metric: String,
    pub cause: FailureCause,
}

/// Run cache storage errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache storage unavailable at {path}: {message}")]
    Unavailable { path: String, message: String },

    #[error("Corrupt cache entry {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for Olivine operations
pub type OvResult<T> = Result<T, OvError>;

/// Macro for creating schema errors with a free-form message
#[macro_export]
macro_rules! schema_error {
    ($($arg:tt)*) => {
        $crate::SchemaError::Invalid { message: format!($($arg)*) }
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::OvError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::OvError::Config(format!($($arg)*))
    };
}
