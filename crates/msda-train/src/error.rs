//! Error types for the domain-adaptation training steps.
//!
//! Every module imports its error type from here. Step-level functions return
//! [`TrainResult`]; configuration and dataset code return their own error
//! types which coerce into [`TrainError`] via [`From`].
//!
//! ## Hierarchy
//!
//! ```text
//! TrainError (top-level)
//! ├── ConfigError   (config validation / file loading)
//! ├── DatasetError  (synthetic dataset access)
//! └── tch::TchError (libtorch failures surfaced through fallible tch calls)
//! ```

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TrainResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by step-level functions.
pub type TrainResult<T> = Result<T, TrainError>;

// ---------------------------------------------------------------------------
// TrainError
// ---------------------------------------------------------------------------

/// Top-level error type for the training steps.
///
/// Validation errors (`BatchLengthMismatch`, `ShapeMismatch`, ...) are raised
/// before any forward pass so that a failed `train()` call never leaves
/// partially-applied gradients or metrics behind.
#[derive(Debug, Error)]
pub enum TrainError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A dataset access error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error reported by libtorch.
    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    /// The domain list is empty.
    #[error("Domain list is empty")]
    EmptyDomainList,

    /// The domain list holds only the target domain.
    #[error("Domain list `{target}` has no source domain; at least one source is required")]
    MissingSourceDomain {
        /// The lone (target) domain.
        target: String,
    },

    /// The same domain name appears twice.
    #[error("Domain `{0}` appears more than once in the domain list")]
    DuplicateDomain(String),

    /// A batch does not carry one record per domain.
    #[error("Batch has {actual} domain records, expected {expected}")]
    BatchLengthMismatch {
        /// Number of domains the step was built for.
        expected: usize,
        /// Number of records in the batch.
        actual: usize,
    },

    /// The records of a batch do not share a batch size.
    #[error("Record {index} has batch size {actual}, expected {expected}")]
    BatchSizeMismatch {
        /// Index of the offending record.
        index: usize,
        /// Batch size of the first record.
        expected: i64,
        /// Batch size of the offending record.
        actual: i64,
    },

    /// A shape mismatch was detected between two tensors.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<i64>,
        /// Actual shape.
        actual: Vec<i64>,
    },

    /// More per-domain heads than domain inputs were supplied.
    #[error("{heads} per-domain heads supplied for {inputs} inputs")]
    HeadCountMismatch {
        /// Number of heads.
        heads: usize,
        /// Number of inputs.
        inputs: usize,
    },

    /// A batch contains nothing to run.
    #[error("Batch is empty")]
    EmptyBatch,

    /// A class label does not index into the head's outputs.
    #[error("Record {index} has label {label}, expected a class in 0..{n_classes}")]
    LabelOutOfRange {
        /// Position of the record in the batch.
        index: usize,
        /// The offending label.
        label: i64,
        /// Width of the head scoring the record.
        n_classes: i64,
    },

    /// A loss evaluated to NaN or infinity.
    #[error("Loss `{name}` is not finite ({value})")]
    NonFiniteLoss {
        /// Registry name of the loss.
        name: &'static str,
        /// The offending value.
        value: f64,
    },

    /// The target record lacks the second augmented view.
    #[error("Target record has no augmented view; run it through SelfEnsemblingPreprocessor")]
    MissingAugmentedView,

    /// The backbone factory does not know the requested architecture.
    #[error("Unknown backbone `{0}`")]
    UnknownBackbone(String),

    /// Two models that must share a parameter layout do not.
    #[error("Model `{name}` does not match: {reason}")]
    ModelMismatch {
        /// Name of the model being updated.
        name: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A checkpoint could not be saved or loaded.
    #[error("Checkpoint error: {message} (path: {path:?})")]
    Checkpoint {
        /// Human-readable description.
        message: String,
        /// Path that was being accessed.
        path: PathBuf,
    },
}

impl TrainError {
    /// Construct a [`TrainError::Checkpoint`].
    pub fn checkpoint<S: Into<String>>(msg: S, path: impl Into<PathBuf>) -> Self {
        TrainError::Checkpoint { message: msg.into(), path: path.into() }
    }

    /// Construct a [`TrainError::ShapeMismatch`].
    pub fn shape_mismatch(expected: Vec<i64>, actual: Vec<i64>) -> Self {
        TrainError::ShapeMismatch { expected, actual }
    }

    /// Construct a [`TrainError::ModelMismatch`].
    pub fn model_mismatch<S: Into<String>>(name: impl Into<String>, reason: S) -> Self {
        TrainError::ModelMismatch { name: name.into(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`StepConfig`].
///
/// [`StepConfig`]: crate::config::StepConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read from or written to disk.
    #[error("Cannot access config file `{path}`: {source}")]
    FileRead {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Errors produced while accessing dataset samples.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A sample index is out of bounds.
    #[error("Index {idx} out of bounds (domain `{domain}` has {len} samples)")]
    IndexOutOfBounds {
        /// Domain being read.
        domain: String,
        /// The requested index.
        idx: usize,
        /// Number of samples in the domain.
        len: usize,
    },

    /// The requested domain is not part of the dataset.
    #[error("Unknown domain `{0}`")]
    UnknownDomain(String),

    /// A domain holds no samples so no batch can be drawn from it.
    #[error("Domain `{0}` has no samples")]
    EmptyDomain(String),

    /// The synthetic generator was configured with an unusable value.
    #[error("Invalid dataset setting `{field}`: {reason}")]
    InvalidSetting {
        /// Name of the setting.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

impl DatasetError {
    /// Construct a [`DatasetError::InvalidSetting`].
    pub fn invalid_setting<S: Into<String>>(field: &'static str, reason: S) -> Self {
        DatasetError::InvalidSetting { field, reason: reason.into() }
    }
}
