//! Error types for the CDAN training pipeline.
//!
//! Every module that produces an error imports its error type from here
//! rather than defining it inline.
//!
//! ## Hierarchy
//!
//! ```text
//! TrainError (top-level)
//! ├── ConfigError   (config validation / file loading)
//! ├── DatasetError  (data loading, splitting, batching)
//! └── tch::TchError (tensor engine failures)
//! ```

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TrainResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type TrainResult<T> = Result<T, TrainError>;

// ---------------------------------------------------------------------------
// TrainError: top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for the training pipeline.
///
/// Orchestration-level functions (e.g. [`crate::trainer::TrainingSession`]
/// methods) return `TrainResult<T>`. Lower-level functions in
/// [`crate::config`] and [`crate::dataset`] return their own module-specific
/// error types which are coerced into `TrainError` via [`From`].
#[derive(Debug, Error)]
pub enum TrainError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A dataset loading or access error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// The tensor engine rejected an operation (shape, device, autograd).
    #[error("Tensor engine error: {0}")]
    Tch(#[from] tch::TchError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O failure outside dataset loading (summaries, run directory).
    #[error("I/O error at `{path}`: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The total loss of a training step was NaN or infinite.
    ///
    /// Raised before the optimizer steps, so parameters are left untouched.
    #[error("Non-finite loss {value} at step {step}")]
    NonFiniteLoss {
        /// Global step index at which the loss diverged.
        step: u64,
        /// The offending loss value.
        value: f64,
    },

    /// Source and target batches of one step disagree on `[H, W, C]`.
    #[error("Shape mismatch: source images are {expected:?}, target images are {actual:?}")]
    ShapeMismatch {
        /// Per-sample shape of the source images.
        expected: Vec<i64>,
        /// Per-sample shape of the target images.
        actual: Vec<i64>,
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

    /// Construct a [`TrainError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io { path: path.into(), source }
    }

    /// Construct a [`TrainError::ShapeMismatch`].
    pub fn shape_mismatch(expected: Vec<i64>, actual: Vec<i64>) -> Self {
        TrainError::ShapeMismatch { expected, actual }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`TrainingConfig`].
///
/// [`TrainingConfig`]: crate::config::TrainingConfig
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

/// Errors produced while loading, splitting or batching samples.
///
/// Production training code must not silently suppress these errors. If data
/// is missing, training fails explicitly. The only tolerated gap is an empty
/// target training split, which switches normalization to source statistics
/// (see [`crate::dataset::prepare`]).
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A required data file or directory was not found on disk.
    #[error("Data not found at `{path}`: {message}")]
    DataNotFound {
        /// Path that was expected to contain data.
        path: PathBuf,
        /// Additional context.
        message: String,
    },

    /// A file was found but its format or shape is wrong.
    #[error("Invalid data format in `{path}`: {message}")]
    InvalidFormat {
        /// Path of the malformed file.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// A low-level I/O error while reading a data file.
    #[error("I/O error reading `{path}`: {source}")]
    IoError {
        /// Path being read when the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A numpy array file could not be parsed.
    #[error("NumPy read error in `{path}`: {message}")]
    NpyReadError {
        /// Path of the `.npy` file.
        path: PathBuf,
        /// Error description.
        message: String,
    },

    /// A class name in a target file has no counterpart among source classes.
    #[error("Unknown class `{name}` in `{path}`")]
    UnknownClass {
        /// Offending class name.
        name: String,
        /// File that referenced it.
        path: PathBuf,
    },

    /// A class index is outside `[0, num_classes)`.
    #[error("Label {label} out of range for {num_classes} classes")]
    LabelOutOfRange {
        /// Offending label.
        label: i64,
        /// Number of known classes.
        num_classes: usize,
    },

    /// A training stream cannot yield a single full batch.
    #[error("Stream `{stream}` has {samples} samples, fewer than one batch of {batch_size}")]
    EmptyStream {
        /// Stream name (for logs).
        stream: String,
        /// Number of samples available.
        samples: usize,
        /// Configured batch size.
        batch_size: usize,
    },

    /// Two arrays that must agree on the sample axis do not.
    #[error("Length mismatch: {images} images but {labels} labels")]
    LengthMismatch {
        /// Number of images.
        images: usize,
        /// Number of labels.
        labels: usize,
    },
}

impl DatasetError {
    /// Construct a [`DatasetError::DataNotFound`].
    pub fn not_found<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::DataNotFound { path: path.into(), message: msg.into() }
    }

    /// Construct a [`DatasetError::InvalidFormat`].
    pub fn invalid_format<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::InvalidFormat { path: path.into(), message: msg.into() }
    }

    /// Construct a [`DatasetError::IoError`].
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DatasetError::IoError { path: path.into(), source }
    }

    /// Construct a [`DatasetError::NpyReadError`].
    pub fn npy_read<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::NpyReadError { path: path.into(), message: msg.into() }
    }
}
