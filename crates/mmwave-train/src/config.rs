//! Training configuration for CDAN domain adaptation.
//!
//! [`TrainingConfig`] is the single source of truth for all hyper-parameters,
//! data-split settings and infrastructure paths used throughout the training
//! pipeline. It is serializable via [`serde`] so the resolved configuration of
//! every run can be persisted next to its checkpoints.
//!
//! # Example
//!
//! ```rust
//! use mmwave_train::config::{Method, TrainingConfig};
//!
//! let cfg = TrainingConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.method, Method::Cdan);
//! assert_eq!(cfg.num_domains(), 2);
//! ```

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Run an evaluation pass every this many epochs (and on the final epoch).
pub const EVAL_EVERY_EPOCHS: usize = 5;

/// Number of checkpoints retained in the checkpoint directory.
pub const MAX_CHECKPOINTS: usize = 5;

// ---------------------------------------------------------------------------
// Method
// ---------------------------------------------------------------------------

/// Adversarial training variant.
///
/// The `-E` variants weight the domain loss by prediction confidence
/// (entropy conditioning); the `_AMCA` variants train the classifier with an
/// additive angular margin on cosine logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum Method {
    /// Plain conditional adversarial training.
    #[serde(rename = "CDAN")]
    #[value(name = "CDAN")]
    Cdan,
    /// CDAN with entropy conditioning.
    #[serde(rename = "CDAN-E")]
    #[value(name = "CDAN-E")]
    CdanE,
    /// CDAN with an angular-margin classifier.
    #[serde(rename = "CDAN_AMCA")]
    #[value(name = "CDAN_AMCA")]
    CdanAmca,
    /// CDAN with entropy conditioning and an angular-margin classifier.
    #[serde(rename = "CDAN-E_AMCA")]
    #[value(name = "CDAN-E_AMCA")]
    CdanEAmca,
}

impl Method {
    /// `true` when the domain loss is weighted by `1 + exp(-entropy)`.
    pub fn uses_entropy(self) -> bool {
        matches!(self, Method::CdanE | Method::CdanEAmca)
    }

    /// `true` when source logits go through the angular-margin transform.
    pub fn uses_angular_margin(self) -> bool {
        matches!(self, Method::CdanAmca | Method::CdanEAmca)
    }

    /// Canonical command-line spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Cdan => "CDAN",
            Method::CdanE => "CDAN-E",
            Method::CdanAmca => "CDAN_AMCA",
            Method::CdanEAmca => "CDAN-E_AMCA",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Non-linearity used throughout the backbone and the discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Scaled exponential linear unit.
    Selu,
    /// Rectified linear unit.
    Relu,
    /// Exponential linear unit.
    Elu,
    /// Gaussian error linear unit.
    Gelu,
    /// Hyperbolic tangent.
    Tanh,
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Activation::Selu => "selu",
            Activation::Relu => "relu",
            Activation::Elu => "elu",
            Activation::Gelu => "gelu",
            Activation::Tanh => "tanh",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// TargetContext
// ---------------------------------------------------------------------------

/// The target distribution the run adapts to and evaluates on.
///
/// Exactly one context is active per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetContext {
    /// Held-out third of the active target's training data (`--val`).
    Validation,
    /// Later recording days of the source site.
    Time(usize),
    /// The server-room site.
    Server(usize),
    /// The conference-room site.
    Conference(usize),
    /// The office site.
    Office(usize),
}

impl TargetContext {
    /// Scalar tag used for the target accuracy in the summary stream.
    pub fn scalar_name(&self) -> String {
        match self {
            TargetContext::Validation => "val".to_string(),
            TargetContext::Time(d) => format!("time test acc{d}"),
            TargetContext::Server(d) => format!("server test acc{d}"),
            TargetContext::Conference(d) => format!("conference test acc{d}"),
            TargetContext::Office(d) => format!("office test acc{d}"),
        }
    }
}

// ---------------------------------------------------------------------------
// TrainingConfig
// ---------------------------------------------------------------------------

/// Complete configuration for a CDAN training run.
///
/// Use [`TrainingConfig::default()`] as a starting point, then override
/// individual fields as needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // -----------------------------------------------------------------------
    // Data
    // -----------------------------------------------------------------------
    /// Directory holding `source_data/` and the `target_*_data/` sets.
    pub data_dir: PathBuf,

    /// Number of gesture classes. Default: **10**.
    pub num_classes: usize,

    /// Recording days used as the labelled source domain. Default: **3**.
    pub train_src_days: usize,

    /// Later source-site days used as the unlabelled time-shifted target.
    /// Default: **1**.
    pub train_trg_days: usize,

    /// Server-site days used as the target. Default: **0**.
    pub train_ser_days: usize,

    /// Conference-site days used as the target. Default: **0**.
    pub train_con_days: usize,

    /// Office-site days used as the target. Default: **0**.
    pub train_off_days: usize,

    /// Evaluate on a stratified third of the target training data instead of
    /// the target test days. Default: **false**.
    pub val: bool,

    /// Augment source batches when > 0. Default: **0**.
    pub src_aug: usize,

    /// Augment target batches when > 0. Default: **0**.
    pub trgt_aug: usize,

    /// Cap on target samples kept per class and per day.
    pub target_max: Option<usize>,

    /// Number of leading source days kept by class balancing. Default: **10**.
    pub balance_days: usize,

    /// Per-class, per-day sample cap applied by class balancing. Default: **95**.
    pub max_samples_per_class: usize,

    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// Adversarial variant. Default: **CDAN**.
    pub method: Method,

    /// Embedding width produced by the backbone. Default: **128**.
    pub num_features: usize,

    /// Base filter count of the backbone. Default: **64**.
    pub model_filters: usize,

    /// Non-linearity of the backbone and discriminator. Default: **selu**.
    pub activation_fn: Activation,

    /// Hidden width of the domain discriminator. Default: **128**.
    pub disc_hidden: usize,

    /// Dropout applied before the embedding layer. Default: **0.0**.
    pub dropout_rate: f64,

    /// Bottleneck blocks per backbone stage. Default: **[3, 4, 6, 3]**.
    pub block_layout: Vec<usize>,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Number of training epochs. Default: **10000**.
    pub epochs: usize,

    /// Initial Adam learning rate. Default: **1e-3**.
    pub init_lr: f64,

    /// Mini-batch size for every stream. Default: **64**.
    pub batch_size: usize,

    /// Annealing divisor: the ramps saturate after `epochs / anneal` epochs.
    /// Default: **4**.
    pub anneal: usize,

    /// Angular-margin logit scale. Default: **10**.
    pub s: f64,

    /// Angular-margin cap reached at the end of the ramp. Default: **0.2**.
    pub m: f64,

    /// Weight of the domain loss in the total loss. Default: **0.1**.
    pub dm_lambda: f64,

    /// Epochs per learning-rate decay cycle. Default: **200**.
    pub lr_decay_epochs: usize,

    /// Final learning rate of a decay cycle as a fraction of `init_lr`.
    /// Default: **0.01**.
    pub lr_end_factor: f64,

    // -----------------------------------------------------------------------
    // Checkpointing and logging
    // -----------------------------------------------------------------------
    /// Save a checkpoint every N epochs; 0 disables checkpointing.
    /// Default: **25**.
    pub save_freq: usize,

    /// Checkpoint sub-directory of the run directory.
    pub checkpoint_path: PathBuf,

    /// Scalar-summary sub-directory of the run directory.
    pub summary_writer_path: PathBuf,

    /// Parent directory of all run directories.
    pub log_dir: PathBuf,

    /// Free-form notes recorded in the run name and config.
    pub notes: String,

    // -----------------------------------------------------------------------
    // Device / reproducibility
    // -----------------------------------------------------------------------
    /// Train on a CUDA device. Default: **false**.
    pub use_gpu: bool,

    /// CUDA device index when `use_gpu` is `true`. Default: **0**.
    pub gpu_device_id: usize,

    /// Seed for parameter initialisation, shuffles, splits and augmentation.
    /// Default: **42**.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            // Data
            data_dir: PathBuf::from("data"),
            num_classes: 10,
            train_src_days: 3,
            train_trg_days: 1,
            train_ser_days: 0,
            train_con_days: 0,
            train_off_days: 0,
            val: false,
            src_aug: 0,
            trgt_aug: 0,
            target_max: None,
            balance_days: 10,
            max_samples_per_class: 95,
            // Model
            method: Method::Cdan,
            num_features: 128,
            model_filters: 64,
            activation_fn: Activation::Selu,
            disc_hidden: 128,
            dropout_rate: 0.0,
            block_layout: vec![3, 4, 6, 3],
            // Optimisation
            epochs: 10000,
            init_lr: 1e-3,
            batch_size: 64,
            anneal: 4,
            s: 10.0,
            m: 0.2,
            dm_lambda: 0.1,
            lr_decay_epochs: 200,
            lr_end_factor: 1e-2,
            // Checkpointing / logging
            save_freq: 25,
            checkpoint_path: PathBuf::from("checkpoints"),
            summary_writer_path: PathBuf::from("tensorboard_logs"),
            log_dir: PathBuf::from("logs/Baselines/CDAN"),
            notes: String::new(),
            // Device
            use_gpu: false,
            gpu_device_id: 0,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Load a [`TrainingConfig`] from a JSON file at `path`.
    ///
    /// Missing fields take their default values. The result is validated.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed, and
    /// [`ConfigError::InvalidValue`] if validation fails.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Self::read_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a configuration file without validating it.
    ///
    /// Used when further overrides are applied before [`validate`] runs.
    ///
    /// [`validate`]: TrainingConfig::validate
    pub fn read_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents)
            .map_err(|source| ConfigError::ParseError { path: path.to_path_buf(), source })
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Number of domains present in training: the source plus every target
    /// set with at least one training day.
    pub fn num_domains(&self) -> usize {
        [
            self.train_src_days,
            self.train_trg_days,
            self.train_ser_days,
            self.train_con_days,
            self.train_off_days,
        ]
        .iter()
        .filter(|&&d| d > 0)
        .count()
    }

    /// The active target context, or `None` when no target has training days.
    pub fn target_context(&self) -> Option<TargetContext> {
        if self.num_active_targets() == 0 {
            return None;
        }
        if self.val {
            return Some(TargetContext::Validation);
        }
        if self.train_trg_days > 0 {
            Some(TargetContext::Time(self.train_trg_days))
        } else if self.train_ser_days > 0 {
            Some(TargetContext::Server(self.train_ser_days))
        } else if self.train_con_days > 0 {
            Some(TargetContext::Conference(self.train_con_days))
        } else {
            Some(TargetContext::Office(self.train_off_days))
        }
    }

    fn num_active_targets(&self) -> usize {
        [self.train_trg_days, self.train_ser_days, self.train_con_days, self.train_off_days]
            .iter()
            .filter(|&&d| d > 0)
            .count()
    }

    /// The tch device selected by `use_gpu` / `gpu_device_id`.
    pub fn device(&self) -> tch::Device {
        if self.use_gpu {
            tch::Device::Cuda(self.gpu_device_id)
        } else {
            tch::Device::Cpu
        }
    }

    /// Name of this run's directory, built from the identifying
    /// hyper-parameters as `key:value` pairs joined by `-`.
    ///
    /// Infrastructure settings (paths, learning rate, widths, batch size)
    /// are left out so that reruns with the same experimental setup land in
    /// the same directory.
    pub fn run_name(&self) -> String {
        let target_max = match self.target_max {
            Some(n) => n.to_string(),
            None => "None".to_string(),
        };
        let pairs: [(&str, String); 15] = [
            ("epochs", self.epochs.to_string()),
            ("train_src_days", self.train_src_days.to_string()),
            ("train_trg_days", self.train_trg_days.to_string()),
            ("train_ser_days", self.train_ser_days.to_string()),
            ("train_con_days", self.train_con_days.to_string()),
            ("train_off_days", self.train_off_days.to_string()),
            ("val", python_bool(self.val).to_string()),
            ("src_aug", self.src_aug.to_string()),
            ("trgt_aug", self.trgt_aug.to_string()),
            ("method", self.method.to_string()),
            ("trgt_max", target_max),
            ("m", self.m.to_string()),
            ("dm_lambda", self.dm_lambda.to_string()),
            ("disc_hidden", self.disc_hidden.to_string()),
            ("notes", sanitize_notes(&self.notes)),
        ];
        pairs
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join("-")
    }

    /// `<log_dir>/<run_name>`.
    pub fn run_dir(&self) -> PathBuf {
        self.log_dir.join(self.run_name())
    }

    /// Directory receiving checkpoints for this run.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run_dir().join(&self.checkpoint_path)
    }

    /// Directory receiving the scalar summary stream for this run.
    pub fn summary_dir(&self) -> PathBuf {
        self.run_dir().join(&self.summary_writer_path)
    }

    /// Validate all fields and return an error describing the first problem
    /// found, or `Ok(())` if the configuration is coherent.
    ///
    /// # Validated invariants
    ///
    /// - Class, feature, filter and hidden widths are non-zero.
    /// - `block_layout` is non-empty with non-zero entries.
    /// - `epochs`, `batch_size` and `anneal` are non-zero.
    /// - `init_lr` is strictly positive, `lr_end_factor` is in `(0, 1]`.
    /// - `m` is in `[0, 1)`, `s` is strictly positive, `dm_lambda >= 0`.
    /// - `dropout_rate` is in `[0, 1)`.
    /// - Source days are non-zero and exactly one target set has days.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_classes < 2 {
            return Err(ConfigError::invalid_value("num_classes", "must be >= 2"));
        }
        if self.num_features == 0 {
            return Err(ConfigError::invalid_value("num_features", "must be > 0"));
        }
        if self.model_filters == 0 {
            return Err(ConfigError::invalid_value("model_filters", "must be > 0"));
        }
        if self.disc_hidden == 0 {
            return Err(ConfigError::invalid_value("disc_hidden", "must be > 0"));
        }
        if self.block_layout.is_empty() || self.block_layout.contains(&0) {
            return Err(ConfigError::invalid_value(
                "block_layout",
                "must list at least one stage, each with >= 1 block",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(ConfigError::invalid_value("dropout_rate", "must be in [0.0, 1.0)"));
        }

        // Optimisation
        if self.epochs == 0 {
            return Err(ConfigError::invalid_value("epochs", "must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        if self.anneal == 0 {
            return Err(ConfigError::invalid_value("anneal", "must be > 0"));
        }
        if self.init_lr <= 0.0 {
            return Err(ConfigError::invalid_value("init_lr", "must be > 0.0"));
        }
        if self.lr_end_factor <= 0.0 || self.lr_end_factor > 1.0 {
            return Err(ConfigError::invalid_value("lr_end_factor", "must be in (0.0, 1.0]"));
        }
        if self.lr_decay_epochs == 0 {
            return Err(ConfigError::invalid_value("lr_decay_epochs", "must be > 0"));
        }
        if self.s <= 0.0 {
            return Err(ConfigError::invalid_value("s", "must be > 0.0"));
        }
        if !(0.0..1.0).contains(&self.m) {
            return Err(ConfigError::invalid_value("m", "must be in [0.0, 1.0)"));
        }
        if self.dm_lambda < 0.0 {
            return Err(ConfigError::invalid_value("dm_lambda", "must be >= 0.0"));
        }

        // Domains
        if self.train_src_days == 0 {
            return Err(ConfigError::invalid_value("train_src_days", "must be > 0"));
        }
        match self.num_active_targets() {
            1 => {}
            0 => {
                return Err(ConfigError::invalid_value(
                    "train_trg_days / train_ser_days / train_con_days / train_off_days",
                    "one target set must have training days",
                ))
            }
            _ => {
                return Err(ConfigError::invalid_value(
                    "train_trg_days / train_ser_days / train_con_days / train_off_days",
                    "target sets are mutually exclusive; set exactly one",
                ))
            }
        }
        if self.target_max == Some(0) {
            return Err(ConfigError::invalid_value("target_max", "must be > 0 when set"));
        }
        if self.max_samples_per_class == 0 || self.balance_days == 0 {
            return Err(ConfigError::invalid_value(
                "max_samples_per_class / balance_days",
                "must be > 0",
            ));
        }

        Ok(())
    }
}

/// Notes as a single path component: spaces dropped, separators replaced.
fn sanitize_notes(notes: &str) -> String {
    notes
        .chars()
        .filter(|c| *c != ' ')
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

fn python_bool(b: bool) -> &'static str {
    if b {
        "True"
    } else {
        "False"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
