//! # mmWave CDAN Training
//!
//! Conditional domain-adversarial training (CDAN) for mmWave radar gesture
//! classifiers. A labelled source domain and one unlabelled target domain
//! (later recording days, or a different room) are trained jointly: the
//! classifier learns on source labels while a domain discriminator, fed the
//! features conditioned on the class predictions, is fooled through a
//! gradient reversal layer.
//!
//! ## Architecture
//!
//! ```text
//! TrainingConfig ──► TrainingSession ──► CdanModel
//!       │                  │                ├─ Backbone (bottleneck CNN)
//!       │            TrainStream ×2         ├─ ClassifierHead (linear | cosine)
//!       │                  │                └─ DomainDiscriminator (GRL + MLP)
//!       │           dataset::prepare
//!       │                  │
//!       │        RadarSource (NpyDataset | SyntheticDataset)
//!       │
//!       └──► losses / margin / schedule / metrics / checkpoint / summary
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mmwave_train::config::TrainingConfig;
//! use mmwave_train::dataset::{prepare, SyntheticConfig, SyntheticDataset};
//! use mmwave_train::trainer::TrainingSession;
//!
//! let mut config = TrainingConfig::default();
//! config.epochs = 10;
//! config.validate().expect("config is valid");
//!
//! let source = SyntheticDataset::new(SyntheticConfig::default());
//! let data = prepare(&source, &config).expect("data prepared");
//! let summary = TrainingSession::new(config, data)
//!     .and_then(|mut session| session.run())
//!     .expect("training completes");
//! println!("{} steps", summary.steps);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod augment;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod eval;
pub mod losses;
pub mod margin;
pub mod metrics;
pub mod model;
pub mod schedule;
pub mod summary;
pub mod trainer;

// Convenient re-exports at the crate root.
pub use config::{Method, TrainingConfig};
pub use dataset::{NpyDataset, PreparedData, RadarDataset, RadarSource, SyntheticConfig, SyntheticDataset};
pub use error::{ConfigError, DatasetError, TrainError, TrainResult};
pub use model::{AdversarialModel, CdanModel};
pub use trainer::{TrainingSession, TrainingSummary};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
