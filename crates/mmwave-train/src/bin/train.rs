//! `train` binary: entry point for CDAN domain-adaptation training.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin train -- --data-dir data --method CDAN-E --train-ser-days 2 --train-trg-days 0
//! cargo run --bin train -- --config run.json --cuda
//! cargo run --bin train -- --dry-run --epochs 3
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use mmwave_train::config::{Activation, Method, TrainingConfig};
use mmwave_train::dataset::{prepare, NpyDataset, RadarSource, SyntheticConfig, SyntheticDataset};
use mmwave_train::trainer::TrainingSession;
use mmwave_train::{ConfigError, TrainResult};

/// Command-line arguments for the training binary.
///
/// Every hyper-parameter flag overrides the corresponding field of the
/// loaded (or default) configuration.
#[derive(Parser, Debug)]
#[command(
    name = "train",
    version,
    about = "CDAN domain-adaptation training for mmWave gesture classifiers",
    long_about = None
)]
struct Args {
    /// Path to a JSON configuration file.
    ///
    /// If not provided, the default `TrainingConfig` is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding `source_data/` and the target data sets.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    init_lr: Option<f64>,

    #[arg(long)]
    num_features: Option<usize>,

    #[arg(long)]
    model_filters: Option<usize>,

    #[arg(long, value_enum)]
    activation_fn: Option<Activation>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    num_classes: Option<usize>,

    #[arg(long)]
    train_src_days: Option<usize>,

    #[arg(long)]
    train_trg_days: Option<usize>,

    #[arg(long)]
    train_ser_days: Option<usize>,

    #[arg(long)]
    train_con_days: Option<usize>,

    #[arg(long)]
    train_off_days: Option<usize>,

    /// Evaluate on a held-out third of the target training data.
    #[arg(long, default_value_t = false)]
    val: bool,

    #[arg(long)]
    src_aug: Option<usize>,

    #[arg(long)]
    trgt_aug: Option<usize>,

    /// Save a checkpoint every N epochs (0 disables checkpoints).
    #[arg(long)]
    save_freq: Option<usize>,

    #[arg(long, value_name = "DIR")]
    checkpoint_path: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    summary_writer_path: Option<PathBuf>,

    #[arg(long)]
    anneal: Option<usize>,

    #[arg(long, value_enum)]
    method: Option<Method>,

    /// Cap on target training samples per class and day.
    #[arg(long)]
    trgt_max: Option<usize>,

    /// Angular-margin logit scale.
    #[arg(long)]
    s: Option<f64>,

    /// Angular-margin cap.
    #[arg(long)]
    m: Option<f64>,

    #[arg(long)]
    dm_lambda: Option<f64>,

    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    disc_hidden: Option<usize>,

    #[arg(long)]
    notes: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Continue from the newest checkpoint of the run directory, if any.
    ///
    /// Weights, global step, learning rate and completed epochs are
    /// restored. Adam moment estimates are not checkpointed and restart
    /// from zero.
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Enable CUDA training (overrides config `use_gpu`).
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Use the deterministic synthetic dataset instead of real data.
    ///
    /// This is intended for pipeline smoke-tests only, not production training.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, cfg: &mut TrainingConfig) {
        macro_rules! set {
            ($($field:ident => $target:ident),* $(,)?) => {
                $(if let Some(v) = self.$field.clone() { cfg.$target = v; })*
            };
        }
        set!(
            data_dir => data_dir,
            epochs => epochs,
            init_lr => init_lr,
            num_features => num_features,
            model_filters => model_filters,
            activation_fn => activation_fn,
            batch_size => batch_size,
            num_classes => num_classes,
            train_src_days => train_src_days,
            train_trg_days => train_trg_days,
            train_ser_days => train_ser_days,
            train_con_days => train_con_days,
            train_off_days => train_off_days,
            src_aug => src_aug,
            trgt_aug => trgt_aug,
            save_freq => save_freq,
            checkpoint_path => checkpoint_path,
            summary_writer_path => summary_writer_path,
            anneal => anneal,
            method => method,
            s => s,
            m => m,
            dm_lambda => dm_lambda,
            log_dir => log_dir,
            disc_hidden => disc_hidden,
            notes => notes,
            seed => seed,
        );
        if self.trgt_max.is_some() {
            cfg.target_max = self.trgt_max;
        }
        if self.val {
            cfg.val = true;
        }
        if self.cuda {
            cfg.use_gpu = true;
        }
    }
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("mmWave CDAN training v{}", mmwave_train::VERSION);

    let config = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!("  method       : {}", config.method);
    info!("  target       : {:?}", config.target_context());
    info!("  batch size   : {}", config.batch_size);
    info!("  learning rate: {}", config.init_lr);
    info!("  epochs       : {}", config.epochs);
    info!("  device       : {}", if config.use_gpu { "GPU" } else { "CPU" });

    let result = if args.dry_run {
        info!("dry run: using synthetic dataset");
        let synth = SyntheticDataset::new(SyntheticConfig {
            num_classes: config.num_classes,
            ..Default::default()
        });
        run(config, &synth, args.resume)
    } else {
        info!("Loading radar data from {}", config.data_dir.display());
        let provider = NpyDataset::new(config.data_dir.clone());
        run(config, &provider, args.resume)
    };

    if let Err(e) = result {
        error!("Training failed: {e}");
        std::process::exit(1);
    }
}

/// Read the config file (or defaults), apply CLI overrides, then validate.
///
/// Validation runs only once, after the overrides, so a file may rely on
/// flags to become coherent.
fn load_config(args: &Args) -> Result<TrainingConfig, ConfigError> {
    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            TrainingConfig::read_json(path)?
        }
        None => TrainingConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn run(config: TrainingConfig, provider: &dyn RadarSource, resume: bool) -> TrainResult<()> {
    let data = prepare(provider, &config)?;
    let mut session = TrainingSession::new(config, data)?;
    if resume {
        session.restore_latest()?;
    }

    let summary = session.run()?;
    info!(
        "Finished: {} steps over {} epochs ({} batches/epoch)",
        summary.steps, summary.epochs_completed, summary.batches_per_epoch
    );
    if let Some(last) = summary.evaluations.last() {
        info!("Last evaluation (epoch {}): target acc {:.4}", last.epoch, last.target_accuracy);
    }
    info!("Source held-out: {}", session.evaluate_source().summary());
    Ok(())
}
