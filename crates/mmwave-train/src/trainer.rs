//! Training loop orchestrator.
//!
//! [`TrainingSession`] owns every piece of mutable training state: the model
//! and its optimizer, the annealing state, the running metrics, the
//! checkpoint manager and the scalar stream. It is the single writer of all
//! of them.
//!
//! # Epoch structure
//!
//! ```text
//! for epoch in start..epochs:
//!     m_anneal, hp_lambda  ← AnnealSchedule(epoch)
//!     for (src, tgt) in zip(source, target).take(min(len_s, len_t)):
//!         train_step(src, tgt)
//!     if epoch % 5 == 0 or last epoch:
//!         evaluate target context, log scalars
//!     reset accuracy accumulators
//!     periodic checkpoint
//! final checkpoint
//! ```

use std::path::PathBuf;
use tch::{nn, nn::OptimizerConfig, Tensor};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointManager, CheckpointState};
use crate::config::{TrainingConfig, EVAL_EVERY_EPOCHS, MAX_CHECKPOINTS};
use crate::dataset::{Batch, EvalStream, PreparedData, TrainStream};
use crate::error::{DatasetError, TrainError, TrainResult};
use crate::eval::{evaluate_stream, EvalReport};
use crate::losses::{CdanLoss, LossComponents};
use crate::margin::AngularMargin;
use crate::metrics::{CategoricalAccuracy, MetricsSnapshot, TrainMetrics};
use crate::model::{AdversarialModel, CdanModel};
use crate::schedule::{AnnealSchedule, PolynomialDecay};
use crate::summary::ScalarWriter;

/// Offset added to the seed of the target stream so the two streams do not
/// share a permutation.
const TARGET_SEED_OFFSET: u64 = 0x5DEE_CE66;

/// One evaluation recorded by [`TrainingSession::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct EpochEvaluation {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Accuracy on the active target context's held-out set.
    pub target_accuracy: f64,
    /// Source training accuracy over the batches of this epoch.
    pub source_train_acc: f64,
}

/// Outcome of [`TrainingSession::run`].
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Optimizer steps taken by this run.
    pub steps: u64,
    /// Paired batches per epoch.
    pub batches_per_epoch: usize,
    /// Epochs run by this call.
    pub epochs_completed: usize,
    /// One entry per evaluated epoch.
    pub evaluations: Vec<EpochEvaluation>,
    /// Metrics of the final epoch, read before its accuracy reset.
    pub final_metrics: MetricsSnapshot,
    /// Weights paths of the checkpoints written by this run.
    pub checkpoints: Vec<PathBuf>,
}

/// A complete CDAN training run.
pub struct TrainingSession {
    config: TrainingConfig,
    data: PreparedData,
    model: CdanModel,
    optimizer: nn::Optimizer,
    loss: CdanLoss,
    margin: Option<AngularMargin>,
    anneal: AnnealSchedule,
    lr_schedule: PolynomialDecay,
    source: TrainStream,
    target: TrainStream,
    metrics: TrainMetrics,
    m_anneal: f64,
    hp_lambda: f64,
    learning_rate: f64,
    global_step: u64,
    start_epoch: usize,
    checkpoints: Option<CheckpointManager>,
    scalars: ScalarWriter,
}

impl TrainingSession {
    /// Build the model, optimizer and streams for `data`, create the run
    /// directory and write `config.json` into it.
    ///
    /// # Errors
    ///
    /// Fails when the config is invalid, when the source stream cannot yield
    /// one full batch, or on run-directory I/O errors.
    pub fn new(config: TrainingConfig, data: PreparedData) -> TrainResult<Self> {
        config.validate()?;
        tch::manual_seed(config.seed as i64);

        let num_classes = config.num_classes;
        let source = TrainStream::new(
            "source",
            data.source_train.clone(),
            num_classes,
            config.batch_size,
            config.src_aug > 0,
            config.seed,
        );
        if source.num_batches() == 0 {
            return Err(DatasetError::EmptyStream {
                stream: source.name().to_string(),
                samples: source.len(),
                batch_size: config.batch_size,
            }
            .into());
        }
        let target = TrainStream::new(
            "target",
            data.target_train.clone(),
            num_classes,
            config.batch_size,
            config.trgt_aug > 0,
            config.seed.wrapping_add(TARGET_SEED_OFFSET),
        );
        if target.num_batches() == 0 {
            warn!(
                "Target stream has {} samples, fewer than one batch of {}; epochs will take no steps",
                target.len(),
                config.batch_size
            );
        }

        let (_, _, channels) = data.image_shape();
        let model = CdanModel::from_config(&config, channels);
        let optimizer = nn::Adam::default().build(model.var_store(), config.init_lr)?;

        let run_dir = config.run_dir();
        config.to_json(&run_dir.join("config.json"))?;
        let checkpoints = if config.save_freq > 0 {
            Some(CheckpointManager::new(config.checkpoint_dir(), MAX_CHECKPOINTS)?)
        } else {
            None
        };
        let scalars = ScalarWriter::create(&config.summary_dir())?;

        info!(
            "Session: method={} params={} run_dir={}",
            config.method,
            model.num_parameters(),
            run_dir.display()
        );

        Ok(TrainingSession {
            loss: CdanLoss::new(config.dm_lambda),
            margin: config.method.uses_angular_margin().then(|| AngularMargin::new(config.s, 0.0)),
            anneal: AnnealSchedule::from_config(&config),
            lr_schedule: PolynomialDecay::from_config(&config, source.num_batches()),
            learning_rate: config.init_lr,
            config,
            data,
            model,
            optimizer,
            source,
            target,
            metrics: TrainMetrics::new(),
            m_anneal: 0.0,
            hp_lambda: 0.0,
            global_step: 0,
            start_epoch: 0,
            checkpoints,
            scalars,
        })
    }

    /// Resolved configuration of the run.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Model being trained.
    pub fn model(&self) -> &CdanModel {
        &self.model
    }

    /// Running metrics.
    pub fn metrics(&self) -> &TrainMetrics {
        &self.metrics
    }

    /// Optimizer steps taken, including restored ones.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Current `(m_anneal, hp_lambda)`.
    pub fn anneal_state(&self) -> (f64, f64) {
        (self.m_anneal, self.hp_lambda)
    }

    /// Paired batches per epoch: `min(source, target)`.
    pub fn batches_per_epoch(&self) -> usize {
        self.source.num_batches().min(self.target.num_batches())
    }

    /// Set the annealed hyper-parameters for `epoch`.
    pub fn begin_epoch(&mut self, epoch: usize) {
        self.m_anneal = self.anneal.m_anneal(epoch);
        self.hp_lambda = self.anneal.hp_lambda(epoch);
        if let Some(margin) = self.margin.as_mut() {
            margin.m = self.m_anneal;
        }
    }

    // -----------------------------------------------------------------------
    // Training step
    // -----------------------------------------------------------------------

    /// One optimizer update on a paired source/target batch.
    ///
    /// Target labels are ignored. Batches whose `[H, W, C]` differ and
    /// non-finite losses are reported before any gradient is applied.
    pub fn train_step(&mut self, src: &Batch, tgt: &Batch) -> TrainResult<LossComponents> {
        let (src_shape, tgt_shape) = (&src.images.shape()[1..], &tgt.images.shape()[1..]);
        if src_shape != tgt_shape {
            let dims = |s: &[usize]| s.iter().map(|&d| d as i64).collect();
            return Err(TrainError::shape_mismatch(dims(src_shape), dims(tgt_shape)));
        }

        let device = self.model.device();
        let (src_images, src_labels) = src.to_tensors(device);
        let (tgt_images, _) = tgt.to_tensors(device);

        let src_out = self.model.forward_t(&src_images, true, self.hp_lambda);
        let tgt_out = self.model.forward_t(&tgt_images, true, self.hp_lambda);

        let src_logits = match &self.margin {
            Some(margin) => margin.apply(&src_labels, &src_out.logits),
            None => src_out.logits.shallow_clone(),
        };
        let domain_logits = Tensor::cat(&[&src_out.domain_logits, &tgt_out.domain_logits], 0);
        let weight = match (&src_out.weight, &tgt_out.weight) {
            (Some(ws), Some(wt)) => Some(Tensor::cat(&[ws, wt], 0)),
            _ => None,
        };

        let n_src = src.len() as i64;
        let (total, parts) =
            self.loss.forward(&src_labels, &src_logits, &domain_logits, n_src, weight.as_ref());
        if !parts.total.is_finite() {
            return Err(TrainError::NonFiniteLoss { step: self.global_step, value: parts.total });
        }

        self.learning_rate = self.lr_schedule.lr(self.global_step);
        self.optimizer.set_lr(self.learning_rate);
        self.optimizer.zero_grad();
        total.f_backward()?;
        self.optimizer.step();
        self.global_step += 1;

        self.metrics
            .source_train_acc
            .update(&src_labels, &src_logits.detach().softmax(-1, tch::Kind::Float));
        self.metrics.classification_loss.update(parts.classification);
        self.metrics.domain_loss.update(parts.domain);

        Ok(parts)
    }

    /// Run the paired steps of `epoch`. Returns the number of steps taken.
    pub fn run_epoch(&mut self, epoch: usize) -> TrainResult<usize> {
        self.begin_epoch(epoch);
        let batches = self.batches_per_epoch();
        let pairs = self.source.epoch(epoch).zip(self.target.epoch(epoch)).take(batches);

        let mut steps = 0;
        for (src, tgt) in pairs {
            let parts = self.train_step(&src, &tgt)?;
            steps += 1;
            if steps % 50 == 0 {
                debug!(
                    "[epoch {epoch} step {steps}/{batches}] loss={:.5} cls={:.5} dom={:.5} lr={:.3e}",
                    parts.total, parts.classification, parts.domain, self.learning_rate
                );
            }
        }
        Ok(steps)
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Evaluate the active target context, feeding `target_test_acc`.
    pub fn evaluate_target(&mut self) -> EvalReport {
        let stream = EvalStream::new(&self.data.target_eval, self.config.num_classes, self.config.batch_size);
        evaluate_stream(&self.model, &stream, self.config.num_classes, &mut self.metrics.target_test_acc)
    }

    /// Evaluate the held-out source split without touching the accumulators.
    pub fn evaluate_source(&self) -> EvalReport {
        let stream = EvalStream::new(&self.data.source_test, self.config.num_classes, self.config.batch_size);
        evaluate_stream(&self.model, &stream, self.config.num_classes, &mut CategoricalAccuracy::new())
    }

    fn log_epoch(&mut self, epoch: usize) -> TrainResult<EpochEvaluation> {
        let report = self.evaluate_target();
        let snap = self.metrics.snapshot();
        let step = epoch as u64;
        let tag = self.data.context.scalar_name();

        self.scalars.scalar(&tag, snap.target_test_acc, step)?;
        self.scalars.scalar("source_train_acc", snap.source_train_acc, step)?;
        self.scalars.scalar("cross_entropy_loss", snap.classification_loss, step)?;
        self.scalars.scalar("domain_loss", snap.domain_loss, step)?;

        info!(
            "[{}/{}] {tag}={:.4} {}  lambda={:.3} m={:.3}",
            epoch + 1,
            self.config.epochs,
            report.accuracy,
            snap.summary(),
            self.hp_lambda,
            self.m_anneal
        );
        Ok(EpochEvaluation {
            epoch,
            target_accuracy: snap.target_test_acc,
            source_train_acc: snap.source_train_acc,
        })
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Save a checkpoint after `epochs_done` epochs. No-op without a manager.
    pub fn save_checkpoint(&mut self, epochs_done: usize) -> TrainResult<Option<PathBuf>> {
        let state = CheckpointState {
            index: 0,
            epoch: epochs_done,
            global_step: self.global_step,
            learning_rate: self.learning_rate,
            m_anneal: self.m_anneal,
            hp_lambda: self.hp_lambda,
            method: self.config.method,
        };
        match self.checkpoints.as_mut() {
            Some(mgr) => {
                let path = mgr.save(&self.model, state)?;
                info!("Saved checkpoint for epoch {epochs_done} at {}", path.display());
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    /// Load the newest checkpoint, if any, and resume after its epoch.
    pub fn restore_latest(&mut self) -> TrainResult<Option<CheckpointState>> {
        let Some(mgr) = self.checkpoints.as_ref() else { return Ok(None) };
        let Some(path) = mgr.latest()? else { return Ok(None) };
        let state = mgr.restore(&mut self.model, &path)?;
        if state.method != self.config.method {
            return Err(TrainError::checkpoint(
                format!("checkpoint was trained with {}, config uses {}", state.method, self.config.method),
                path,
            ));
        }
        self.global_step = state.global_step;
        self.learning_rate = state.learning_rate;
        self.start_epoch = state.epoch;
        info!("Restored {} (epoch {}, step {})", path.display(), state.epoch, state.global_step);
        Ok(Some(state))
    }

    // -----------------------------------------------------------------------
    // Full run
    // -----------------------------------------------------------------------

    /// Train for the configured number of epochs.
    pub fn run(&mut self) -> TrainResult<TrainingSummary> {
        let epochs = self.config.epochs;
        let batches_per_epoch = self.batches_per_epoch();
        let first_step = self.global_step;
        let mut evaluations = Vec::new();
        let mut checkpoints = Vec::new();
        let mut final_metrics = self.metrics.snapshot();
        let mut saved_last_epoch = false;

        info!(
            "Training epochs {}..{epochs}: {batches_per_epoch} batches/epoch (source {}, target {})",
            self.start_epoch,
            self.source.num_batches(),
            self.target.num_batches()
        );

        for epoch in self.start_epoch..epochs {
            self.run_epoch(epoch)?;

            if epoch % EVAL_EVERY_EPOCHS == 0 || epoch == epochs - 1 {
                evaluations.push(self.log_epoch(epoch)?);
            }

            final_metrics = self.metrics.snapshot();
            self.metrics.end_epoch();

            saved_last_epoch = false;
            let save_freq = self.config.save_freq;
            if save_freq > 0 && (epoch + 1) % save_freq == 0 {
                checkpoints.extend(self.save_checkpoint(epoch + 1)?);
                saved_last_epoch = true;
            }
        }

        let ran_epochs = self.start_epoch < epochs;
        if self.config.save_freq != 0 && ran_epochs && !saved_last_epoch {
            checkpoints.extend(self.save_checkpoint(epochs)?);
        }

        Ok(TrainingSummary {
            steps: self.global_step - first_step,
            batches_per_epoch,
            epochs_completed: epochs.saturating_sub(self.start_epoch),
            evaluations,
            final_metrics,
            checkpoints,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
