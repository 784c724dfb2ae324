//! Hyper-parameter schedules.
//!
//! - [`AnnealSchedule`]: per-epoch ramps of the gradient-reversal coefficient
//!   and the angular margin.
//! - [`PolynomialDecay`]: per-step learning rate.

use crate::config::TrainingConfig;

// ---------------------------------------------------------------------------
// AnnealSchedule
// ---------------------------------------------------------------------------

/// Linear warm-up of the adversarial strength and the margin.
///
/// ```text
/// ramp(e)     = e / (epochs / anneal)       (real division)
/// hp_lambda(e) = min(ramp(e), 1)
/// m_anneal(e)  = min(m · ramp(e), m)
/// ```
///
/// Both are 0 at epoch 0, non-decreasing, and saturate together once
/// `epoch >= epochs / anneal`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnealSchedule {
    /// Total training epochs.
    pub epochs: usize,
    /// Divisor of `epochs` giving the ramp length.
    pub anneal: usize,
    /// Margin reached at the end of the ramp.
    pub m: f64,
}

impl AnnealSchedule {
    /// Create a schedule. `epochs` and `anneal` must be non-zero.
    pub fn new(epochs: usize, anneal: usize, m: f64) -> Self {
        assert!(epochs > 0 && anneal > 0);
        Self { epochs, anneal, m }
    }

    /// Schedule described by `cfg`.
    pub fn from_config(cfg: &TrainingConfig) -> Self {
        Self::new(cfg.epochs, cfg.anneal, cfg.m)
    }

    /// Number of epochs over which the ramps rise.
    pub fn ramp_epochs(&self) -> f64 {
        self.epochs as f64 / self.anneal as f64
    }

    fn progress(&self, epoch: usize) -> f64 {
        epoch as f64 / self.ramp_epochs()
    }

    /// Gradient-reversal coefficient for `epoch`, in `[0, 1]`.
    pub fn hp_lambda(&self, epoch: usize) -> f64 {
        self.progress(epoch).min(1.0)
    }

    /// Angular margin for `epoch`, in `[0, m]`.
    pub fn m_anneal(&self, epoch: usize) -> f64 {
        (self.m * self.progress(epoch)).min(self.m)
    }
}

// ---------------------------------------------------------------------------
// PolynomialDecay
// ---------------------------------------------------------------------------

/// Polynomial learning-rate decay with cycling.
///
/// ```text
/// horizon = decay_steps · max(1, ceil(step / decay_steps))
/// lr      = (initial − end) · (1 − step / horizon)^power + end
/// ```
///
/// On each cycle the horizon grows by `decay_steps`, so the rate jumps back
/// up after reaching `end` and decays again more slowly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolynomialDecay {
    /// Rate at step 0.
    pub initial: f64,
    /// Floor reached at the end of each cycle.
    pub end: f64,
    /// Steps in the first cycle.
    pub decay_steps: u64,
    /// Polynomial power, `1.0` for linear decay.
    pub power: f64,
}

impl PolynomialDecay {
    /// Schedule from explicit values. `decay_steps` must be non-zero.
    pub fn new(initial: f64, end: f64, decay_steps: u64, power: f64) -> Self {
        assert!(decay_steps > 0);
        Self { initial, end, decay_steps, power }
    }

    /// Linear decay from `init_lr` to `init_lr · lr_end_factor` over
    /// `lr_decay_epochs` epochs of `batches_per_epoch` steps.
    pub fn from_config(cfg: &TrainingConfig, batches_per_epoch: usize) -> Self {
        let steps = (batches_per_epoch.max(1) * cfg.lr_decay_epochs) as u64;
        Self::new(cfg.init_lr, cfg.init_lr * cfg.lr_end_factor, steps, 1.0)
    }

    /// Learning rate at global `step`.
    pub fn lr(&self, step: u64) -> f64 {
        let cycles = if step == 0 { 1 } else { step.div_ceil(self.decay_steps) };
        let horizon = (self.decay_steps * cycles) as f64;
        let frac = 1.0 - step as f64 / horizon;
        (self.initial - self.end) * frac.powf(self.power) + self.end
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
