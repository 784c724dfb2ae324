//! Loss functions for CDAN training.
//!
//! The total loss couples the source classification loss with the
//! adversarial domain loss:
//!
//! ```text
//! L_total = L_cls + λ_dm · L_dom
//! ```
//!
//! - **Classification loss**: softmax cross-entropy of the (possibly
//!   margin-transformed) source logits against one-hot labels, batch mean.
//! - **Domain loss**: per-sample softmax cross-entropy of the domain logits
//!   against source/target domain labels. Entropy-conditioned methods weight
//!   each sample and normalise by the detached weight sum; the other methods
//!   take the plain mean.
//!
//! Target labels never enter any loss.

use tch::{Device, Kind, Tensor};

/// Domain index of source samples.
pub const SOURCE_DOMAIN: i64 = 0;
/// Domain index of target samples.
pub const TARGET_DOMAIN: i64 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Scalar components of one step's loss, extracted for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossComponents {
    /// `cls + dm_lambda · dom`.
    pub total: f64,
    /// Source classification loss.
    pub classification: f64,
    /// Domain discrimination loss.
    pub domain: f64,
}

/// Combined classification + domain loss.
#[derive(Debug, Clone, Copy)]
pub struct CdanLoss {
    dm_lambda: f64,
}

impl CdanLoss {
    /// Create the loss with domain weight `dm_lambda`.
    pub fn new(dm_lambda: f64) -> Self {
        CdanLoss { dm_lambda }
    }

    /// Compute the differentiable total and its logged components.
    ///
    /// # Arguments
    /// - `labels`: one-hot source labels `[Bs, K]`
    /// - `src_logits`: source logits `[Bs, K]` (after any margin transform)
    /// - `domain_logits`: concatenated source-then-target logits `[Bs+Bt, D]`
    /// - `n_src`: number of leading source rows in `domain_logits`
    /// - `weight`: concatenated entropy weights `[Bs+Bt]`, `None` when unused
    pub fn forward(
        &self,
        labels: &Tensor,
        src_logits: &Tensor,
        domain_logits: &Tensor,
        n_src: i64,
        weight: Option<&Tensor>,
    ) -> (Tensor, LossComponents) {
        let cls = cross_entropy(labels, src_logits);

        let rows = domain_logits.size()[0];
        let num_domains = domain_logits.size()[1];
        let targets =
            domain_labels(n_src, rows - n_src, num_domains, domain_logits.device());
        let dom = match weight {
            Some(w) => weighted_domain_loss(&targets, domain_logits, w),
            None => domain_loss(&targets, domain_logits),
        };

        let total = &cls + &dom * self.dm_lambda;
        let components = LossComponents {
            total: total.double_value(&[]),
            classification: cls.double_value(&[]),
            domain: dom.double_value(&[]),
        };
        (total, components)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Functional API
// ─────────────────────────────────────────────────────────────────────────────

/// Per-sample softmax cross-entropy between one-hot `labels` `[B, K]` and
/// `logits` `[B, K]` → `[B]`.
pub fn per_sample_cross_entropy(labels: &Tensor, logits: &Tensor) -> Tensor {
    let log_probs = logits.log_softmax(-1, Kind::Float);
    -(labels.to_kind(Kind::Float) * log_probs).sum_dim_intlist(&[1_i64][..], false, Kind::Float)
}

/// Batch-mean categorical cross-entropy on one-hot labels.
pub fn cross_entropy(labels: &Tensor, logits: &Tensor) -> Tensor {
    per_sample_cross_entropy(labels, logits).mean(Kind::Float)
}

/// One-hot domain labels: `n_src` source rows then `n_tgt` target rows,
/// `num_domains` columns.
pub fn domain_labels(n_src: i64, n_tgt: i64, num_domains: i64, device: Device) -> Tensor {
    let src = Tensor::full([n_src], SOURCE_DOMAIN, (Kind::Int64, device));
    let tgt = Tensor::full([n_tgt], TARGET_DOMAIN, (Kind::Int64, device));
    Tensor::cat(&[src, tgt], 0)
        .one_hot(num_domains)
        .to_kind(Kind::Float)
}

/// Unweighted domain loss: mean per-sample cross-entropy.
pub fn domain_loss(domain_targets: &Tensor, domain_logits: &Tensor) -> Tensor {
    cross_entropy(domain_targets, domain_logits)
}

/// Entropy-weighted domain loss: `Σ wᵢ·ℓᵢ / detached(Σ wᵢ)`.
///
/// Invariant to a uniform positive rescaling of `weight`.
pub fn weighted_domain_loss(domain_targets: &Tensor, domain_logits: &Tensor, weight: &Tensor) -> Tensor {
    let per_sample = per_sample_cross_entropy(domain_targets, domain_logits);
    let total_weight = weight.sum(Kind::Float).detach();
    (weight * per_sample).sum(Kind::Float) / total_weight
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
