//! Additive angular-margin transform for cosine logits.
//!
//! ```text
//! am_logits = s · (cos θ − m · y)
//! ```
//!
//! `y` is the one-hot label, so only the ground-truth class cosine is pushed
//! down by `m` before the softmax. The classifier has to beat every other
//! class by at least `m` in cosine space to reach the same loss, which
//! tightens the class clusters on the hypersphere.

use tch::{Kind, Tensor};

/// Scale `s` and margin `m` of the angular-margin softmax.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngularMargin {
    /// Logit scale.
    pub s: f64,
    /// Additive cosine margin.
    pub m: f64,
}

impl AngularMargin {
    /// Margin with scale `s` and margin `m`.
    pub fn new(s: f64, m: f64) -> Self {
        AngularMargin { s, m }
    }

    /// Transform `cos_logits` `[B, K]` for one-hot `labels` `[B, K]`.
    pub fn apply(&self, labels: &Tensor, cos_logits: &Tensor) -> Tensor {
        am_logits(labels, cos_logits, self.m, self.s)
    }
}

/// `s · (cos_logits − m · labels)`.
///
/// `labels` must be one-hot with the same shape as `cos_logits`.
pub fn am_logits(labels: &Tensor, cos_logits: &Tensor, m: f64, s: f64) -> Tensor {
    let margin = labels.to_kind(Kind::Float) * m;
    (cos_logits - margin) * s
}
