//! Conditional domain discrimination for CDAN training.
//!
//! Components: [`reverse_gradient`] / [`GradientReversal`],
//! [`multilinear_condition`], [`entropy_weights`] and
//! [`DomainDiscriminator`].
//!
//! Everything here runs inside the tch autograd graph. The discriminator
//! learns to separate source from target on the conditioned features while
//! the reversal operator hands the backbone the negated gradient, pushing it
//! towards domain-invariant features.

use tch::{nn, Kind, Tensor};

use crate::config::Activation;

/// Added inside the logarithm of the entropy to keep `ln(0)` finite.
pub const ENTROPY_EPS: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Gradient reversal
// ---------------------------------------------------------------------------

/// Gradient reversal (Ganin & Lempitsky, ICML 2015).
///
/// Forward: identity, bit-exact. Backward: `-lambda * grad` for `xs`; `lambda`
/// is a plain scalar and receives no gradient.
///
/// `frozen + (xs - frozen) * (-lambda)` has the value of `xs` because the
/// bracket is exactly zero, while its derivative w.r.t. `xs` is `-lambda`.
pub fn reverse_gradient(xs: &Tensor, lambda: f64) -> Tensor {
    let frozen = xs.detach();
    &frozen + (xs - &frozen) * (-lambda)
}

/// Layer wrapper around [`reverse_gradient`] with a per-call coefficient.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientReversal;

impl GradientReversal {
    /// Create a new reversal layer.
    pub fn new() -> Self {
        GradientReversal
    }

    /// Apply the reversal with coefficient `lambda`.
    pub fn forward(&self, xs: &Tensor, lambda: f64) -> Tensor {
        reverse_gradient(xs, lambda)
    }
}

// ---------------------------------------------------------------------------
// Conditioning
// ---------------------------------------------------------------------------

/// Multilinear conditioning: flattened outer product of `feature` `[B, F]`
/// and the detached class probabilities `probs` `[B, K]`.
///
/// Output: `[B, K * F]`, row-major over `(class, feature)`.
pub fn multilinear_condition(feature: &Tensor, probs: &Tensor) -> Tensor {
    let probs = probs.detach().unsqueeze(2); // [B, K, 1]
    let feature = feature.unsqueeze(1); // [B, 1, F]
    let outer = feature * probs; // [B, K, F]
    let batch = outer.size()[0];
    outer.reshape([batch, -1])
}

/// Per-sample Shannon entropy of class probabilities `[B, K]` → `[B]`.
pub fn entropy(probs: &Tensor) -> Tensor {
    let plogp = probs * (probs + ENTROPY_EPS).log();
    -plogp.sum_dim_intlist(&[1_i64][..], false, Kind::Float)
}

/// Entropy-conditioning weights `[B]`.
///
/// `H = 1 + exp(-entropy)` with the entropy passed through the reversal
/// operator, normalised by the detached batch sum so the weights sum to one.
/// Confident (low-entropy) samples receive the larger weights.
pub fn entropy_weights(probs: &Tensor, lambda: f64) -> Tensor {
    let ent = reverse_gradient(&entropy(probs), lambda);
    let h = (-ent).exp() + 1.0;
    let total = h.sum(Kind::Float).detach();
    h / total
}

// ---------------------------------------------------------------------------
// DomainDiscriminator
// ---------------------------------------------------------------------------

/// Predicts which domain a conditioned feature came from.
///
/// `GRL -> Linear(in, hidden) -> act -> Linear(hidden, n_domains)`
#[derive(Debug)]
pub struct DomainDiscriminator {
    hidden: nn::Linear,
    logits: nn::Linear,
    activation: Activation,
    grl: GradientReversal,
}

impl DomainDiscriminator {
    /// Register the discriminator's parameters under `path`.
    pub fn new(
        path: &nn::Path,
        in_dim: i64,
        hidden: i64,
        num_domains: i64,
        activation: Activation,
    ) -> Self {
        let hidden_layer = nn::linear(path / "hidden", in_dim, hidden, Default::default());
        let logits = nn::linear(path / "disc_logits", hidden, num_domains, Default::default());
        DomainDiscriminator { hidden: hidden_layer, logits, activation, grl: GradientReversal }
    }

    /// Domain logits `[B, n_domains]` for conditioned features `[B, in_dim]`.
    pub fn forward(&self, conditioned: &Tensor, lambda: f64) -> Tensor {
        let xs = self.grl.forward(conditioned, lambda);
        let xs = self.activation.apply(&xs.apply(&self.hidden));
        xs.apply(&self.logits)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
