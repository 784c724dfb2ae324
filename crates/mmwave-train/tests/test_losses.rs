//! Integration tests for [`mmwave_train::losses`], [`mmwave_train::margin`]
//! and the gradient reversal in [`mmwave_train::domain`].
//!
//! All input tensors are constructed from fixed, deterministic data.

use approx::assert_abs_diff_eq;
use mmwave_train::domain::reverse_gradient;
use mmwave_train::losses::{
    cross_entropy, domain_labels, domain_loss, per_sample_cross_entropy, weighted_domain_loss,
    CdanLoss, SOURCE_DOMAIN, TARGET_DOMAIN,
};
use mmwave_train::margin::{am_logits, AngularMargin};
use tch::{Device, Kind, Tensor};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn cpu() -> (Kind, Device) {
    (Kind::Float, Device::Cpu)
}

fn t2(data: &[f32], rows: i64, cols: i64) -> Tensor {
    Tensor::from_slice(data).view([rows, cols])
}

fn scalar(t: &Tensor) -> f64 {
    t.double_value(&[])
}

// ---------------------------------------------------------------------------
// Cross-entropy
// ---------------------------------------------------------------------------

/// Uniform logits over K classes give a loss of ln K.
#[test]
fn cross_entropy_of_uniform_logits_is_log_k() {
    let labels = t2(&[1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0], 2, 4);
    let logits = Tensor::zeros([2, 4], cpu());
    assert_abs_diff_eq!(scalar(&cross_entropy(&labels, &logits)), 4f64.ln(), epsilon = 1e-6);
}

#[test]
fn cross_entropy_is_near_zero_for_confident_correct_logits() {
    let labels = t2(&[0.0, 1.0], 1, 2);
    let logits = t2(&[-20.0, 20.0], 1, 2);
    assert!(scalar(&cross_entropy(&labels, &logits)) < 1e-6);
}

#[test]
fn per_sample_cross_entropy_has_one_value_per_row() {
    let labels = t2(&[1.0, 0.0, 0.0, 1.0, 1.0, 0.0], 3, 2);
    let logits = Tensor::zeros([3, 2], cpu());
    let per = per_sample_cross_entropy(&labels, &logits);
    assert_eq!(per.size(), vec![3]);
}

// ---------------------------------------------------------------------------
// Domain labels and losses
// ---------------------------------------------------------------------------

#[test]
fn domain_labels_put_source_first() {
    let labels = domain_labels(2, 3, 2, Device::Cpu);
    assert_eq!(labels.size(), vec![5, 2]);
    let idx = labels.argmax(-1, false);
    for row in 0..2 {
        assert_eq!(idx.int64_value(&[row]), SOURCE_DOMAIN);
    }
    for row in 2..5 {
        assert_eq!(idx.int64_value(&[row]), TARGET_DOMAIN);
    }
}

/// Uniform weights reduce the weighted loss to the plain mean.
#[test]
fn unit_weights_equal_unweighted_loss() {
    let targets = domain_labels(2, 2, 2, Device::Cpu);
    let logits = t2(&[0.3, -0.1, 1.2, 0.4, -0.5, 0.9, 0.0, 0.2], 4, 2);
    let plain = scalar(&domain_loss(&targets, &logits));
    let weighted = scalar(&weighted_domain_loss(&targets, &logits, &Tensor::ones([4], cpu())));
    assert_abs_diff_eq!(plain, weighted, epsilon = 1e-6);
}

/// The weighted loss is invariant to a uniform positive rescaling.
#[test]
fn weighted_domain_loss_is_scale_invariant() {
    let targets = domain_labels(2, 2, 2, Device::Cpu);
    let logits = t2(&[0.3, -0.1, 1.2, 0.4, -0.5, 0.9, 0.0, 0.2], 4, 2);
    let w = Tensor::from_slice(&[0.1_f32, 0.4, 0.2, 0.3]);
    let a = scalar(&weighted_domain_loss(&targets, &logits, &w));
    let b = scalar(&weighted_domain_loss(&targets, &logits, &(&w * 7.5)));
    assert_abs_diff_eq!(a, b, epsilon = 1e-6);
}

/// No gradient flows into the weights through the normaliser.
#[test]
fn weighted_loss_normaliser_is_detached() {
    let targets = domain_labels(1, 1, 2, Device::Cpu);
    let logits = t2(&[0.5, -0.5, 0.2, 0.1], 2, 2);
    let w = Tensor::from_slice(&[0.5_f32, 0.5]).set_requires_grad(true);
    let loss = weighted_domain_loss(&targets, &logits, &w);
    loss.backward();
    // d/dw_i = loss_i / sum(w), and sum(w) = 1.
    let per = per_sample_cross_entropy(&targets, &logits);
    assert!(w.grad().allclose(&per, 1e-5, 1e-5, false));
}

// ---------------------------------------------------------------------------
// CdanLoss
// ---------------------------------------------------------------------------

#[test]
fn total_is_classification_plus_weighted_domain() {
    let loss = CdanLoss::new(0.1);
    let labels = t2(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0], 2, 3);
    let src_logits = t2(&[2.0, 0.1, -1.0, 0.3, 0.2, 0.1], 2, 3);
    let domain_logits = t2(&[0.4, -0.4, 0.1, 0.0, -0.2, 0.6, 0.3, 0.3], 4, 2);

    let (total, parts) = loss.forward(&labels, &src_logits, &domain_logits, 2, None);
    assert_abs_diff_eq!(parts.total, parts.classification + 0.1 * parts.domain, epsilon = 1e-6);
    assert_abs_diff_eq!(scalar(&total), parts.total, epsilon = 1e-9);
}

/// Target labels never enter the loss: rows past `n_src` only affect the
/// domain term.
#[test]
fn classification_ignores_target_rows() {
    let loss = CdanLoss::new(0.0);
    let labels = t2(&[1.0, 0.0], 1, 2);
    let src_logits = t2(&[1.0, 0.0], 1, 2);
    let dom_a = t2(&[0.0, 0.0, 5.0, -5.0], 2, 2);
    let dom_b = t2(&[0.0, 0.0, -5.0, 5.0], 2, 2);
    let (_, a) = loss.forward(&labels, &src_logits, &dom_a, 1, None);
    let (_, b) = loss.forward(&labels, &src_logits, &dom_b, 1, None);
    assert_abs_diff_eq!(a.total, b.total, epsilon = 1e-9);
    assert!(a.domain > b.domain);
}

// ---------------------------------------------------------------------------
// Angular margin
// ---------------------------------------------------------------------------

/// Only the ground-truth cosine moves, by exactly `s·m`.
#[test]
fn angular_margin_shifts_true_class_only() {
    let labels = t2(&[0.0, 1.0, 0.0], 1, 3);
    let cos = t2(&[0.2, 0.7, -0.4], 1, 3);
    let out = am_logits(&labels, &cos, 0.2, 10.0);
    let expected = t2(&[2.0, 5.0, -4.0], 1, 3);
    assert!(out.allclose(&expected, 1e-5, 1e-5, false));
}

/// A margin makes the loss strictly larger than the plain scaled cosines.
#[test]
fn angular_margin_raises_classification_loss() {
    let labels = t2(&[1.0, 0.0, 0.0, 1.0], 2, 2);
    let cos = t2(&[0.6, 0.1, 0.2, 0.5], 2, 2);
    let plain = AngularMargin::new(10.0, 0.0).apply(&labels, &cos);
    let margin = AngularMargin::new(10.0, 0.2).apply(&labels, &cos);
    assert!(scalar(&cross_entropy(&labels, &margin)) > scalar(&cross_entropy(&labels, &plain)));
}

// ---------------------------------------------------------------------------
// Gradient reversal
// ---------------------------------------------------------------------------

#[test]
fn reversal_negates_and_scales_the_gradient() {
    let x = Tensor::from_slice(&[1.0_f32, -2.0, 3.0]).set_requires_grad(true);
    let y = reverse_gradient(&x, 0.5);
    assert!(y.allclose(&x, 0.0, 0.0, false), "forward must be the identity");
    (y * Tensor::from_slice(&[1.0_f32, 2.0, 3.0])).sum(Kind::Float).backward();
    let expected = Tensor::from_slice(&[-0.5_f32, -1.0, -1.5]);
    assert!(x.grad().allclose(&expected, 1e-6, 1e-6, false));
}
