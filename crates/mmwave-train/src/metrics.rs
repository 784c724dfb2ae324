//! Running training metrics and classification evaluation metrics.
//!
//! This module provides:
//!
//! - [`Mean`]: running mean of scalar values.
//! - [`CategoricalAccuracy`]: running fraction of argmax hits.
//! - [`TrainMetrics`]: the accumulator bundle owned by a training session.
//! - [`ConfusionMatrix`]: per-class counts for an evaluation pass.

use ndarray::{Array1, Array2};
use tch::Tensor;

// ---------------------------------------------------------------------------
// Mean
// ---------------------------------------------------------------------------

/// Running mean of a scalar series.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    total: f64,
    count: u64,
}

impl Mean {
    /// Empty mean.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one observation.
    pub fn update(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    /// Current mean, `0.0` before the first observation.
    pub fn result(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    /// Number of observations so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Forget every observation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// CategoricalAccuracy
// ---------------------------------------------------------------------------

/// Running categorical accuracy over all samples seen since the last reset.
#[derive(Debug, Clone, Default)]
pub struct CategoricalAccuracy {
    correct: u64,
    total: u64,
}

impl CategoricalAccuracy {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate a batch of one-hot `labels` `[B, K]` against scores
    /// `[B, K]` (probabilities or logits; only the argmax matters).
    pub fn update(&mut self, labels: &Tensor, scores: &Tensor) {
        let hits = labels
            .argmax(-1, false)
            .eq_tensor(&scores.argmax(-1, false))
            .sum(tch::Kind::Int64)
            .int64_value(&[]);
        self.correct += hits as u64;
        self.total += labels.size()[0] as u64;
    }

    /// Accumulate host-side class indices.
    pub fn update_indices(&mut self, labels: &[usize], predictions: &[usize]) {
        self.correct += labels.iter().zip(predictions).filter(|(a, b)| a == b).count() as u64;
        self.total += labels.len() as u64;
    }

    /// Fraction correct, `0.0` before the first batch.
    pub fn result(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    /// Samples seen since the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Clear the counts.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// TrainMetrics
// ---------------------------------------------------------------------------

/// Accumulators owned by a [`TrainingSession`](crate::trainer::TrainingSession).
///
/// # Reset policy
///
/// - `source_train_acc` and `target_test_acc` are reset by
///   [`TrainMetrics::end_epoch`] at the close of every epoch, so a logged
///   accuracy covers the batches of that epoch only.
/// - `classification_loss` and `domain_loss` are never reset: they are running
///   means over the lifetime of the session.
#[derive(Debug, Clone, Default)]
pub struct TrainMetrics {
    /// Source training accuracy, reset every epoch.
    pub source_train_acc: CategoricalAccuracy,
    /// Target held-out accuracy, reset every epoch.
    pub target_test_acc: CategoricalAccuracy,
    /// Classification loss, never reset.
    pub classification_loss: Mean,
    /// Weighted domain loss, never reset.
    pub domain_loss: Mean,
}

impl TrainMetrics {
    /// Fresh accumulators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the per-epoch accuracy accumulators.
    pub fn end_epoch(&mut self) {
        self.source_train_acc.reset();
        self.target_test_acc.reset();
    }

    /// Snapshot of the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            source_train_acc: self.source_train_acc.result(),
            target_test_acc: self.target_test_acc.result(),
            classification_loss: self.classification_loss.result(),
            domain_loss: self.domain_loss.result(),
        }
    }
}

/// Plain values read out of [`TrainMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Source training accuracy.
    pub source_train_acc: f64,
    /// Target held-out accuracy.
    pub target_test_acc: f64,
    /// Running classification loss.
    pub classification_loss: f64,
    /// Running domain loss.
    pub domain_loss: f64,
}

impl MetricsSnapshot {
    /// A human-readable summary line suitable for logging.
    pub fn summary(&self) -> String {
        format!(
            "src_acc={:.4}  tgt_acc={:.4}  cls_loss={:.5}  dom_loss={:.5}",
            self.source_train_acc, self.target_test_acc, self.classification_loss, self.domain_loss
        )
    }
}

// ---------------------------------------------------------------------------
// ConfusionMatrix
// ---------------------------------------------------------------------------

/// `counts[[true, predicted]]` over one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    counts: Array2<u64>,
}

impl ConfusionMatrix {
    /// All-zero `num_classes × num_classes` matrix.
    pub fn new(num_classes: usize) -> Self {
        Self { counts: Array2::zeros((num_classes, num_classes)) }
    }

    /// Record one `(true, predicted)` pair. Out-of-range indices are ignored.
    pub fn record(&mut self, truth: usize, predicted: usize) {
        if let Some(c) = self.counts.get_mut((truth, predicted)) {
            *c += 1;
        }
    }

    /// Number of classes.
    pub fn num_classes(&self) -> usize {
        self.counts.nrows()
    }

    /// Raw counts, rows are true classes.
    pub fn counts(&self) -> &Array2<u64> {
        &self.counts
    }

    /// Samples recorded.
    pub fn total(&self) -> u64 {
        self.counts.sum()
    }

    /// Trace over total, `0.0` when empty.
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.counts.diag().sum() as f64 / total as f64
    }

    /// Recall of each class; classes with no samples get `0.0`.
    pub fn per_class_recall(&self) -> Array1<f64> {
        Array1::from_iter(self.counts.rows().into_iter().enumerate().map(|(i, row)| {
            let n = row.sum();
            if n == 0 {
                0.0
            } else {
                row[i] as f64 / n as f64
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn mean_tracks_running_average() {
        let mut m = Mean::new();
        assert_eq!(m.result(), 0.0);
        for v in [1.0, 2.0, 6.0] {
            m.update(v);
        }
        assert_abs_diff_eq!(m.result(), 3.0, epsilon = 1e-12);
        assert_eq!(m.count(), 3);
        m.reset();
        assert_eq!(m.count(), 0);
    }

    #[test]
    fn accuracy_from_tensors() {
        let labels = Tensor::from_slice(&[1.0_f32, 0.0, 0.0, 1.0, 1.0, 0.0]).view([3, 2]);
        let scores = Tensor::from_slice(&[0.9_f32, 0.1, 0.2, 0.8, 0.3, 0.7]).view([3, 2]);
        let mut acc = CategoricalAccuracy::new();
        acc.update(&labels, &scores);
        assert_abs_diff_eq!(acc.result(), 2.0 / 3.0, epsilon = 1e-12);
        assert_eq!(acc.total(), 3);
    }

    #[test]
    fn end_epoch_resets_accuracy_but_not_loss() {
        let mut m = TrainMetrics::new();
        m.source_train_acc.update_indices(&[0, 1], &[0, 1]);
        m.target_test_acc.update_indices(&[0], &[1]);
        m.classification_loss.update(2.0);
        m.domain_loss.update(0.5);

        m.end_epoch();

        let snap = m.snapshot();
        assert_eq!(snap.source_train_acc, 0.0);
        assert_eq!(m.source_train_acc.total(), 0);
        assert_eq!(m.target_test_acc.total(), 0);
        assert_eq!(snap.classification_loss, 2.0);
        assert_eq!(snap.domain_loss, 0.5);
    }

    #[test]
    fn confusion_matrix_accuracy_and_recall() {
        let mut cm = ConfusionMatrix::new(3);
        for (t, p) in [(0, 0), (0, 1), (1, 1), (2, 2), (2, 2)] {
            cm.record(t, p);
        }
        cm.record(7, 0);
        assert_eq!(cm.total(), 5);
        assert_abs_diff_eq!(cm.accuracy(), 0.8, epsilon = 1e-12);
        let recall = cm.per_class_recall();
        assert_abs_diff_eq!(recall[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(recall[2], 1.0, epsilon = 1e-12);
    }
}
