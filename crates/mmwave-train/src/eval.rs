//! Inference-mode evaluation of an adversarial classifier.
//!
//! Runs the classifier branch only: domain logits and entropy weights are
//! computed by the shared forward pass and dropped.

use tch::{Kind, Tensor};

use crate::dataset::{array_to_tensor, EvalStream};
use crate::metrics::{CategoricalAccuracy, ConfusionMatrix};
use crate::model::AdversarialModel;

/// Result of one pass over an evaluation stream.
#[derive(Debug, Clone)]
pub struct EvalReport {
    /// Fraction of samples whose argmax matches the label.
    pub accuracy: f64,
    /// Samples evaluated.
    pub samples: usize,
    /// Per-class counts.
    pub confusion: ConfusionMatrix,
}

impl EvalReport {
    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!("acc={:.4}  (n_samples={})", self.accuracy, self.samples)
    }
}

/// Softmax class probabilities `[B, K]` for `images` `[B, H, W, C]`.
///
/// No gradient is recorded and batch norm uses its running statistics.
pub fn predict<M: AdversarialModel + ?Sized>(model: &M, images: &Tensor) -> Tensor {
    tch::no_grad(|| model.forward_t(images, false, 0.0).logits.softmax(-1, Kind::Float))
}

/// Predict every batch of `stream` in order, feeding `acc` and building a
/// report. An empty stream yields accuracy `0.0`.
pub fn evaluate_stream<M: AdversarialModel + ?Sized>(
    model: &M,
    stream: &EvalStream<'_>,
    num_classes: usize,
    acc: &mut CategoricalAccuracy,
) -> EvalReport {
    let device = model.device();
    let mut confusion = ConfusionMatrix::new(num_classes);
    let mut local = CategoricalAccuracy::new();

    for batch in stream.iter() {
        let probs = predict(model, &array_to_tensor(&batch.images, device));
        let predicted = argmax_indices(&probs);
        let truth: Vec<usize> = batch
            .labels
            .rows()
            .into_iter()
            .map(|row| row.iter().position(|&v| v > 0.5).unwrap_or(num_classes))
            .collect();
        for (&t, &p) in truth.iter().zip(&predicted) {
            confusion.record(t, p);
        }
        local.update_indices(&truth, &predicted);
        acc.update_indices(&truth, &predicted);
    }

    EvalReport { accuracy: local.result(), samples: local.total() as usize, confusion }
}

fn argmax_indices(probs: &Tensor) -> Vec<usize> {
    let idx = probs.argmax(-1, false).to_device(tch::Device::Cpu);
    let n = idx.size()[0];
    (0..n).map(|i| idx.int64_value(&[i]) as usize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Activation, Method};
    use crate::dataset::{RadarSource, SyntheticConfig, SyntheticDataset};
    use crate::model::{CdanModel, ModelSpec, ModelVariant};
    use tch::Device;

    fn tiny_model() -> CdanModel {
        tch::manual_seed(0);
        CdanModel::new(
            ModelSpec {
                in_channels: 1,
                num_classes: 3,
                num_features: 8,
                num_filters: 4,
                activation: Activation::Relu,
                dropout_rate: 0.0,
                block_layout: vec![1],
                disc_hidden: 8,
                num_domains: 2,
                variant: ModelVariant::for_method(Method::Cdan),
                entropy_conditioning: false,
            },
            Device::Cpu,
        )
    }

    #[test]
    fn predict_returns_probabilities() {
        let model = tiny_model();
        let probs = predict(&model, &Tensor::randn([3, 8, 8, 1], (Kind::Float, Device::Cpu)));
        assert_eq!(probs.size(), vec![3, 3]);
        let row_sums = probs.sum_dim_intlist(&[1_i64][..], false, Kind::Float);
        let ones = Tensor::ones([3], (Kind::Float, Device::Cpu));
        assert!(row_sums.allclose(&ones, 1e-5, 1e-5, false));
        assert!(!probs.requires_grad());
    }

    #[test]
    fn evaluate_counts_every_sample_once() {
        let synth = SyntheticDataset::new(SyntheticConfig {
            num_classes: 3,
            num_days: 1,
            samples_per_class_day: 3,
            height: 8,
            width: 8,
            channels: 1,
            ..Default::default()
        });
        let ds = synth.source().unwrap();
        let stream = EvalStream::new(&ds, 3, 4);
        let mut acc = CategoricalAccuracy::new();
        let report = evaluate_stream(&tiny_model(), &stream, 3, &mut acc);
        assert_eq!(report.samples, 9);
        assert_eq!(report.confusion.total(), 9);
        assert_eq!(acc.total(), 9);
        assert!((report.accuracy - report.confusion.accuracy()).abs() < 1e-12);
    }
}
