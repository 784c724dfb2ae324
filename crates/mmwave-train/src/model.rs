//! Adversarial classifier model using tch-rs (PyTorch Rust bindings).
//!
//! # Architecture
//!
//! ```text
//! radar image [B, H, W, C]
//!       │  permute to [B, C, H, W]
//!       ▼
//! ┌──────────────────────────────┐
//! │ Stem: Conv7x7/2 + BN + act   │
//! │       MaxPool3x3/2           │
//! └──────────────────────────────┘
//!       │
//!       ▼
//! ┌──────────────────────────────┐
//! │ Bottleneck stages            │  block_layout, e.g. [3, 4, 6, 3]
//! └──────────────────────────────┘
//!       │  global average pool
//!       ▼
//!   fc1 embedding ──► feature [B, F]
//!       │                 │
//!       ▼                 │
//!  classifier head        │
//!   logits [B, K]         │
//!       │ softmax (detached)
//!       └──────► outer product [B, K*F] ──► GRL ──► discriminator
//!                                                   domain_logits [B, D]
//! ```
//!
//! # Variants
//!
//! The classifier head is picked by [`ModelVariant`]: a dense layer for the
//! plain methods, or a cosine head (L2-normalised features and class weights)
//! for the angular-margin methods. The margin itself is applied by the
//! training step, never in [`CdanModel::forward_t`].

use std::path::Path;
use tch::{nn, nn::Module, nn::ModuleT, Device, Kind, Tensor};
use tracing::debug;

use crate::config::{Activation, Method, TrainingConfig};
use crate::domain::{entropy_weights, multilinear_condition, DomainDiscriminator};
use crate::error::TrainResult;

/// Channel expansion of a bottleneck block's output.
const BOTTLENECK_EXPANSION: i64 = 4;

// ---------------------------------------------------------------------------
// Public output type
// ---------------------------------------------------------------------------

/// Outputs produced by a single forward pass of a [`CdanModel`].
#[derive(Debug)]
pub struct AdversarialOutput {
    /// Raw class logits `[B, K]` (cosine similarities for the cosine head).
    pub logits: Tensor,
    /// Domain logits `[B, n_domains]`.
    pub domain_logits: Tensor,
    /// Entropy-conditioning weights `[B]`; `None` when the method does not
    /// weight the domain loss.
    pub weight: Option<Tensor>,
}

/// Common interface of every model variant.
pub trait AdversarialModel {
    /// Forward pass. `lambda` is the gradient-reversal coefficient.
    fn forward_t(&self, images: &Tensor, train: bool, lambda: f64) -> AdversarialOutput;

    /// Device the parameters live on.
    fn device(&self) -> Device;
}

impl Activation {
    /// Apply the non-linearity.
    pub fn apply(self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Selu => xs.selu(),
            Activation::Relu => xs.relu(),
            Activation::Elu => xs.elu(),
            Activation::Gelu => xs.gelu("none"),
            Activation::Tanh => xs.tanh(),
        }
    }
}

// ---------------------------------------------------------------------------
// ModelSpec / ModelVariant
// ---------------------------------------------------------------------------

/// Which classifier head the model carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    /// Dense linear head.
    Standard,
    /// Cosine head for additive angular-margin training.
    AngularMargin,
}

impl ModelVariant {
    /// Variant required by `method`.
    pub fn for_method(method: Method) -> Self {
        if method.uses_angular_margin() {
            ModelVariant::AngularMargin
        } else {
            ModelVariant::Standard
        }
    }
}

/// Architecture hyper-parameters resolved from a [`TrainingConfig`] and the
/// channel count of the data.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Image channels `C`.
    pub in_channels: i64,
    /// Output classes `K`.
    pub num_classes: i64,
    /// Embedding width.
    pub num_features: i64,
    /// Filters of the first stage; doubled per stage.
    pub num_filters: i64,
    /// Nonlinearity of backbone and discriminator.
    pub activation: Activation,
    /// Dropout before the embedding layer.
    pub dropout_rate: f64,
    /// Bottleneck blocks per stage.
    pub block_layout: Vec<usize>,
    /// Hidden width of the discriminator.
    pub disc_hidden: i64,
    /// Domains told apart by the discriminator.
    pub num_domains: i64,
    /// Classifier head.
    pub variant: ModelVariant,
    /// Whether entropy weights are produced.
    pub entropy_conditioning: bool,
}

impl ModelSpec {
    /// Resolve the architecture for images with `in_channels` channels.
    pub fn from_config(cfg: &TrainingConfig, in_channels: usize) -> Self {
        ModelSpec {
            in_channels: in_channels as i64,
            num_classes: cfg.num_classes as i64,
            num_features: cfg.num_features as i64,
            num_filters: cfg.model_filters as i64,
            activation: cfg.activation_fn,
            dropout_rate: cfg.dropout_rate,
            block_layout: cfg.block_layout.clone(),
            disc_hidden: cfg.disc_hidden as i64,
            num_domains: cfg.num_domains() as i64,
            variant: ModelVariant::for_method(cfg.method),
            entropy_conditioning: cfg.method.uses_entropy(),
        }
    }
}

// ---------------------------------------------------------------------------
// CdanModel
// ---------------------------------------------------------------------------

/// Residual classifier with a conditional domain discriminator.
///
/// All parameters live in one `VarStore` so a single file captures the model.
pub struct CdanModel {
    vs: nn::VarStore,
    backbone: Backbone,
    head: ClassifierHead,
    discriminator: DomainDiscriminator,
    spec: ModelSpec,
}

impl CdanModel {
    /// Build the model variant selected by `spec.variant` on `device`.
    pub fn new(spec: ModelSpec, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let backbone = Backbone::new(&(&root / "backbone"), &spec);
        let head = match spec.variant {
            ModelVariant::Standard => ClassifierHead::Linear(nn::linear(
                &root / "logits",
                spec.num_features,
                spec.num_classes,
                Default::default(),
            )),
            ModelVariant::AngularMargin => ClassifierHead::Cosine(CosineHead::new(
                &(&root / "logits"),
                spec.num_features,
                spec.num_classes,
            )),
        };
        let discriminator = DomainDiscriminator::new(
            &(&root / "disc"),
            spec.num_classes * spec.num_features,
            spec.disc_hidden,
            spec.num_domains,
            spec.activation,
        );

        let model = CdanModel { vs, backbone, head, discriminator, spec };
        debug!(
            "Built {:?} model with {} parameters",
            model.spec.variant,
            model.num_parameters()
        );
        model
    }

    /// Convenience constructor straight from a training config.
    pub fn from_config(cfg: &TrainingConfig, in_channels: usize) -> Self {
        Self::new(ModelSpec::from_config(cfg, in_channels), cfg.device())
    }

    /// Save model weights to `path`.
    pub fn save(&self, path: &Path) -> TrainResult<()> {
        self.vs.save(path)?;
        Ok(())
    }

    /// Load model weights from `path` into this (already built) model.
    pub fn load(&mut self, path: &Path) -> TrainResult<()> {
        self.vs.load(path)?;
        Ok(())
    }

    /// Count total trainable parameters.
    pub fn num_parameters(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .map(|t| t.numel())
            .sum()
    }

    /// Access the internal `VarStore` (e.g. to create an optimizer).
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// The resolved architecture.
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Backbone embedding `[B, F]` for images `[B, H, W, C]`.
    pub fn features_t(&self, images: &Tensor, train: bool) -> Tensor {
        let xs = images.permute([0, 3, 1, 2]);
        self.backbone.forward_t(&xs, train)
    }
}

impl AdversarialModel for CdanModel {
    fn forward_t(&self, images: &Tensor, train: bool, lambda: f64) -> AdversarialOutput {
        let feature = self.features_t(images, train);
        let logits = self.head.forward(&feature);
        let probs = logits.softmax(-1, Kind::Float);

        let conditioned = multilinear_condition(&feature, &probs);
        let weight = if self.spec.entropy_conditioning {
            Some(entropy_weights(&probs, lambda))
        } else {
            None
        };
        let domain_logits = self.discriminator.forward(&conditioned, lambda);

        AdversarialOutput { logits, domain_logits, weight }
    }

    fn device(&self) -> Device {
        self.vs.device()
    }
}

// ---------------------------------------------------------------------------
// Classifier heads
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ClassifierHead {
    Linear(nn::Linear),
    Cosine(CosineHead),
}

impl ClassifierHead {
    fn forward(&self, feature: &Tensor) -> Tensor {
        match self {
            ClassifierHead::Linear(layer) => layer.forward(feature),
            ClassifierHead::Cosine(head) => head.forward(feature),
        }
    }
}

/// Bias-free head producing `cos(feature, class_weight)` in `[-1, 1]`.
#[derive(Debug)]
struct CosineHead {
    weight: Tensor,
}

impl CosineHead {
    fn new(path: &nn::Path, in_dim: i64, num_classes: i64) -> Self {
        let stdev = (1.0 / in_dim as f64).sqrt();
        let weight = path.var("weight", &[num_classes, in_dim], nn::Init::Randn { mean: 0.0, stdev });
        CosineHead { weight }
    }

    fn forward(&self, feature: &Tensor) -> Tensor {
        l2_normalize(feature).matmul(&l2_normalize(&self.weight).transpose(0, 1))
    }
}

/// Row-wise L2 normalisation of a 2-D tensor.
fn l2_normalize(xs: &Tensor) -> Tensor {
    let norm = (xs.pow_tensor_scalar(2).sum_dim_intlist(&[1_i64][..], true, Kind::Float) + 1e-12)
        .sqrt();
    xs / norm
}

// ---------------------------------------------------------------------------
// Residual backbone
// ---------------------------------------------------------------------------

/// ResNet-style feature extractor ending in the `fc1` embedding layer.
#[derive(Debug)]
struct Backbone {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    blocks: Vec<Bottleneck>,
    fc1: nn::Linear,
    activation: Activation,
    dropout_rate: f64,
}

impl Backbone {
    fn new(path: &nn::Path, spec: &ModelSpec) -> Self {
        let conv1 = nn::conv2d(
            path / "conv1",
            spec.in_channels,
            spec.num_filters,
            7,
            nn::ConvConfig { stride: 2, padding: 3, bias: false, ..Default::default() },
        );
        let bn1 = nn::batch_norm2d(path / "bn1", spec.num_filters, Default::default());

        let mut blocks = Vec::new();
        let mut in_ch = spec.num_filters;
        for (stage, &depth) in spec.block_layout.iter().enumerate() {
            let filters = spec.num_filters << stage;
            for i in 0..depth {
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                let block_path = path / format!("stage{stage}_block{i}");
                blocks.push(Bottleneck::new(&block_path, in_ch, filters, stride, spec.activation));
                in_ch = filters * BOTTLENECK_EXPANSION;
            }
        }

        let fc1 = nn::linear(path / "fc1", in_ch, spec.num_features, Default::default());

        Backbone {
            conv1,
            bn1,
            blocks,
            fc1,
            activation: spec.activation,
            dropout_rate: spec.dropout_rate,
        }
    }
}

impl ModuleT for Backbone {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = xs.apply(&self.conv1).apply_t(&self.bn1, train);
        let mut xs = self
            .activation
            .apply(&xs)
            .max_pool2d([3, 3], [2, 2], [1, 1], [1, 1], false);

        for block in &self.blocks {
            xs = block.forward_t(&xs, train);
        }

        let pooled = xs.adaptive_avg_pool2d([1, 1]).flatten(1, -1);
        pooled.dropout(self.dropout_rate, train).apply(&self.fc1)
    }
}

/// ResNet bottleneck block.
///
/// ```text
/// x ── 1x1 ── BN ── act ── 3x3(s) ── BN ── act ── 1x1 ── BN ──+── act
///  │                                                            │
///  └──────────── (1x1(s) + BN projection if needed) ────────────┘
/// ```
#[derive(Debug)]
struct Bottleneck {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
    conv3: nn::Conv2D,
    bn3: nn::BatchNorm,
    shortcut: Option<(nn::Conv2D, nn::BatchNorm)>,
    activation: Activation,
}

impl Bottleneck {
    fn new(path: &nn::Path, in_ch: i64, filters: i64, stride: i64, activation: Activation) -> Self {
        let out_ch = filters * BOTTLENECK_EXPANSION;
        let no_bias = nn::ConvConfig { bias: false, ..Default::default() };

        let conv1 = nn::conv2d(path / "conv1", in_ch, filters, 1, no_bias);
        let bn1 = nn::batch_norm2d(path / "bn1", filters, Default::default());
        let conv2 = nn::conv2d(
            path / "conv2",
            filters,
            filters,
            3,
            nn::ConvConfig { stride, padding: 1, bias: false, ..Default::default() },
        );
        let bn2 = nn::batch_norm2d(path / "bn2", filters, Default::default());
        let conv3 = nn::conv2d(path / "conv3", filters, out_ch, 1, no_bias);
        let bn3 = nn::batch_norm2d(path / "bn3", out_ch, Default::default());

        let shortcut = if in_ch != out_ch || stride != 1 {
            let conv = nn::conv2d(
                path / "ds_conv",
                in_ch,
                out_ch,
                1,
                nn::ConvConfig { stride, bias: false, ..Default::default() },
            );
            let bn = nn::batch_norm2d(path / "ds_bn", out_ch, Default::default());
            Some((conv, bn))
        } else {
            None
        };

        Bottleneck { conv1, bn1, conv2, bn2, conv3, bn3, shortcut, activation }
    }
}

impl ModuleT for Bottleneck {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let act = self.activation;
        let out = act.apply(&xs.apply(&self.conv1).apply_t(&self.bn1, train));
        let out = act.apply(&out.apply(&self.conv2).apply_t(&self.bn2, train));
        let out = out.apply(&self.conv3).apply_t(&self.bn3, train);

        let residual = match &self.shortcut {
            Some((conv, bn)) => xs.apply(conv).apply_t(bn, train),
            None => xs.shallow_clone(),
        };

        act.apply(&(out + residual))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
