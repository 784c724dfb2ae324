//! Dataset providers, data preparation and batch streams for CDAN training.
//!
//! This module defines the [`RadarSource`] trait plus two implementations:
//!
//! - [`NpyDataset`]: reads `.npy` arrays from disk.
//! - [`SyntheticDataset`]: generates deterministic class-dependent patterns
//!   with a per-site domain shift; used by tests and `--dry-run`.
//!
//! [`prepare`] turns a provider plus a [`TrainingConfig`] into the four
//! splits the training loop consumes. [`TrainStream`] and [`EvalStream`]
//! batch them.
//!
//! # Directory layout expected by `NpyDataset`
//!
//! ```text
//! <data_dir>/
//!   source_data/
//!     samples.npy       # f32 [N, H, W, C]
//!     labels.npy        # i64 [N, 2]  (class, day)
//!     classes.json      # ["class_a", "class_b", ...]
//!   target_conf_data/   # same three files
//!   target_server_data/
//!   target_office_data/
//! ```
//!
//! # Example – synthetic dataset
//!
//! ```rust
//! use mmwave_train::config::TrainingConfig;
//! use mmwave_train::dataset::{prepare, SyntheticConfig, SyntheticDataset};
//!
//! let mut cfg = TrainingConfig::default();
//! cfg.num_classes = 3;
//! let synth = SyntheticDataset::new(SyntheticConfig { num_classes: 3, ..Default::default() });
//! let data = prepare(&synth, &cfg).unwrap();
//! assert!(!data.source_train.is_empty());
//! ```

use ndarray::{Array1, Array2, Array3, Array4, Axis};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tch::{Device, Kind, Tensor};
use tracing::{debug, info, warn};

use crate::augment::{Augmentor, Xorshift64};
use crate::config::{TargetContext, TrainingConfig};
use crate::error::DatasetError;

/// Fraction of the source training days held out as the source test split.
pub const SOURCE_TEST_FRACTION: f64 = 0.10;

/// Fraction of the target training set held out in `val` mode.
pub const VALIDATION_FRACTION: f64 = 1.0 / 3.0;

// ---------------------------------------------------------------------------
// RadarDataset
// ---------------------------------------------------------------------------

/// An in-memory set of radar images with class and day labels.
#[derive(Debug, Clone)]
pub struct RadarDataset {
    /// Images `[N, H, W, C]`.
    pub images: Array4<f32>,
    /// Class index per sample.
    pub labels: Vec<usize>,
    /// Recording day per sample.
    pub days: Vec<usize>,
    /// Ordered class names; `labels` index into this list.
    pub classes: Vec<String>,
}

impl RadarDataset {
    /// Build a dataset, checking that every per-sample array agrees on `N`.
    pub fn new(
        images: Array4<f32>,
        labels: Vec<usize>,
        days: Vec<usize>,
        classes: Vec<String>,
    ) -> Result<Self, DatasetError> {
        let n = images.len_of(Axis(0));
        if labels.len() != n {
            return Err(DatasetError::LengthMismatch { images: n, labels: labels.len() });
        }
        if days.len() != n {
            return Err(DatasetError::LengthMismatch { images: n, labels: days.len() });
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= classes.len()) {
            return Err(DatasetError::LabelOutOfRange { label: bad as i64, num_classes: classes.len() });
        }
        Ok(RadarDataset { images, labels, days, classes })
    }

    /// An empty dataset with images of shape `[H, W, C]`.
    pub fn empty(image_shape: (usize, usize, usize), classes: Vec<String>) -> Self {
        let (h, w, c) = image_shape;
        RadarDataset {
            images: Array4::zeros((0, h, w, c)),
            labels: Vec::new(),
            days: Vec::new(),
            classes,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// `true` when the dataset holds no samples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Shape `(H, W, C)` of a single image.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let s = self.images.shape();
        (s[1], s[2], s[3])
    }

    /// Samples at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> RadarDataset {
        RadarDataset {
            images: self.images.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            days: indices.iter().map(|&i| self.days[i]).collect(),
            classes: self.classes.clone(),
        }
    }

    /// Samples whose day satisfies `keep`.
    pub fn filter_days(&self, keep: impl Fn(usize) -> bool) -> RadarDataset {
        let idx: Vec<usize> = (0..self.len()).filter(|&i| keep(self.days[i])).collect();
        self.select(&idx)
    }

    /// Count of samples per class.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for &l in &self.labels {
            counts[l] += 1;
        }
        counts
    }

    /// One-hot labels `[N, num_classes]`.
    pub fn one_hot_labels(&self, num_classes: usize) -> Array2<f32> {
        one_hot(&self.labels, num_classes)
    }
}

/// One-hot encode class indices. Indices `>= num_classes` produce a zero row.
pub fn one_hot(labels: &[usize], num_classes: usize) -> Array2<f32> {
    let mut out = Array2::zeros((labels.len(), num_classes));
    for (row, &l) in labels.iter().enumerate() {
        if l < num_classes {
            out[[row, l]] = 1.0;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// RadarSource trait
// ---------------------------------------------------------------------------

/// One of the three additional recording sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetSite {
    /// Conference room.
    Conference,
    /// Server room.
    Server,
    /// Office.
    Office,
}

impl TargetSite {
    /// Sub-directory name under the data root.
    pub fn dir_name(self) -> &'static str {
        match self {
            TargetSite::Conference => "target_conf_data",
            TargetSite::Server => "target_server_data",
            TargetSite::Office => "target_office_data",
        }
    }
}

/// Common interface of all dataset providers.
pub trait RadarSource: Send + Sync {
    /// The labelled source-site dataset (all days).
    fn source(&self) -> Result<RadarDataset, DatasetError>;

    /// Raw data of an additional site, with its own class list.
    fn target_site(&self, site: TargetSite) -> Result<RadarDataset, DatasetError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// NpyDataset
// ---------------------------------------------------------------------------

/// Reads datasets stored as `samples.npy` / `labels.npy` / `classes.json`.
#[derive(Debug, Clone)]
pub struct NpyDataset {
    root: PathBuf,
}

impl NpyDataset {
    /// Provider rooted at `root` (the `data_dir`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        NpyDataset { root: root.into() }
    }

    /// Load the dataset stored in `dir`.
    pub fn load(dir: &Path) -> Result<RadarDataset, DatasetError> {
        if !dir.is_dir() {
            return Err(DatasetError::not_found(dir, "dataset directory does not exist"));
        }
        let classes = read_classes(&dir.join("classes.json"))?;

        let samples_path = dir.join("samples.npy");
        let file = open(&samples_path)?;
        let images = ndarray::ArrayD::<f32>::read_npy(file)
            .map_err(|e| DatasetError::npy_read(&samples_path, e.to_string()))?;
        let shape = images.shape().to_vec();
        let images = images.into_dimensionality::<ndarray::Ix4>().map_err(|_| {
            DatasetError::invalid_format(
                &samples_path,
                format!("expected [N, H, W, C], got {shape:?}"),
            )
        })?;

        let labels_path = dir.join("labels.npy");
        let file = open(&labels_path)?;
        let raw = Array2::<i64>::read_npy(file)
            .map_err(|e| DatasetError::npy_read(&labels_path, e.to_string()))?;
        if raw.ncols() < 2 {
            return Err(DatasetError::invalid_format(
                &labels_path,
                format!("expected [N, 2] (class, day), got {:?}", raw.shape()),
            ));
        }

        let mut labels = Vec::with_capacity(raw.nrows());
        let mut days = Vec::with_capacity(raw.nrows());
        for row in raw.rows() {
            let (class, day) = (row[0], row[1]);
            if class < 0 || class as usize >= classes.len() {
                return Err(DatasetError::LabelOutOfRange { label: class, num_classes: classes.len() });
            }
            if day < 0 {
                return Err(DatasetError::invalid_format(&labels_path, format!("negative day {day}")));
            }
            labels.push(class as usize);
            days.push(day as usize);
        }

        let ds = RadarDataset::new(images, labels, days, classes)?;
        debug!("Loaded {} samples of shape {:?} from {}", ds.len(), ds.image_shape(), dir.display());
        Ok(ds)
    }

    /// Write `ds` to `dir` in the layout read by [`NpyDataset::load`].
    pub fn save(dir: &Path, ds: &RadarDataset) -> Result<(), DatasetError> {
        std::fs::create_dir_all(dir).map_err(|e| DatasetError::io_error(dir, e))?;

        let samples_path = dir.join("samples.npy");
        let file = create(&samples_path)?;
        ds.images
            .write_npy(file)
            .map_err(|e| DatasetError::npy_read(&samples_path, e.to_string()))?;

        let labels_path = dir.join("labels.npy");
        let labels = Array2::from_shape_fn((ds.len(), 2), |(i, j)| {
            if j == 0 {
                ds.labels[i] as i64
            } else {
                ds.days[i] as i64
            }
        });
        let file = create(&labels_path)?;
        labels
            .write_npy(file)
            .map_err(|e| DatasetError::npy_read(&labels_path, e.to_string()))?;

        let classes_path = dir.join("classes.json");
        let json = serde_json::to_string_pretty(&ds.classes)
            .map_err(|e| DatasetError::invalid_format(&classes_path, e.to_string()))?;
        std::fs::write(&classes_path, json).map_err(|e| DatasetError::io_error(&classes_path, e))
    }
}

impl RadarSource for NpyDataset {
    fn source(&self) -> Result<RadarDataset, DatasetError> {
        NpyDataset::load(&self.root.join("source_data"))
    }

    fn target_site(&self, site: TargetSite) -> Result<RadarDataset, DatasetError> {
        NpyDataset::load(&self.root.join(site.dir_name()))
    }

    fn name(&self) -> &str {
        "NpyDataset"
    }
}

fn open(path: &Path) -> Result<std::fs::File, DatasetError> {
    if !path.exists() {
        return Err(DatasetError::not_found(path, "required file is missing"));
    }
    std::fs::File::open(path).map_err(|e| DatasetError::io_error(path, e))
}

fn create(path: &Path) -> Result<std::fs::File, DatasetError> {
    std::fs::File::create(path).map_err(|e| DatasetError::io_error(path, e))
}

fn read_classes(path: &Path) -> Result<Vec<String>, DatasetError> {
    let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DatasetError::not_found(path, "required file is missing"),
        _ => DatasetError::io_error(path, e),
    })?;
    serde_json::from_str(&contents).map_err(|e| DatasetError::invalid_format(path, e.to_string()))
}

// ---------------------------------------------------------------------------
// SyntheticDataset
// ---------------------------------------------------------------------------

/// Configuration for [`SyntheticDataset`].
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Number of classes. Default: **10**.
    pub num_classes: usize,
    /// Recording days of every site. Default: **6**.
    pub num_days: usize,
    /// Samples per class and day. Default: **8**.
    pub samples_per_class_day: usize,
    /// Image height. Default: **16**.
    pub height: usize,
    /// Image width. Default: **16**.
    pub width: usize,
    /// Image channels. Default: **2**.
    pub channels: usize,
    /// Noise amplitude. Default: **0.05**.
    pub noise: f32,
    /// Noise seed. Default: **7**.
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            num_classes: 10,
            num_days: 6,
            samples_per_class_day: 8,
            height: 16,
            width: 16,
            channels: 2,
            noise: 0.05,
            seed: 7,
        }
    }
}

/// Deterministic radar-like images.
///
/// Class `k` is a separable sinusoid of spatial frequency `k + 1`:
///
/// ```text
/// x[y, x, c] = gain · sin(2π(k+1)·x/W + c) · cos(2π(k+1)·y/H) + offset + noise
/// ```
///
/// `gain` and `offset` drift slowly with the day and jump per site, giving
/// each target a distribution shift while keeping classes separable.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    config: SyntheticConfig,
}

impl SyntheticDataset {
    /// Provider generating data with `config`.
    pub fn new(config: SyntheticConfig) -> Self {
        SyntheticDataset { config }
    }

    fn class_names(&self) -> Vec<String> {
        (0..self.config.num_classes).map(|k| format!("gesture_{k}")).collect()
    }

    fn generate(&self, site: u64, gain: f32, offset: f32) -> RadarDataset {
        let cfg = &self.config;
        let n = cfg.num_classes * cfg.num_days * cfg.samples_per_class_day;
        let mut rng = Xorshift64::new(cfg.seed.wrapping_add(site.wrapping_mul(0x9E37_79B9_7F4A_7C15)));

        let mut labels = Vec::with_capacity(n);
        let mut days = Vec::with_capacity(n);
        for day in 0..cfg.num_days {
            for class in 0..cfg.num_classes {
                for _ in 0..cfg.samples_per_class_day {
                    labels.push(class);
                    days.push(day);
                }
            }
        }

        let two_pi = 2.0 * std::f32::consts::PI;
        let (h, w) = (cfg.height as f32, cfg.width as f32);
        let mut images = Array4::<f32>::zeros((n, cfg.height, cfg.width, cfg.channels));
        for (i, mut img) in images.axis_iter_mut(Axis(0)).enumerate() {
            let freq = (labels[i] + 1) as f32;
            let drift = days[i] as f32 * 0.02;
            for ((y, x, c), v) in img.indexed_iter_mut() {
                let pattern = (two_pi * freq * x as f32 / w + c as f32).sin()
                    * (two_pi * freq * y as f32 / h).cos();
                let noise = rng.next_f32_range(-cfg.noise, cfg.noise);
                *v = (gain + drift) * pattern + offset + drift + noise;
            }
        }

        RadarDataset { images, labels, days, classes: self.class_names() }
    }
}

impl RadarSource for SyntheticDataset {
    fn source(&self) -> Result<RadarDataset, DatasetError> {
        Ok(self.generate(0, 1.0, 0.0))
    }

    fn target_site(&self, site: TargetSite) -> Result<RadarDataset, DatasetError> {
        let (id, gain, offset) = match site {
            TargetSite::Conference => (1, 0.8, 0.3),
            TargetSite::Server => (2, 1.3, -0.2),
            TargetSite::Office => (3, 0.6, 0.5),
        };
        let mut ds = self.generate(id, gain, offset);
        // Site class lists are stored in reverse order to exercise remapping.
        ds.classes.reverse();
        let k = ds.classes.len();
        for l in ds.labels.iter_mut() {
            *l = k - 1 - *l;
        }
        Ok(ds)
    }

    fn name(&self) -> &str {
        "SyntheticDataset"
    }
}

// ---------------------------------------------------------------------------
// Balancing / splitting
// ---------------------------------------------------------------------------

/// Keep at most `max_per_class` samples of every `(class, day)` pair over the
/// first `num_days` days, in file order. Later days are dropped.
pub fn balance_dataset(ds: &RadarDataset, num_days: usize, max_per_class: usize) -> RadarDataset {
    cap_per_class_day(&ds.filter_days(|d| d < num_days), max_per_class)
}

/// Keep at most `cap` samples of every `(class, day)` pair, in file order.
pub fn cap_per_class_day(ds: &RadarDataset, cap: usize) -> RadarDataset {
    let mut seen: HashMap<(usize, usize), usize> = HashMap::new();
    let keep: Vec<usize> = (0..ds.len())
        .filter(|&i| {
            let count = seen.entry((ds.labels[i], ds.days[i])).or_insert(0);
            *count += 1;
            *count <= cap
        })
        .collect();
    ds.select(&keep)
}

/// Split into `(train, test)` so that every class contributes
/// `round(count · test_fraction)` samples to the test split.
///
/// Both splits are shuffled with a PRNG seeded by `seed`.
pub fn stratified_split(ds: &RadarDataset, test_fraction: f64, seed: u64) -> (RadarDataset, RadarDataset) {
    let mut rng = Xorshift64::new(seed);
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); ds.classes.len()];
    for (i, &l) in ds.labels.iter().enumerate() {
        by_class[l].push(i);
    }

    let mut train = Vec::new();
    let mut test = Vec::new();
    for mut idx in by_class {
        rng.shuffle(&mut idx);
        let n_test = (idx.len() as f64 * test_fraction).round() as usize;
        test.extend_from_slice(&idx[..n_test]);
        train.extend_from_slice(&idx[n_test..]);
    }
    rng.shuffle(&mut train);
    rng.shuffle(&mut test);
    (ds.select(&train), ds.select(&test))
}

/// Relabel `site` onto the class indices of `classes` by name.
pub fn remap_classes(site: &RadarDataset, classes: &[String], path: &Path) -> Result<RadarDataset, DatasetError> {
    let mut mapping = Vec::with_capacity(site.classes.len());
    for name in &site.classes {
        match classes.iter().position(|c| c == name) {
            Some(idx) => mapping.push(idx),
            None => return Err(DatasetError::UnknownClass { name: name.clone(), path: path.to_path_buf() }),
        }
    }
    let mut out = site.clone();
    out.labels = site.labels.iter().map(|&l| mapping[l]).collect();
    out.classes = classes.to_vec();
    Ok(out)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Per-pixel mean centring followed by global min / peak-to-peak scaling.
///
/// ```text
/// x' = (x − mean[h, w, c] − min) / ptp
/// ```
#[derive(Debug, Clone)]
pub struct NormStats {
    /// Per-pixel mean `[H, W, C]`.
    pub mean: Array3<f32>,
    /// Minimum of the centred training images.
    pub min: f32,
    /// Peak-to-peak range of the centred training images (1 when constant).
    pub ptp: f32,
}

impl NormStats {
    /// Fit on `images` `[N, H, W, C]`. Returns `None` when `N == 0`.
    pub fn fit(images: &Array4<f32>) -> Option<Self> {
        let mean = images.mean_axis(Axis(0))?;
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for img in images.axis_iter(Axis(0)) {
            for (v, m) in img.iter().zip(mean.iter()) {
                let centred = v - m;
                min = min.min(centred);
                max = max.max(centred);
            }
        }
        let ptp = if max > min { max - min } else { 1.0 };
        Some(NormStats { mean, min, ptp })
    }

    /// Normalize `images` in place.
    pub fn apply(&self, images: &mut Array4<f32>) {
        for mut img in images.axis_iter_mut(Axis(0)) {
            img -= &self.mean;
        }
        let (min, ptp) = (self.min, self.ptp);
        images.mapv_inplace(|v| (v - min) / ptp);
    }
}

/// Normalize a `(train, test)` pair with statistics fitted on `train`, or with
/// `fallback` when `train` is empty. Returns the statistics used.
pub fn normalize_pair(train: &mut RadarDataset, test: &mut RadarDataset, fallback: &NormStats) -> NormStats {
    let stats = match NormStats::fit(&train.images) {
        Some(s) => s,
        None => {
            warn!("Empty training split; normalizing its test split with source statistics");
            fallback.clone()
        }
    };
    stats.apply(&mut train.images);
    stats.apply(&mut test.images);
    stats
}

// ---------------------------------------------------------------------------
// prepare
// ---------------------------------------------------------------------------

/// The normalized splits consumed by a training run.
#[derive(Debug, Clone)]
pub struct PreparedData {
    /// Normalized source training split.
    pub source_train: RadarDataset,
    /// Source held-out split, normalized with `source_stats`.
    pub source_test: RadarDataset,
    /// Unlabelled (for the losses) target training set.
    pub target_train: RadarDataset,
    /// Held-out set of the active target context.
    pub target_eval: RadarDataset,
    /// Which target the run adapts to.
    pub context: TargetContext,
    /// Statistics fitted on `source_train`.
    pub source_stats: NormStats,
}

impl PreparedData {
    /// Class names shared by every split.
    pub fn classes(&self) -> &[String] {
        &self.source_train.classes
    }

    /// Per-sample `(H, W, C)`.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        self.source_train.image_shape()
    }
}

/// Load, balance, split and normalize all data for `cfg`.
///
/// - Source: balanced, days `< train_src_days`, stratified 90/10 split.
/// - Time target: source-site days `[src, src + trg)` train, the rest test.
/// - Site targets: remapped by class name, days `< n` train, capped per class
///   and day by `target_max`.
/// - `val`: the target training set is split 2/3 : 1/3 and the third becomes
///   the evaluation set.
///
/// Only the active target's data is loaded.
pub fn prepare(provider: &dyn RadarSource, cfg: &TrainingConfig) -> Result<PreparedData, DatasetError> {
    let context = cfg.target_context().ok_or_else(|| {
        DatasetError::invalid_format(&cfg.data_dir, "no target set has training days")
    })?;

    let all = provider.source()?;
    if all.classes.len() != cfg.num_classes {
        return Err(DatasetError::invalid_format(
            &cfg.data_dir,
            format!("dataset has {} classes, config expects {}", all.classes.len(), cfg.num_classes),
        ));
    }
    let balanced = balance_dataset(&all, cfg.balance_days, cfg.max_samples_per_class);
    info!(
        "Source '{}': {} samples, {} after balancing",
        provider.name(),
        all.len(),
        balanced.len()
    );

    let src_days = cfg.train_src_days;
    let (mut source_train, mut source_test) = stratified_split(
        &balanced.filter_days(|d| d < src_days),
        SOURCE_TEST_FRACTION,
        cfg.seed,
    );
    if source_train.is_empty() {
        return Err(DatasetError::EmptyStream {
            stream: "source".into(),
            samples: 0,
            batch_size: cfg.batch_size,
        });
    }
    let source_stats = NormStats::fit(&source_train.images).ok_or_else(|| {
        DatasetError::invalid_format(&cfg.data_dir, "cannot fit normalization on zero samples")
    })?;
    source_stats.apply(&mut source_train.images);
    source_stats.apply(&mut source_test.images);
    debug!("Source train class counts: {}", describe_counts(&source_train));

    let (mut target_train, mut target_test) = match active_site(cfg) {
        None => {
            let end = src_days + cfg.train_trg_days;
            (
                balanced.filter_days(|d| d >= src_days && d < end),
                balanced.filter_days(|d| d >= end),
            )
        }
        Some((site, train_days)) => {
            let raw = provider.target_site(site)?;
            let path = cfg.data_dir.join(site.dir_name());
            let site_ds = remap_classes(&raw, &all.classes, &path)?;
            let mut train = site_ds.filter_days(|d| d < train_days);
            if let Some(cap) = cfg.target_max {
                train = cap_per_class_day(&train, cap);
            }
            (train, site_ds.filter_days(|d| d >= train_days))
        }
    };
    normalize_pair(&mut target_train, &mut target_test, &source_stats);

    let (target_train, target_eval) = if context == TargetContext::Validation {
        stratified_split(&target_train, VALIDATION_FRACTION, cfg.seed)
    } else {
        (target_train, target_test)
    };

    info!(
        "Splits: source train {} / test {}, target train {} / eval {} ({})",
        source_train.len(),
        source_test.len(),
        target_train.len(),
        target_eval.len(),
        context.scalar_name()
    );

    Ok(PreparedData { source_train, source_test, target_train, target_eval, context, source_stats })
}

fn active_site(cfg: &TrainingConfig) -> Option<(TargetSite, usize)> {
    if cfg.train_trg_days > 0 {
        None
    } else if cfg.train_ser_days > 0 {
        Some((TargetSite::Server, cfg.train_ser_days))
    } else if cfg.train_con_days > 0 {
        Some((TargetSite::Conference, cfg.train_con_days))
    } else if cfg.train_off_days > 0 {
        Some((TargetSite::Office, cfg.train_off_days))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// One mini-batch on the host.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Images `[B, H, W, C]`.
    pub images: Array4<f32>,
    /// One-hot labels `[B, K]`.
    pub labels: Array2<f32>,
}

impl Batch {
    fn gather(ds: &RadarDataset, indices: &[usize], num_classes: usize) -> Batch {
        let labels: Vec<usize> = indices.iter().map(|&i| ds.labels[i]).collect();
        Batch { images: ds.images.select(Axis(0), indices), labels: one_hot(&labels, num_classes) }
    }

    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.labels.nrows()
    }

    /// `true` for a batch without samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(images, labels)` as float tensors on `device`.
    pub fn to_tensors(&self, device: Device) -> (Tensor, Tensor) {
        (array_to_tensor(&self.images, device), array2_to_tensor(&self.labels, device))
    }
}

/// Copy a host image batch into a tensor of the same shape.
pub fn array_to_tensor(images: &Array4<f32>, device: Device) -> Tensor {
    let shape: Vec<i64> = images.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<f32> = images.iter().copied().collect();
    Tensor::from_slice(&data).view(shape.as_slice()).to_kind(Kind::Float).to_device(device)
}

fn array2_to_tensor(arr: &Array2<f32>, device: Device) -> Tensor {
    let data: Vec<f32> = arr.iter().copied().collect();
    Tensor::from_slice(&data)
        .view([arr.nrows() as i64, arr.ncols() as i64])
        .to_device(device)
}

// ---------------------------------------------------------------------------
// TrainStream
// ---------------------------------------------------------------------------

/// Shuffled, remainder-dropping training batches with one-batch prefetch.
#[derive(Debug, Clone)]
pub struct TrainStream {
    name: String,
    data: Arc<RadarDataset>,
    num_classes: usize,
    batch_size: usize,
    augment: bool,
    seed: u64,
}

impl TrainStream {
    /// Stream over `data`; `augment` enables random affine augmentation.
    pub fn new(
        name: impl Into<String>,
        data: RadarDataset,
        num_classes: usize,
        batch_size: usize,
        augment: bool,
        seed: u64,
    ) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        TrainStream { name: name.into(), data: Arc::new(data), num_classes, batch_size, augment, seed }
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Samples in the underlying split.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` when the split is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Full batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.data.len() / self.batch_size
    }

    /// Start producing the batches of `epoch` on a background thread.
    ///
    /// The order is a fresh permutation seeded with `seed + epoch`. Dropping
    /// the returned iterator stops the producer.
    pub fn epoch(&self, epoch: usize) -> Prefetch {
        let (tx, rx) = mpsc::sync_channel(1);
        let data = Arc::clone(&self.data);
        let (num_classes, batch_size, augment) = (self.num_classes, self.batch_size, self.augment);
        let seed = self.seed.wrapping_add(epoch as u64);

        let handle = thread::spawn(move || {
            let mut rng = Xorshift64::new(seed);
            let mut order: Vec<usize> = (0..data.len()).collect();
            rng.shuffle(&mut order);
            let mut augmentor = augment.then(|| Augmentor::new(Xorshift64::new(rng.next_u64())));

            for chunk in order.chunks_exact(batch_size) {
                let mut batch = Batch::gather(&data, chunk, num_classes);
                if let Some(aug) = augmentor.as_mut() {
                    aug.augment_batch(&mut batch.images);
                }
                if tx.send(batch).is_err() {
                    break;
                }
            }
        });

        Prefetch { rx: Some(rx), handle: Some(handle) }
    }
}

/// Iterator over the batches produced by [`TrainStream::epoch`].
#[derive(Debug)]
pub struct Prefetch {
    rx: Option<Receiver<Batch>>,
    handle: Option<JoinHandle<()>>,
}

impl Iterator for Prefetch {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        // Closing the receiver unblocks a producer waiting on `send`.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Batch producer thread panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EvalStream
// ---------------------------------------------------------------------------

/// Fixed-order evaluation batches; the final partial batch is kept.
#[derive(Debug, Clone, Copy)]
pub struct EvalStream<'a> {
    data: &'a RadarDataset,
    num_classes: usize,
    batch_size: usize,
}

impl<'a> EvalStream<'a> {
    /// Batches of `batch_size` over `data` in file order.
    pub fn new(data: &'a RadarDataset, num_classes: usize, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        EvalStream { data, num_classes, batch_size }
    }

    /// Batches per pass, counting the final partial batch.
    pub fn num_batches(&self) -> usize {
        self.data.len().div_ceil(self.batch_size)
    }

    /// Samples per pass.
    pub fn num_samples(&self) -> usize {
        self.data.len()
    }

    /// One pass over the data.
    pub fn iter(&self) -> impl Iterator<Item = Batch> + 'a {
        let (data, num_classes, batch_size) = (self.data, self.num_classes, self.batch_size);
        (0..self.num_batches()).map(move |b| {
            let end = ((b + 1) * batch_size).min(data.len());
            let indices: Vec<usize> = (b * batch_size..end).collect();
            Batch::gather(data, &indices, num_classes)
        })
    }
}

/// Per-class counts as a one-line string for logs.
pub fn describe_counts(ds: &RadarDataset) -> String {
    let counts = Array1::from(ds.class_counts());
    format!("{counts}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn small_synth() -> SyntheticDataset {
        SyntheticDataset::new(SyntheticConfig {
            num_classes: 3,
            num_days: 5,
            samples_per_class_day: 4,
            height: 8,
            width: 8,
            channels: 1,
            ..Default::default()
        })
    }

    fn small_cfg() -> TrainingConfig {
        TrainingConfig { num_classes: 3, batch_size: 4, ..Default::default() }
    }

    #[test]
    fn synthetic_source_shapes_and_labels() {
        let ds = small_synth().source().unwrap();
        assert_eq!(ds.len(), 3 * 5 * 4);
        assert_eq!(ds.image_shape(), (8, 8, 1));
        assert_eq!(ds.class_counts(), vec![20, 20, 20]);
    }

    #[test]
    fn synthetic_is_deterministic() {
        let a = small_synth().source().unwrap();
        let b = small_synth().source().unwrap();
        assert_eq!(a.images, b.images);
    }

    #[test]
    fn balancing_caps_class_day_pairs() {
        let ds = small_synth().source().unwrap();
        let balanced = balance_dataset(&ds, 3, 2);
        assert_eq!(balanced.len(), 3 * 3 * 2);
        assert!(balanced.days.iter().all(|&d| d < 3));
    }

    #[test]
    fn stratified_split_preserves_proportions() {
        let ds = small_synth().source().unwrap();
        let (train, test) = stratified_split(&ds, 0.25, 42);
        assert_eq!(train.len() + test.len(), ds.len());
        assert_eq!(test.class_counts(), vec![5, 5, 5]);
        assert_eq!(train.class_counts(), vec![15, 15, 15]);
    }

    #[test]
    fn stratified_split_is_seeded() {
        let ds = small_synth().source().unwrap();
        let (a, _) = stratified_split(&ds, 0.25, 42);
        let (b, _) = stratified_split(&ds, 0.25, 42);
        let (c, _) = stratified_split(&ds, 0.25, 43);
        assert_eq!(a.labels, b.labels);
        assert_ne!(a.images, c.images);
    }

    #[test]
    fn remap_uses_class_names() {
        let synth = small_synth();
        let src = synth.source().unwrap();
        let site = synth.target_site(TargetSite::Office).unwrap();
        let remapped = remap_classes(&site, &src.classes, Path::new("x")).unwrap();
        // First site sample is source class 0 stored under a reversed index.
        assert_eq!(site.labels[0], 2);
        assert_eq!(remapped.labels[0], 0);
    }

    #[test]
    fn remap_rejects_unknown_class() {
        let synth = small_synth();
        let mut site = synth.target_site(TargetSite::Server).unwrap();
        site.classes[0] = "unknown".into();
        let src = synth.source().unwrap();
        assert!(matches!(
            remap_classes(&site, &src.classes, Path::new("x")),
            Err(DatasetError::UnknownClass { .. })
        ));
    }

    #[test]
    fn norm_stats_map_training_set_to_unit_range() {
        let ds = small_synth().source().unwrap();
        let mut images = ds.images.clone();
        let stats = NormStats::fit(&images).unwrap();
        stats.apply(&mut images);
        let min = images.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = images.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert_abs_diff_eq!(min, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(max, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn norm_stats_of_empty_set_is_none() {
        assert!(NormStats::fit(&Array4::zeros((0, 2, 2, 1))).is_none());
    }

    #[test]
    fn empty_target_train_uses_fallback_stats() {
        let ds = small_synth().source().unwrap();
        let fallback = NormStats::fit(&ds.images).unwrap();
        let mut train = RadarDataset::empty((8, 8, 1), ds.classes.clone());
        let mut test = ds.select(&[0, 1, 2]);
        let mut expected = test.images.clone();
        fallback.apply(&mut expected);

        let used = normalize_pair(&mut train, &mut test, &fallback);
        assert_eq!(used.min, fallback.min);
        assert_eq!(test.images, expected);
    }

    #[test]
    fn prepare_time_target_splits_by_day() {
        let cfg = small_cfg();
        let data = prepare(&small_synth(), &cfg).unwrap();
        assert_eq!(data.context, TargetContext::Time(1));
        assert!(data.target_train.days.iter().all(|&d| d == 3));
        assert!(data.target_eval.days.iter().all(|&d| d >= 4));
        assert_eq!(data.source_train.len() + data.source_test.len(), 3 * 3 * 4);
    }

    #[test]
    fn prepare_site_target_with_cap() {
        let mut cfg = small_cfg();
        cfg.train_trg_days = 0;
        cfg.train_con_days = 2;
        cfg.target_max = Some(1);
        let data = prepare(&small_synth(), &cfg).unwrap();
        assert_eq!(data.context, TargetContext::Conference(2));
        assert_eq!(data.target_train.len(), 3 * 2);
        assert_eq!(data.target_eval.len(), 3 * 3 * 4);
    }

    #[test]
    fn prepare_val_mode_holds_out_a_third() {
        let mut cfg = small_cfg();
        cfg.train_trg_days = 0;
        cfg.train_ser_days = 3;
        cfg.val = true;
        let data = prepare(&small_synth(), &cfg).unwrap();
        assert_eq!(data.context, TargetContext::Validation);
        assert_eq!(data.target_train.len() + data.target_eval.len(), 3 * 3 * 4);
        assert_eq!(data.target_eval.class_counts(), vec![4, 4, 4]);
    }

    #[test]
    fn npy_round_trip_through_disk() {
        let tmp = tempdir().unwrap();
        let ds = small_synth().source().unwrap().select(&[0, 5, 30]);
        NpyDataset::save(tmp.path(), &ds).unwrap();
        let loaded = NpyDataset::load(tmp.path()).unwrap();
        assert_eq!(loaded.images, ds.images);
        assert_eq!(loaded.labels, ds.labels);
        assert_eq!(loaded.days, ds.days);
        assert_eq!(loaded.classes, ds.classes);
    }

    #[test]
    fn npy_missing_directory_is_not_found() {
        let tmp = tempdir().unwrap();
        let err = NpyDataset::load(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, DatasetError::DataNotFound { .. }));
    }

    #[test]
    fn train_stream_drops_remainder() {
        let ds = small_synth().source().unwrap().select(&(0..10).collect::<Vec<_>>());
        let stream = TrainStream::new("src", ds, 3, 4, false, 42);
        assert_eq!(stream.num_batches(), 2);
        let batches: Vec<Batch> = stream.epoch(0).collect();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 4));
    }

    #[test]
    fn train_stream_reshuffles_per_epoch() {
        let ds = small_synth().source().unwrap();
        let stream = TrainStream::new("src", ds, 3, 8, false, 42);
        let first: Vec<Batch> = stream.epoch(0).collect();
        let again: Vec<Batch> = stream.epoch(0).collect();
        let second: Vec<Batch> = stream.epoch(1).collect();
        assert_eq!(first[0].images, again[0].images);
        assert_ne!(first[0].images, second[0].images);
    }

    #[test]
    fn dropping_prefetch_early_stops_producer() {
        let ds = small_synth().source().unwrap();
        let stream = TrainStream::new("src", ds, 3, 2, true, 1);
        let mut it = stream.epoch(0);
        assert!(it.next().is_some());
        drop(it);
    }

    #[test]
    fn eval_stream_keeps_partial_batch_in_order() {
        let ds = small_synth().source().unwrap().select(&[0, 1, 2, 3, 4]);
        let stream = EvalStream::new(&ds, 3, 2);
        let sizes: Vec<usize> = stream.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let first = stream.iter().next().unwrap();
        assert_eq!(first.images.index_axis(Axis(0), 0), ds.images.index_axis(Axis(0), 0));
    }

    #[test]
    fn batch_tensors_have_matching_shapes() {
        let ds = small_synth().source().unwrap().select(&[0, 1]);
        let batch = Batch::gather(&ds, &[0, 1], 3);
        let (x, y) = batch.to_tensors(Device::Cpu);
        assert_eq!(x.size(), vec![2, 8, 8, 1]);
        assert_eq!(y.size(), vec![2, 3]);
        assert_eq!(y.sum(Kind::Float).double_value(&[]), 2.0);
    }
}
