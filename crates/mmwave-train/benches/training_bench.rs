//! Benchmarks for the CDAN training pipeline.
//!
//! All benchmark inputs come from the seeded [`SyntheticDataset`], so numbers
//! are reproducible run to run.
//!
//! Run with:
//!
//! ```bash
//! cargo bench -p mmwave-train
//! ```
//!
//! Criterion HTML reports are written to `target/criterion/`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mmwave_train::{
    augment::{Augmentor, Xorshift64},
    config::{Method, TrainingConfig},
    dataset::{prepare, NormStats, RadarSource, SyntheticConfig, SyntheticDataset, TrainStream},
    trainer::TrainingSession,
};

// ─────────────────────────────────────────────────────────────────────────────
// Host-side preprocessing
// ─────────────────────────────────────────────────────────────────────────────

/// Fit and apply normalization statistics on a 480-sample source set.
fn bench_normalize(c: &mut Criterion) {
    let ds = SyntheticDataset::new(SyntheticConfig::default()).source().unwrap();

    c.bench_function("normalize_fit_apply_480", |b| {
        b.iter(|| {
            let mut images = ds.images.clone();
            let stats = NormStats::fit(black_box(&images)).unwrap();
            stats.apply(&mut images);
            images
        });
    });
}

/// Random affine augmentation of one batch for growing batch sizes.
fn bench_augment(c: &mut Criterion) {
    let ds = SyntheticDataset::new(SyntheticConfig::default()).source().unwrap();
    let mut group = c.benchmark_group("augment_batch");

    for batch_size in [16_usize, 64] {
        let batch = ds.images.slice(ndarray::s![..batch_size, .., .., ..]).to_owned();
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, _| {
            let mut aug = Augmentor::new(Xorshift64::new(1));
            b.iter(|| {
                let mut images = batch.clone();
                aug.augment_batch(black_box(&mut images));
                images
            });
        });
    }
    group.finish();
}

/// One prefetched epoch of shuffled, augmented batches.
fn bench_stream_epoch(c: &mut Criterion) {
    let ds = SyntheticDataset::new(SyntheticConfig::default()).source().unwrap();
    let stream = TrainStream::new("source", ds, 10, 64, true, 42);

    c.bench_function("train_stream_epoch_augmented", |b| {
        let mut epoch = 0;
        b.iter(|| {
            epoch += 1;
            stream.epoch(epoch).count()
        });
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Training
// ─────────────────────────────────────────────────────────────────────────────

/// One full CDAN-E_AMCA optimizer step on a small backbone.
fn bench_train_step(c: &mut Criterion) {
    let tmp = std::env::temp_dir().join("mmwave-train-bench");
    let cfg = TrainingConfig {
        method: Method::CdanEAmca,
        num_features: 32,
        model_filters: 8,
        disc_hidden: 32,
        block_layout: vec![1, 1],
        batch_size: 32,
        save_freq: 0,
        log_dir: tmp,
        ..Default::default()
    };
    let data = prepare(&SyntheticDataset::new(SyntheticConfig::default()), &cfg).unwrap();
    let source = TrainStream::new("source", data.source_train.clone(), 10, 32, false, 0);
    let target = TrainStream::new("target", data.target_train.clone(), 10, 32, false, 1);
    let src = source.epoch(0).next().unwrap();
    let tgt = target.epoch(0).next().unwrap();

    let mut session = TrainingSession::new(cfg, data).unwrap();
    session.begin_epoch(1);

    c.bench_function("train_step_cdan_e_amca_b32", |b| {
        b.iter(|| session.train_step(black_box(&src), black_box(&tgt)).unwrap());
    });
}

fn bench_config_validate(c: &mut Criterion) {
    let cfg = TrainingConfig::default();
    c.bench_function("config_validate", |b| {
        b.iter(|| black_box(&cfg).validate().is_ok());
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Criterion registration
// ─────────────────────────────────────────────────────────────────────────────

criterion_group!(
    benches,
    bench_normalize,
    bench_augment,
    bench_stream_epoch,
    bench_train_step,
    bench_config_validate,
);

criterion_main!(benches);
