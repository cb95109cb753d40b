//! Benchmarks for the domain-adaptation train and test steps.
//!
//! Batches come from the deterministic synthetic dataset, so the inputs are
//! identical across runs.
//!
//! Run with:
//!
//! ```bash
//! cargo bench -p msda-train
//! ```
//!
//! Criterion HTML reports are written to `target/criterion/`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use msda_train::{
    config::{Paradigm, StepConfig},
    dataset::{BalancedLoader, DomainDataset, SyntheticConfig, SyntheticDomainDataset, TestLoader},
    model::{ConvBackboneFactory, DenseTopFactory},
    steps::{build_test_step, build_train_step},
    SelfEnsemblingPreprocessor,
};
use tch::Device;

fn bench_config(paradigm: Paradigm) -> StepConfig {
    StepConfig {
        paradigm,
        backbone: "mlp".into(),
        image_size: 16,
        image_channels: 3,
        batch_size: 8,
        ..StepConfig::default()
    }
}

fn bench_dataset(cfg: &StepConfig) -> SyntheticDomainDataset {
    SyntheticDomainDataset::new(
        cfg.domains.clone(),
        SyntheticConfig {
            num_classes: cfg.num_classes,
            image_size: cfg.image_size,
            channels: cfg.image_channels,
            samples_per_domain: 32,
            ..SyntheticConfig::default()
        },
    )
    .expect("synthetic dataset")
}

fn factories(cfg: &StepConfig) -> (ConvBackboneFactory, DenseTopFactory) {
    let dim = ConvBackboneFactory::feature_dim(&cfg.backbone).expect("known backbone");
    (
        ConvBackboneFactory::new(cfg.image_channels as i64, Device::Cpu),
        DenseTopFactory::new(dim, 64, Device::Cpu),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Train steps
// ─────────────────────────────────────────────────────────────────────────────

/// One `train` call per paradigm on a fixed balanced batch.
fn bench_train_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("train_step");
    for paradigm in [
        Paradigm::Source,
        Paradigm::Dann,
        Paradigm::M3sda,
        Paradigm::SelfEnsembling,
        Paradigm::DomainClassifier,
    ] {
        let cfg = bench_config(paradigm);
        let ds = bench_dataset(&cfg);
        let (bf, tf) = factories(&cfg);
        let mut step = build_train_step(&cfg, &bf, &tf).expect("train step");
        let mut loader = BalancedLoader::new(&ds, cfg.batch_size, cfg.seed, Device::Cpu).expect("loader");
        let mut batch = loader.next_batch().expect("batch");
        if paradigm == Paradigm::SelfEnsembling {
            SelfEnsemblingPreprocessor::default().apply(&mut batch).expect("augment");
        }

        group.bench_with_input(BenchmarkId::new("paradigm", paradigm), &batch, |b, batch| {
            b.iter(|| step.train(black_box(batch)).expect("train"));
        });
    }
    group.finish();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test step and data pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// One pass of the source test step over the target domain.
fn bench_test_pass(c: &mut Criterion) {
    let cfg = bench_config(Paradigm::Source);
    let ds = bench_dataset(&cfg);
    let (bf, tf) = factories(&cfg);
    let mut step = build_test_step(&cfg, &bf, &tf).expect("test step");
    let target = cfg.domains[cfg.n_sources()].clone();
    let loader = TestLoader::new(&ds, &target, cfg.batch_size, Device::Cpu).expect("loader");

    c.bench_function("test_pass_target", |b| {
        b.iter(|| {
            for batch in loader.iter() {
                let _ = step.test(&batch.expect("batch")).expect("test");
            }
        });
    });
}

/// Synthetic sample generation and balanced collation.
fn bench_balanced_loader(c: &mut Criterion) {
    let cfg = bench_config(Paradigm::Source);
    let ds = bench_dataset(&cfg);

    c.bench_function("synthetic_get", |b| {
        b.iter(|| ds.get(black_box("clipart"), black_box(7)).expect("sample"));
    });

    let mut loader = BalancedLoader::new(&ds, cfg.batch_size, cfg.seed, Device::Cpu).expect("loader");
    c.bench_function("balanced_next_batch", |b| {
        b.iter(|| loader.next_batch().expect("batch"));
    });
}

criterion_group!(benches, bench_train_step, bench_test_pass, bench_balanced_loader);
criterion_main!(benches);
