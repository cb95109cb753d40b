//! Integration tests for [`msda_train::checkpoint`].
//!
//! Checkpoints are written to temporary directories; restored steps must
//! reproduce the saved weights and iteration exactly.

use msda_train::checkpoint::{
    model_path, read_manifest, restore_test_step, restore_train_step, save_train_step,
    MANIFEST_FILE,
};
use msda_train::config::{Paradigm, StepConfig};
use msda_train::dataset::{BalancedLoader, SyntheticConfig, SyntheticDomainDataset};
use msda_train::model::{ConvBackboneFactory, DenseTopFactory, Model};
use msda_train::steps::{build_test_step, build_train_step};
use msda_train::{SelfEnsemblingPreprocessor, TrainError};
use tch::Device;
use tempfile::TempDir;

fn config(paradigm: Paradigm) -> StepConfig {
    StepConfig {
        paradigm,
        domains: vec!["a".into(), "b".into(), "t".into()],
        num_classes: 3,
        backbone: "mlp".into(),
        image_size: 8,
        image_channels: 1,
        batch_size: 2,
        ..StepConfig::default()
    }
}

fn factories() -> (ConvBackboneFactory, DenseTopFactory) {
    let dim = ConvBackboneFactory::feature_dim("mlp").expect("known backbone");
    (ConvBackboneFactory::new(1, Device::Cpu), DenseTopFactory::new(dim, 8, Device::Cpu))
}

fn weights_equal(a: &Model, b: &Model) -> bool {
    let va = a.var_store().variables();
    let vb = b.var_store().variables();
    va.len() == vb.len()
        && va
            .iter()
            .all(|(name, t)| vb.get(name).map(|u| t.equal(u)).unwrap_or(false))
}

fn dataset(cfg: &StepConfig) -> SyntheticDomainDataset {
    SyntheticDomainDataset::new(
        cfg.domains.clone(),
        SyntheticConfig {
            num_classes: cfg.num_classes,
            image_size: cfg.image_size,
            channels: cfg.image_channels,
            samples_per_domain: 8,
            ..SyntheticConfig::default()
        },
    )
    .expect("dataset")
}

/// Train `steps` iterations of `cfg` and save into a fresh directory.
fn trained_checkpoint(cfg: &StepConfig, steps: usize) -> (TempDir, Box<dyn msda_train::TrainStep>) {
    let (bf, tf) = factories();
    let mut step = build_train_step(cfg, &bf, &tf).expect("train step");
    let ds = dataset(cfg);
    let mut loader = BalancedLoader::new(&ds, cfg.batch_size, 1, Device::Cpu).expect("loader");
    for _ in 0..steps {
        let mut batch = loader.next_batch().expect("batch");
        if cfg.paradigm == Paradigm::SelfEnsembling {
            SelfEnsemblingPreprocessor::default().apply(&mut batch).expect("augment");
        }
        step.train(&batch).expect("train");
    }
    let tmp = TempDir::new().expect("tempdir");
    save_train_step(step.as_ref(), tmp.path()).expect("save");
    (tmp, step)
}

/// The manifest records paradigm, iteration and every model name.
#[test]
fn save_writes_manifest_and_weights() {
    let cfg = config(Paradigm::Dann);
    let (tmp, _) = trained_checkpoint(&cfg, 2);
    assert!(tmp.path().join(MANIFEST_FILE).is_file());
    let manifest = read_manifest(tmp.path()).expect("manifest");
    assert_eq!(manifest.paradigm, Paradigm::Dann);
    assert_eq!(manifest.iteration, 2);
    assert_eq!(manifest.models, vec!["backbone", "top", "discriminator"]);
    for name in &manifest.models {
        assert!(model_path(tmp.path(), name).is_file(), "missing weights for {name}");
    }
}

/// A fresh train step restored from disk matches the saved one.
#[test]
fn restore_train_step_round_trip() {
    let cfg = config(Paradigm::M3sda);
    let (tmp, saved) = trained_checkpoint(&cfg, 3);
    let (bf, tf) = factories();
    let mut fresh = build_train_step(&cfg, &bf, &tf).expect("train step");
    restore_train_step(fresh.as_mut(), tmp.path()).expect("restore");
    assert_eq!(fresh.iteration(), 3);
    for (a, b) in saved.models().iter().zip(fresh.models()) {
        assert_eq!(a.name(), b.name());
        assert!(weights_equal(a, b), "weights of `{}` differ after restore", a.name());
    }
}

/// The self-ensembling test step restores the EMA teacher only.
#[test]
fn restore_test_step_loads_teacher() {
    let cfg = config(Paradigm::SelfEnsembling);
    let (tmp, saved) = trained_checkpoint(&cfg, 2);
    let (bf, tf) = factories();
    let mut test = build_test_step(&cfg, &bf, &tf).expect("test step");
    restore_test_step(test.as_mut(), tmp.path()).expect("restore");
    assert_eq!(test.iteration(), 0, "test steps keep their own counter");

    let saved_models = saved.models();
    for model in test.models() {
        let source = saved_models
            .iter()
            .find(|m| m.name() == model.name())
            .expect("test model must exist in the train step");
        assert!(model.name().starts_with("teacher_"));
        assert!(weights_equal(source, model), "`{}` not restored", model.name());
    }
}

/// Restoring into a step of another paradigm is refused.
#[test]
fn restore_rejects_paradigm_mismatch() {
    let (tmp, _) = trained_checkpoint(&config(Paradigm::Source), 1);
    let cfg = config(Paradigm::Dann);
    let (bf, tf) = factories();
    let mut other = build_train_step(&cfg, &bf, &tf).expect("train step");
    let err = restore_train_step(other.as_mut(), tmp.path()).expect_err("must fail");
    assert!(matches!(err, TrainError::Checkpoint { .. }), "got {err:?}");
    assert_eq!(other.iteration(), 0);
}

/// A missing weight file aborts the restore before anything is loaded.
#[test]
fn restore_rejects_missing_weights() {
    let cfg = config(Paradigm::Source);
    let (tmp, _) = trained_checkpoint(&cfg, 1);
    std::fs::remove_file(model_path(tmp.path(), "top")).expect("remove top weights");

    let (bf, tf) = factories();
    let mut fresh = build_train_step(&cfg, &bf, &tf).expect("train step");
    let backbone_before = fresh.models()[0]
        .var_store()
        .variables()
        .into_iter()
        .map(|(n, t)| (n, t.detach().copy()))
        .collect::<std::collections::HashMap<_, _>>();

    assert!(matches!(
        restore_train_step(fresh.as_mut(), tmp.path()),
        Err(TrainError::Checkpoint { .. })
    ));
    let backbone_after = fresh.models()[0].var_store().variables();
    for (name, t) in &backbone_before {
        assert!(t.equal(&backbone_after[name]), "`{name}` was loaded despite the failure");
    }
}

/// A frozen first stage restores into an unfrozen fine-tuning stage, which
/// then updates the backbone at the lower learning rate.
#[test]
fn frozen_stage_restores_into_finetune_stage() {
    let cfg = StepConfig {
        freeze_backbone: true,
        finetune_iterations: 1,
        finetune_learning_rate: 1e-4,
        ..config(Paradigm::Source)
    };
    let (tmp, frozen) = trained_checkpoint(&cfg, 2);
    assert_eq!(frozen.optimizers()[0].model_names(), vec!["top"]);

    let stage = cfg.finetune_stage();
    let (bf, tf) = factories();
    let mut tuned = build_train_step(&stage, &bf, &tf).expect("fine-tuning step");
    restore_train_step(tuned.as_mut(), tmp.path()).expect("restore");
    assert_eq!(tuned.iteration(), 2, "fine-tuning continues the iteration count");
    assert_eq!(tuned.optimizers()[0].model_names(), vec!["backbone", "top"]);
    assert!((tuned.optimizers()[0].learning_rate() - 1e-4).abs() < 1e-15);
    for (a, b) in frozen.models().iter().zip(tuned.models()) {
        assert!(weights_equal(a, b), "`{}` does not match the checkpoint", a.name());
        assert!(!b.is_frozen());
    }

    let ds = dataset(&stage);
    let mut loader = BalancedLoader::new(&ds, stage.batch_size, 2, Device::Cpu).expect("loader");
    tuned.train(&loader.next_batch().expect("batch")).expect("train");
    assert_eq!(tuned.iteration(), 3);
    assert!(
        !weights_equal(frozen.models()[0], tuned.models()[0]),
        "the unfrozen backbone must move"
    );
}

/// Reading a directory without a manifest fails cleanly.
#[test]
fn missing_manifest_is_an_error() {
    let tmp = TempDir::new().expect("tempdir");
    assert!(matches!(read_manifest(tmp.path()), Err(TrainError::Checkpoint { .. })));
}
