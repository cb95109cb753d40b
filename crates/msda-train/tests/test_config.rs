//! Integration tests for [`msda_train::config`].
//!
//! Covers default validity, validation failures for each field family, the
//! JSON round trip through a temporary file and paradigm parsing.

use msda_train::config::{Paradigm, StepConfig};
use msda_train::error::ConfigError;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// The default configuration must pass validation.
#[test]
fn default_config_is_valid() {
    let cfg = StepConfig::default();
    assert!(cfg.validate().is_ok(), "default config must be valid: {:?}", cfg.validate());
}

/// The last domain is the target, so the default has two sources.
#[test]
fn default_config_has_two_sources() {
    let cfg = StepConfig::default();
    assert_eq!(cfg.n_sources(), 2, "expected 2 source domains, got {}", cfg.n_sources());
    assert_eq!(cfg.domains.last().map(String::as_str), Some("real"));
}

/// Without `use_gpu` the selected device is the CPU.
#[test]
fn default_device_is_cpu() {
    assert_eq!(StepConfig::default().device(), tch::Device::Cpu);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid_field(cfg: &StepConfig) -> &'static str {
    match cfg.validate() {
        Err(ConfigError::InvalidValue { field, .. }) => field,
        other => panic!("expected InvalidValue, got {other:?}"),
    }
}

/// A single domain leaves no source to learn from.
#[test]
fn single_domain_is_rejected() {
    let cfg = StepConfig { domains: vec!["only".into()], ..StepConfig::default() };
    assert_eq!(invalid_field(&cfg), "domains");
}

/// Duplicate and empty domain names are both rejected.
#[test]
fn malformed_domain_names_are_rejected() {
    let dup = StepConfig {
        domains: vec!["a".into(), "b".into(), "a".into()],
        ..StepConfig::default()
    };
    assert_eq!(invalid_field(&dup), "domains");

    let empty = StepConfig {
        domains: vec!["a".into(), String::new()],
        ..StepConfig::default()
    };
    assert_eq!(invalid_field(&empty), "domains");
}

/// Zero-sized dimensions are rejected with the offending field name.
#[test]
fn zero_dimensions_are_rejected() {
    let cases: Vec<(StepConfig, &str)> = vec![
        (StepConfig { num_classes: 0, ..StepConfig::default() }, "num_classes"),
        (StepConfig { image_size: 0, ..StepConfig::default() }, "image_size"),
        (StepConfig { image_channels: 0, ..StepConfig::default() }, "image_channels"),
        (StepConfig { batch_size: 0, ..StepConfig::default() }, "batch_size"),
        (StepConfig { log_every: 0, ..StepConfig::default() }, "log_every"),
    ];
    for (cfg, field) in &cases {
        assert_eq!(invalid_field(cfg), *field, "wrong field reported for {field}");
    }
}

/// Non-positive and NaN learning rates are rejected.
#[test]
fn bad_learning_rates_are_rejected() {
    for lr in [0.0, -1e-3, f64::NAN] {
        let cfg = StepConfig { learning_rate: lr, ..StepConfig::default() };
        assert_eq!(invalid_field(&cfg), "learning_rate", "lr = {lr} must be rejected");
        let cfg = StepConfig { finetune_learning_rate: lr, ..StepConfig::default() };
        assert_eq!(invalid_field(&cfg), "finetune_learning_rate", "lr = {lr} must be rejected");
    }
}

/// The fine-tuning stage unfreezes the backbone at its own learning rate and
/// keeps every model-shaping field.
#[test]
fn finetune_stage_unfreezes_backbone() {
    let stage1 = StepConfig {
        freeze_backbone: true,
        finetune_iterations: 30,
        finetune_learning_rate: 1e-4,
        ..StepConfig::default()
    };
    let stage2 = stage1.finetune_stage();
    assert!(!stage2.freeze_backbone);
    assert_eq!(stage2.learning_rate, 1e-4);
    assert_eq!(stage2.num_iterations, 30);
    assert_eq!(stage2.finetune_iterations, 0, "the second stage does not chain a third");
    assert_eq!(stage2.paradigm, stage1.paradigm);
    assert_eq!(stage2.domains, stage1.domains);
    assert_eq!(stage2.backbone, stage1.backbone);
    stage2.validate().expect("derived stage must be valid");
}

/// EMA decay and confidence threshold live in `[0, 1]`; both ends are valid.
#[test]
fn unit_interval_fields_are_bounded() {
    for decay in [0.0, 0.5, 1.0] {
        let cfg = StepConfig { ema_decay: decay, ..StepConfig::default() };
        assert!(cfg.validate().is_ok(), "ema_decay = {decay} must be accepted");
    }
    let cfg = StepConfig { ema_decay: 1.5, ..StepConfig::default() };
    assert_eq!(invalid_field(&cfg), "ema_decay");

    let cfg = StepConfig { confidence_threshold: -0.1, ..StepConfig::default() };
    assert_eq!(invalid_field(&cfg), "confidence_threshold");
}

/// Negative loss weights are rejected; zero disables a loss and is valid.
#[test]
fn loss_weights_must_be_non_negative() {
    let cfg = StepConfig { adversarial_weight: -1.0, ..StepConfig::default() };
    assert_eq!(invalid_field(&cfg), "adversarial_weight");
    let cfg = StepConfig { moment_weight: 0.0, consistency_weight: 0.0, ..StepConfig::default() };
    assert!(cfg.validate().is_ok());
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Writing then reading a config yields an identical value.
#[test]
fn json_file_round_trip() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("nested").join("step.json");
    let cfg = StepConfig {
        paradigm: Paradigm::M3sda,
        moment_order: 3,
        learning_rate: 2e-4,
        ..StepConfig::default()
    };
    cfg.to_json(&path).expect("write config");
    let loaded = StepConfig::from_json(&path).expect("read config");
    assert_eq!(loaded.paradigm, Paradigm::M3sda);
    assert_eq!(loaded.moment_order, 3);
    assert!((loaded.learning_rate - 2e-4).abs() < 1e-12);
    assert_eq!(loaded.domains, cfg.domains);
}

/// Fields missing from the JSON take their defaults.
#[test]
fn partial_json_uses_defaults() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("partial.json");
    std::fs::write(&path, r#"{ "paradigm": "self_ensembling", "ema_decay": 0.9 }"#).expect("write");
    let cfg = StepConfig::from_json(&path).expect("partial config must load");
    assert_eq!(cfg.paradigm, Paradigm::SelfEnsembling);
    assert!((cfg.ema_decay - 0.9).abs() < 1e-12);
    assert_eq!(cfg.batch_size, StepConfig::default().batch_size);
}

/// Invalid values inside a file are reported by `from_json`.
#[test]
fn from_json_validates() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("bad.json");
    std::fs::write(&path, r#"{ "batch_size": 0 }"#).expect("write");
    assert!(matches!(
        StepConfig::from_json(&path),
        Err(ConfigError::InvalidValue { field: "batch_size", .. })
    ));
}

/// Missing files and malformed JSON map to distinct errors.
#[test]
fn from_json_reports_io_and_parse_errors() {
    let tmp = TempDir::new().expect("tempdir");
    assert!(matches!(
        StepConfig::from_json(&tmp.path().join("absent.json")),
        Err(ConfigError::FileRead { .. })
    ));
    let path = tmp.path().join("garbage.json");
    std::fs::write(&path, "{ not json").expect("write");
    assert!(matches!(StepConfig::from_json(&path), Err(ConfigError::ParseError { .. })));
}

// ---------------------------------------------------------------------------
// Paradigm
// ---------------------------------------------------------------------------

/// Display output parses back to the same paradigm.
#[test]
fn paradigm_display_parses_back() {
    for p in [
        Paradigm::Source,
        Paradigm::Dann,
        Paradigm::M3sda,
        Paradigm::SelfEnsembling,
        Paradigm::DomainClassifier,
    ] {
        let parsed: Paradigm = p.to_string().parse().expect("parse paradigm");
        assert_eq!(parsed, p);
    }
    assert!("cycada".parse::<Paradigm>().is_err(), "unknown paradigms must not parse");
}
