//! Step configuration for the domain-adaptation paradigms.
//!
//! [`StepConfig`] holds every hyper-parameter a train or test step needs:
//! the domain list, model shapes, optimisation settings, freezing flags and
//! the paradigm-specific knobs (adversarial schedule, moment order, EMA
//! decay). It is serializable via [`serde`] so a run can be described by a
//! JSON file and stored next to its checkpoints.
//!
//! # Example
//!
//! ```rust
//! use msda_train::config::{Paradigm, StepConfig};
//!
//! let cfg = StepConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.paradigm, Paradigm::Source);
//! assert_eq!(cfg.domains.last().map(String::as_str), Some("real"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tch::Device;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Paradigm
// ---------------------------------------------------------------------------

/// The training regime a step implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Paradigm {
    /// Source-only baseline, no adaptation.
    Source,
    /// Domain-adversarial training with gradient reversal.
    Dann,
    /// Multi-source moment matching with one head per source.
    M3sda,
    /// Mean-teacher self-ensembling with an EMA teacher.
    SelfEnsembling,
    /// Predicts which domain an image was drawn from.
    DomainClassifier,
}

impl Paradigm {
    /// Stable lowercase name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Paradigm::Source => "source",
            Paradigm::Dann => "dann",
            Paradigm::M3sda => "m3sda",
            Paradigm::SelfEnsembling => "self_ensembling",
            Paradigm::DomainClassifier => "domain_classifier",
        }
    }
}

impl fmt::Display for Paradigm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Paradigm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(Paradigm::Source),
            "dann" => Ok(Paradigm::Dann),
            "m3sda" => Ok(Paradigm::M3sda),
            "self_ensembling" => Ok(Paradigm::SelfEnsembling),
            "domain_classifier" => Ok(Paradigm::DomainClassifier),
            other => Err(ConfigError::invalid_value(
                "paradigm",
                format!("unknown paradigm `{other}`"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// StepConfig
// ---------------------------------------------------------------------------

/// Complete configuration for one train/test step pair.
///
/// Use [`StepConfig::default()`] as a starting point, then override
/// individual fields as needed. Fields that only one paradigm reads say so.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Training regime. Default: **source**.
    pub paradigm: Paradigm,

    // -----------------------------------------------------------------------
    // Domains / model
    // -----------------------------------------------------------------------
    /// Ordered domain names; the last one is the target domain.
    ///
    /// Default: **["clipart", "painting", "real"]**.
    pub domains: Vec<String>,

    /// Number of object classes. Default: **10**.
    pub num_classes: usize,

    /// Backbone architecture name understood by the backbone factory.
    /// Default: **"tiny_resnet"**.
    pub backbone: String,

    /// Side length of the square input images. Default: **32**.
    pub image_size: usize,

    /// Number of input image channels. Default: **3**.
    pub image_channels: usize,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Per-domain mini-batch size; also the loss divisor. Default: **24**.
    pub batch_size: usize,

    /// Adam learning rate. Default: **1e-3**.
    pub learning_rate: f64,

    /// Exclude backbone weights from gradient updates. Default: **false**.
    pub freeze_backbone: bool,

    /// Run the backbone's normalisation layers in training mode during
    /// train-time forward passes. Default: **true**.
    pub backbone_training: bool,

    // -----------------------------------------------------------------------
    // Paradigm-specific
    // -----------------------------------------------------------------------
    /// DANN: weight of the domain-discrimination loss. Default: **1.0**.
    pub adversarial_weight: f64,

    /// DANN: iterations over which the gradient-reversal scale ramps from 0
    /// to 1. Default: **10000**.
    pub adversarial_horizon: usize,

    /// M3SDA: highest raw moment aligned. Default: **2**.
    pub moment_order: usize,

    /// M3SDA: weight of the moment discrepancy. Default: **0.5**.
    pub moment_weight: f64,

    /// Self-ensembling: teacher EMA decay in `[0, 1]`. Default: **0.99**.
    pub ema_decay: f64,

    /// Self-ensembling: weight of the consistency loss. Default: **3.0**.
    pub consistency_weight: f64,

    /// Self-ensembling: teacher confidence needed for a target sample to
    /// contribute to the consistency loss; `0.0` disables masking.
    /// Default: **0.0**.
    pub confidence_threshold: f64,

    // -----------------------------------------------------------------------
    // Runner
    // -----------------------------------------------------------------------
    /// Iterations executed by the `train` binary. Default: **200**.
    pub num_iterations: usize,

    /// Log and reset metrics every N iterations. Default: **20**.
    pub log_every: usize,

    /// Iterations of a second, fine-tuning stage that unfreezes the backbone
    /// and continues from the first stage's checkpoint; `0` skips it.
    /// Default: **0**.
    pub finetune_iterations: usize,

    /// Adam learning rate of the fine-tuning stage. Default: **1e-4**.
    pub finetune_learning_rate: f64,

    // -----------------------------------------------------------------------
    // Device / reproducibility
    // -----------------------------------------------------------------------
    /// Use a CUDA GPU when available. Default: **false**.
    pub use_gpu: bool,

    /// CUDA device index when `use_gpu` is `true`. Default: **0**.
    pub gpu_device_id: usize,

    /// Seed for libtorch's RNG and the dataset shuffler. Default: **42**.
    pub seed: u64,
}

impl Default for StepConfig {
    fn default() -> Self {
        StepConfig {
            paradigm: Paradigm::Source,
            domains: vec!["clipart".into(), "painting".into(), "real".into()],
            num_classes: 10,
            backbone: "tiny_resnet".into(),
            image_size: 32,
            image_channels: 3,
            batch_size: 24,
            learning_rate: 1e-3,
            freeze_backbone: false,
            backbone_training: true,
            adversarial_weight: 1.0,
            adversarial_horizon: 10_000,
            moment_order: 2,
            moment_weight: 0.5,
            ema_decay: 0.99,
            consistency_weight: 3.0,
            confidence_threshold: 0.0,
            num_iterations: 200,
            log_every: 20,
            finetune_iterations: 0,
            finetune_learning_rate: 1e-4,
            use_gpu: false,
            gpu_device_id: 0,
            seed: 42,
        }
    }
}

impl StepConfig {
    /// Load a [`StepConfig`] from a JSON file at `path` and validate it.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed and
    /// [`ConfigError::InvalidValue`] if validation fails.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: StepConfig = serde_json::from_str(&contents).map_err(|source| {
            ConfigError::ParseError { path: path.to_path_buf(), source }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the directory cannot be created or
    /// the file cannot be written.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Configuration of the fine-tuning stage: the same models with the
    /// backbone unfrozen, trained at `finetune_learning_rate` for
    /// `finetune_iterations`.
    pub fn finetune_stage(&self) -> StepConfig {
        StepConfig {
            freeze_backbone: false,
            learning_rate: self.finetune_learning_rate,
            num_iterations: self.finetune_iterations,
            finetune_iterations: 0,
            ..self.clone()
        }
    }

    /// Number of source domains (`domains.len() - 1`, saturating).
    pub fn n_sources(&self) -> usize {
        self.domains.len().saturating_sub(1)
    }

    /// Device selected by `use_gpu` / `gpu_device_id`.
    ///
    /// Falls back to the CPU when CUDA is requested but unavailable.
    pub fn device(&self) -> Device {
        if self.use_gpu && tch::Cuda::is_available() {
            Device::Cuda(self.gpu_device_id)
        } else {
            Device::Cpu
        }
    }

    /// Validate all fields and return an error describing the first problem
    /// found, or `Ok(())` if the configuration is coherent.
    ///
    /// # Validated invariants
    ///
    /// - At least two distinct, non-empty domain names (one source + target).
    /// - `num_classes`, `image_size`, `image_channels`, `batch_size` > 0.
    /// - `learning_rate` and `finetune_learning_rate` > 0.
    /// - `adversarial_weight`, `moment_weight`, `consistency_weight` >= 0.
    /// - `adversarial_horizon` > 0, `moment_order` >= 1.
    /// - `ema_decay` and `confidence_threshold` in `[0, 1]`.
    /// - `log_every` > 0.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Domains
        if self.domains.len() < 2 {
            return Err(ConfigError::invalid_value(
                "domains",
                "need at least one source domain and one target domain",
            ));
        }
        for (i, name) in self.domains.iter().enumerate() {
            if name.is_empty() {
                return Err(ConfigError::invalid_value("domains", "domain names must be non-empty"));
            }
            if self.domains[..i].contains(name) {
                return Err(ConfigError::invalid_value(
                    "domains",
                    format!("domain `{name}` appears more than once"),
                ));
            }
        }

        // Model dims
        if self.num_classes == 0 {
            return Err(ConfigError::invalid_value("num_classes", "must be > 0"));
        }
        if self.image_size == 0 {
            return Err(ConfigError::invalid_value("image_size", "must be > 0"));
        }
        if self.image_channels == 0 {
            return Err(ConfigError::invalid_value("image_channels", "must be > 0"));
        }
        if self.backbone.is_empty() {
            return Err(ConfigError::invalid_value("backbone", "must be non-empty"));
        }

        // Optimisation
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(ConfigError::invalid_value("learning_rate", "must be > 0.0"));
        }
        if !(self.finetune_learning_rate > 0.0) {
            return Err(ConfigError::invalid_value("finetune_learning_rate", "must be > 0.0"));
        }

        // Paradigm knobs
        if self.adversarial_weight < 0.0 {
            return Err(ConfigError::invalid_value("adversarial_weight", "must be >= 0.0"));
        }
        if self.adversarial_horizon == 0 {
            return Err(ConfigError::invalid_value("adversarial_horizon", "must be > 0"));
        }
        if self.moment_order == 0 {
            return Err(ConfigError::invalid_value("moment_order", "must be >= 1"));
        }
        if self.moment_weight < 0.0 {
            return Err(ConfigError::invalid_value("moment_weight", "must be >= 0.0"));
        }
        if !(0.0..=1.0).contains(&self.ema_decay) {
            return Err(ConfigError::invalid_value("ema_decay", "must be in [0.0, 1.0]"));
        }
        if self.consistency_weight < 0.0 {
            return Err(ConfigError::invalid_value("consistency_weight", "must be >= 0.0"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::invalid_value(
                "confidence_threshold",
                "must be in [0.0, 1.0]",
            ));
        }

        // Runner
        if self.log_every == 0 {
            return Err(ConfigError::invalid_value("log_every", "must be > 0"));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        StepConfig::default().validate().expect("default config should be valid");
    }

    #[test]
    fn json_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("step.json");

        let mut original = StepConfig::default();
        original.paradigm = Paradigm::M3sda;
        original.to_json(&path).expect("serialization should succeed");

        let loaded = StepConfig::from_json(&path).expect("deserialization should succeed");
        assert_eq!(loaded.paradigm, Paradigm::M3sda);
        assert_eq!(loaded.domains, original.domains);
        assert_eq!(loaded.batch_size, original.batch_size);
        assert_eq!(loaded.seed, original.seed);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("partial.json");
        std::fs::write(&path, r#"{"paradigm": "dann", "batch_size": 4}"#).unwrap();

        let cfg = StepConfig::from_json(&path).unwrap();
        assert_eq!(cfg.paradigm, Paradigm::Dann);
        assert_eq!(cfg.batch_size, 4);
        assert_eq!(cfg.num_classes, StepConfig::default().num_classes);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            StepConfig::from_json(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn single_domain_is_invalid() {
        let mut cfg = StepConfig::default();
        cfg.domains = vec!["real".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_domain_is_invalid() {
        let mut cfg = StepConfig::default();
        cfg.domains = vec!["a".into(), "b".into(), "a".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ema_decay_outside_unit_interval_is_invalid() {
        let mut cfg = StepConfig::default();
        cfg.ema_decay = 1.5;
        assert!(cfg.validate().is_err());
        cfg.ema_decay = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn nan_learning_rate_is_invalid() {
        let mut cfg = StepConfig::default();
        cfg.learning_rate = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn paradigm_parses_from_its_name() {
        for p in [
            Paradigm::Source,
            Paradigm::Dann,
            Paradigm::M3sda,
            Paradigm::SelfEnsembling,
            Paradigm::DomainClassifier,
        ] {
            assert_eq!(p.as_str().parse::<Paradigm>().unwrap(), p);
        }
        assert!("adda".parse::<Paradigm>().is_err());
    }
}
