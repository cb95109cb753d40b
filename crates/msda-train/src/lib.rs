//! # Multi-source domain-adaptation training steps
//!
//! This crate provides the train and test steps for image classification
//! under domain shift, where several labelled source domains and one
//! unlabelled target domain are trained together. Five paradigms are
//! available: source-only, DANN, M3SDA, self-ensembling and a domain
//! classifier.
//!
//! ## Architecture
//!
//! ```text
//! StepConfig ──► build_train_step ──► TrainStep (Source | Dann | M3sda | ...)
//!                                         │
//!        BackboneFactory / TopFactory ────┤ models
//!                                         │
//!  BalancedLoader ──► TrainBatch ──► run_balanced ──► losses ──► JointOptimizer
//!        │
//!  SyntheticDomainDataset                  metrics ──► checkpoint
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use msda_train::config::StepConfig;
//! use msda_train::dataset::{BalancedLoader, SyntheticConfig, SyntheticDomainDataset};
//! use msda_train::model::{ConvBackboneFactory, DenseTopFactory};
//! use msda_train::steps::build_train_step;
//!
//! let config = StepConfig::default();
//! let device = config.device();
//! let backbones = ConvBackboneFactory::new(3, device);
//! let tops = DenseTopFactory::new(64, 128, device);
//! let mut step = build_train_step(&config, &backbones, &tops).unwrap();
//!
//! let dataset = SyntheticDomainDataset::new(config.domains.clone(), SyntheticConfig::default()).unwrap();
//! let mut loader = BalancedLoader::new(&dataset, config.batch_size, config.seed, device).unwrap();
//! step.train(&loader.next_batch().unwrap()).unwrap();
//! println!("{:?}", step.metrics());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod augment;
pub mod balanced;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod steps;

// Convenient re-exports at the crate root.
pub use augment::SelfEnsemblingPreprocessor;
pub use balanced::{run_balanced, BalancedOutput, ForwardFlags, Heads};
pub use batch::{DomainBatch, DomainList, TestBatch, TrainBatch};
pub use config::{Paradigm, StepConfig};
pub use domain::{gradient_reverse, AdversarialSchedule, GradientReverse};
pub use error::{ConfigError, DatasetError, TrainError, TrainResult};
pub use model::{
    BackboneFactory, BufferSnapshot, ConvBackboneFactory, DenseTopFactory, Model, TopFactory,
};
pub use steps::{build_test_step, build_train_step, TestOutput, TestStep, TrainStep};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
