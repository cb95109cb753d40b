//! Train and test steps for every adaptation paradigm.
//!
//! A train step owns its models, losses, metrics and optimizer and performs
//! one gradient update per [`TrainStep::train`] call. A test step owns the
//! inference-time subset of those models and scores one [`TestBatch`] per
//! [`TestStep::test`] call.
//!
//! ```text
//! TrainBatch ──► validate ──► run_balanced ──► losses ──► ensure_finite
//!                                                             │
//!        iteration + 1 ◄── metrics ◄── optimizer step ◄──────┘
//! ```
//!
//! Every failure surfaces before the optimizer step, so a failed call leaves
//! weights, metrics and the iteration counter untouched. Normalisation
//! statistics move during the forward pass itself; each step captures them
//! in a [`BufferSnapshot`](crate::model::BufferSnapshot) after validation and
//! restores them when the transaction fails.

pub mod dann;
pub mod domain_classifier;
pub mod m3sda;
pub mod self_ensembling;
pub mod source;

use tch::nn::{self, OptimizerConfig};
use tch::Tensor;
use tracing::info;

use crate::batch::{DomainList, TestBatch, TrainBatch};
use crate::config::{Paradigm, StepConfig};
use crate::error::TrainResult;
use crate::metrics::ConfusionMatrix;
use crate::model::{BackboneFactory, Model, TopFactory};

pub use dann::{DannTestStep, DannTrainStep};
pub use domain_classifier::{DomainClassifierTestStep, DomainClassifierTrainStep};
pub use m3sda::{M3sdaTestStep, M3sdaTrainStep};
pub use self_ensembling::{SelfEnsemblingTestStep, SelfEnsemblingTrainStep};
pub use source::{SourceTestStep, SourceTrainStep};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One gradient update per call.
pub trait TrainStep {
    /// Paradigm implemented by this step.
    fn paradigm(&self) -> Paradigm;

    /// Domains the step was built for, target last.
    fn domains(&self) -> &DomainList;

    /// Run one training transaction on `batch`.
    ///
    /// On success gradients are applied, metrics updated and the iteration
    /// counter incremented by one. On error nothing changes, batch-norm
    /// running statistics included.
    fn train(&mut self, batch: &TrainBatch) -> TrainResult<()>;

    /// Number of successful `train` calls (plus any restored offset).
    fn iteration(&self) -> i64;

    /// Restore the iteration counter, e.g. from a checkpoint.
    fn set_iteration(&mut self, iteration: i64);

    /// Every model owned by the step.
    fn models(&self) -> Vec<&Model>;

    /// Mutable access to every model (checkpoint restore).
    fn models_mut(&mut self) -> Vec<&mut Model>;

    /// Named optimizers.
    fn optimizers(&self) -> Vec<&JointOptimizer>;

    /// Mutable access to the optimizers (learning-rate changes).
    fn optimizers_mut(&mut self) -> Vec<&mut JointOptimizer>;

    /// Current metric values as `(name, value)` pairs.
    fn metrics(&self) -> Vec<(String, f64)>;

    /// Reset every metric.
    fn reset_metrics(&mut self);

    /// Names of the losses this step combines.
    fn loss_names(&self) -> &'static [&'static str];
}

/// Output of one [`TestStep::test`] call.
#[derive(Debug)]
pub struct TestOutput {
    /// Sample identifiers, in batch order.
    pub paths: Vec<String>,
    /// Class probabilities `[B, K]`, averaged over views and heads.
    pub predictions: Tensor,
}

/// One evaluation per call.
pub trait TestStep {
    /// Score `batch` and return its predictions.
    fn test(&mut self, batch: &TestBatch) -> TrainResult<TestOutput>;

    /// Number of successful `test` calls.
    fn iteration(&self) -> i64;

    /// Restore the iteration counter.
    fn set_iteration(&mut self, iteration: i64);

    /// Every model owned by the step.
    fn models(&self) -> Vec<&Model>;

    /// Mutable access to every model (checkpoint restore).
    fn models_mut(&mut self) -> Vec<&mut Model>;

    /// Current metric values as `(name, value)` pairs.
    fn metrics(&self) -> Vec<(String, f64)>;

    /// Reset every metric.
    fn reset_metrics(&mut self);

    /// Confusion counts accumulated since the last reset.
    fn confusion_matrix(&self) -> &ConfusionMatrix;
}

// ---------------------------------------------------------------------------
// JointOptimizer
// ---------------------------------------------------------------------------

/// Adam over several models, stepped together after a single backward pass.
///
/// tch builds one optimizer per `VarStore`; Adam keeps per-parameter state,
/// so one optimizer per model updates exactly like a single joint one.
/// Frozen models are left out.
pub struct JointOptimizer {
    name: &'static str,
    learning_rate: f64,
    parts: Vec<(String, nn::Optimizer)>,
}

impl JointOptimizer {
    /// Adam with default betas over every non-frozen model in `models`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TrainError::Tch`] if libtorch rejects the optimizer.
    pub fn adam(name: &'static str, models: &[&Model], learning_rate: f64) -> TrainResult<Self> {
        let mut parts = Vec::with_capacity(models.len());
        for model in models.iter().filter(|m| !m.is_frozen()) {
            let opt = nn::Adam::default().build(model.var_store(), learning_rate)?;
            parts.push((model.name().to_string(), opt));
        }
        Ok(JointOptimizer { name, learning_rate, parts })
    }

    /// Registry name (`"optimizer"`).
    pub fn name(&self) -> &str {
        self.name
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Change the learning rate of every part.
    pub fn set_lr(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
        for (_, opt) in &mut self.parts {
            opt.set_lr(learning_rate);
        }
    }

    /// Names of the models this optimizer updates.
    pub fn model_names(&self) -> Vec<&str> {
        self.parts.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Zero gradients, back-propagate `loss` once, step every part.
    ///
    /// A loss that does not require gradients (everything frozen) is a no-op.
    pub fn backward_step(&mut self, loss: &Tensor) -> TrainResult<()> {
        for (_, opt) in &mut self.parts {
            opt.zero_grad();
        }
        if !loss.requires_grad() {
            return Ok(());
        }
        loss.f_backward()?;
        for (_, opt) in &mut self.parts {
            opt.step();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Build the backbone described by `config`, frozen if requested.
pub(crate) fn build_backbone(
    factory: &dyn BackboneFactory,
    config: &StepConfig,
    name: &str,
) -> TrainResult<Model> {
    let mut backbone = factory
        .build_backbone(&config.backbone, config.image_size as i64)?
        .with_name(name);
    if config.freeze_backbone {
        backbone.freeze();
    }
    Ok(backbone)
}

/// Backbone then head, inference mode, no gradients.
pub(crate) fn predict(backbone: &Model, top: &Model, image: &Tensor) -> Tensor {
    tch::no_grad(|| top.forward_t(&backbone.forward_t(image, false), false))
}

/// Unweighted mean of equally-shaped tensors.
pub(crate) fn average(tensors: Vec<Tensor>) -> TrainResult<Tensor> {
    let n = tensors.len();
    let sum = tensors
        .into_iter()
        .reduce(|acc, t| acc + t)
        .ok_or(crate::error::TrainError::EmptyBatch)?;
    Ok(sum / n as f64)
}

// ---------------------------------------------------------------------------
// Paradigm dispatch
// ---------------------------------------------------------------------------

/// Build the train step selected by `config.paradigm`.
///
/// # Errors
///
/// Configuration, domain-list and factory errors.
pub fn build_train_step(
    config: &StepConfig,
    backbone_factory: &dyn BackboneFactory,
    top_factory: &dyn TopFactory,
) -> TrainResult<Box<dyn TrainStep>> {
    config.validate()?;
    let domains = DomainList::new(config.domains.iter().cloned())?;
    let step: Box<dyn TrainStep> = match config.paradigm {
        Paradigm::Source => Box::new(SourceTrainStep::new(backbone_factory, top_factory, domains, config)?),
        Paradigm::Dann => Box::new(DannTrainStep::new(backbone_factory, top_factory, domains, config)?),
        Paradigm::M3sda => Box::new(M3sdaTrainStep::new(backbone_factory, top_factory, domains, config)?),
        Paradigm::SelfEnsembling => {
            Box::new(SelfEnsemblingTrainStep::new(backbone_factory, top_factory, domains, config)?)
        }
        Paradigm::DomainClassifier => {
            Box::new(DomainClassifierTrainStep::new(backbone_factory, top_factory, domains, config)?)
        }
    };
    info!(
        paradigm = %config.paradigm,
        domains = config.domains.len(),
        models = step.models().len(),
        "built train step"
    );
    Ok(step)
}

/// Build the test step matching `config.paradigm`.
///
/// Its model names match the train step's, so checkpoints restore by name.
pub fn build_test_step(
    config: &StepConfig,
    backbone_factory: &dyn BackboneFactory,
    top_factory: &dyn TopFactory,
) -> TrainResult<Box<dyn TestStep>> {
    config.validate()?;
    let domains = DomainList::new(config.domains.iter().cloned())?;
    let step: Box<dyn TestStep> = match config.paradigm {
        Paradigm::Source => Box::new(SourceTestStep::new(backbone_factory, top_factory, config)?),
        Paradigm::Dann => Box::new(DannTestStep::new(backbone_factory, top_factory, config)?),
        Paradigm::M3sda => Box::new(M3sdaTestStep::new(backbone_factory, top_factory, &domains, config)?),
        Paradigm::SelfEnsembling => {
            Box::new(SelfEnsemblingTestStep::new(backbone_factory, top_factory, config)?)
        }
        Paradigm::DomainClassifier => Box::new(domain_classifier::build_test_step(
            backbone_factory,
            top_factory,
            &domains,
            config,
        )?),
    };
    Ok(step)
}
