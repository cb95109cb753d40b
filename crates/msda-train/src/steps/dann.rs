//! Domain-adversarial training (DANN).
//!
//! ```text
//!  source_i ──► backbone ──► top ──────────────► CE(class)
//!                  │
//!  target  ──► backbone ──► GRL(λ) ──► discriminator ──► CE(domain index)
//!
//!  L = L_cls + adversarial_weight · L_dom
//! ```
//!
//! The gradient-reversal scale λ follows [`AdversarialSchedule`] over the
//! step's own iteration counter.

use tch::Tensor;
use tracing::debug;

pub use super::source::DannTestStep;
use super::{build_backbone, JointOptimizer, TrainStep};
use crate::balanced::{run_balanced, ForwardFlags, Heads};
use crate::batch::{domain_labels, DomainList, TrainBatch};
use crate::config::{Paradigm, StepConfig};
use crate::domain::{gradient_reverse, AdversarialSchedule};
use crate::error::{TrainError, TrainResult};
use crate::losses::{ensure_finite, ClassificationLoss, DomainLoss};
use crate::metrics::{Accuracy, DomainAccuracies, Mean, Metric};
use crate::model::{BackboneFactory, BufferSnapshot, Model, TopFactory};

const LOSS_NAMES: &[&str] = &[ClassificationLoss::NAME, DomainLoss::NAME];

struct DannMetrics {
    scce: Mean,
    discriminator_scce: Mean,
    domain_acc: DomainAccuracies,
    target_acc: Accuracy,
    discriminator_acc: Accuracy,
}

/// Backbone + top + domain discriminator behind a gradient-reversal layer.
pub struct DannTrainStep {
    domains: DomainList,
    iteration: i64,
    flags: ForwardFlags,
    backbone: Model,
    top: Model,
    discriminator: Model,
    classification: ClassificationLoss,
    domain: DomainLoss,
    adversarial_weight: f64,
    schedule: AdversarialSchedule,
    metrics: DannMetrics,
    optimizer: JointOptimizer,
}

impl DannTrainStep {
    /// Build models and optimizer for `domains`. The discriminator comes from
    /// `top_factory` with one output per domain.
    pub fn new(
        backbone_factory: &dyn BackboneFactory,
        top_factory: &dyn TopFactory,
        domains: DomainList,
        config: &StepConfig,
    ) -> TrainResult<Self> {
        let backbone = build_backbone(backbone_factory, config, "backbone")?;
        let top = top_factory.build_top(config.num_classes as i64)?.with_name("top");
        let discriminator = top_factory
            .build_top(domains.len() as i64)?
            .with_name("discriminator");
        let optimizer = JointOptimizer::adam(
            "optimizer",
            &[&backbone, &top, &discriminator],
            config.learning_rate,
        )?;
        let metrics = DannMetrics {
            scce: Mean::new(),
            discriminator_scce: Mean::new(),
            domain_acc: DomainAccuracies::new(domains.sources()),
            target_acc: Accuracy::new(),
            discriminator_acc: Accuracy::new(),
        };
        Ok(DannTrainStep {
            flags: ForwardFlags::train(config.backbone_training),
            classification: ClassificationLoss::new(config.batch_size),
            domain: DomainLoss::new(config.batch_size),
            adversarial_weight: config.adversarial_weight,
            schedule: AdversarialSchedule::new(config.adversarial_horizon),
            domains,
            iteration: 0,
            backbone,
            top,
            discriminator,
            metrics,
            optimizer,
        })
    }

    /// Reversal scale the next `train` call will use.
    pub fn reversal_scale(&self) -> f64 {
        self.schedule.lambda(self.iteration)
    }

    /// One DANN transaction on a validated batch.
    fn apply(&mut self, batch: &TrainBatch) -> TrainResult<()> {
        let n_sources = self.domains.n_sources();
        let target = batch.target().ok_or(TrainError::EmptyBatch)?;
        let images: Vec<&Tensor> = batch.records().iter().map(|r| &r.image).collect();
        let labels: Vec<&Tensor> = batch.sources().iter().map(|r| &r.label).collect();

        let out = run_balanced(&self.backbone, Heads::Shared(&self.top), &images, self.flags)?;
        let predictions = (0..images.len())
            .map(|i| out.prediction(i))
            .collect::<TrainResult<Vec<_>>>()?;
        let cls = self.classification.forward(&predictions[..n_sources], &labels)?;

        let scale = self.reversal_scale();
        let domain_predictions: Vec<Tensor> = out
            .features
            .iter()
            .map(|f| self.discriminator.forward_t(&gradient_reverse(f, scale), true))
            .collect();
        let domain_refs: Vec<&Tensor> = domain_predictions.iter().collect();
        let dom = self.domain.forward(&domain_refs)?;

        let scce = ensure_finite(ClassificationLoss::NAME, &cls)?;
        let discriminator_scce = ensure_finite(DomainLoss::NAME, &dom)?;
        let loss = &cls + &dom * self.adversarial_weight;

        let source_counts = predictions[..n_sources]
            .iter()
            .zip(&labels)
            .map(|(p, y)| Accuracy::batch_counts(p, y))
            .collect::<TrainResult<Vec<_>>>()?;
        let target_counts =
            Accuracy::batch_counts(&predictions[n_sources].detach(), &target.label)?;
        let mut discriminator_counts = (0, 0);
        for (i, p) in domain_predictions.iter().enumerate() {
            let (c, t) = Accuracy::batch_counts(p, &domain_labels(p.size()[0], i, p.device()))?;
            discriminator_counts.0 += c;
            discriminator_counts.1 += t;
        }

        self.optimizer.backward_step(&loss)?;

        self.metrics.scce.update(scce);
        self.metrics.discriminator_scce.update(discriminator_scce);
        for (i, counts) in source_counts.into_iter().enumerate() {
            self.metrics.domain_acc.record(i, counts);
        }
        self.metrics.target_acc.record(target_counts);
        self.metrics.discriminator_acc.record(discriminator_counts);
        self.iteration += 1;
        debug!(iteration = self.iteration, scce, discriminator_scce, scale, "dann step");
        Ok(())
    }
}

impl TrainStep for DannTrainStep {
    fn paradigm(&self) -> Paradigm {
        Paradigm::Dann
    }

    fn domains(&self) -> &DomainList {
        &self.domains
    }

    fn train(&mut self, batch: &TrainBatch) -> TrainResult<()> {
        batch.validate(&self.domains)?;
        let buffers = BufferSnapshot::capture(&[&self.backbone, &self.top, &self.discriminator]);
        let result = self.apply(batch);
        buffers.restore_on_err(result)
    }

    fn iteration(&self) -> i64 {
        self.iteration
    }

    fn set_iteration(&mut self, iteration: i64) {
        self.iteration = iteration;
    }

    fn models(&self) -> Vec<&Model> {
        vec![&self.backbone, &self.top, &self.discriminator]
    }

    fn models_mut(&mut self) -> Vec<&mut Model> {
        vec![&mut self.backbone, &mut self.top, &mut self.discriminator]
    }

    fn optimizers(&self) -> Vec<&JointOptimizer> {
        vec![&self.optimizer]
    }

    fn optimizers_mut(&mut self) -> Vec<&mut JointOptimizer> {
        vec![&mut self.optimizer]
    }

    fn metrics(&self) -> Vec<(String, f64)> {
        let m = &self.metrics;
        let mut out = vec![
            ("scce".to_string(), m.scce.result()),
            ("discriminator_scce".to_string(), m.discriminator_scce.result()),
        ];
        m.domain_acc.export_into(&mut out);
        out.push(("target_acc".to_string(), m.target_acc.result()));
        out.push(("discriminator_acc".to_string(), m.discriminator_acc.result()));
        out
    }

    fn reset_metrics(&mut self) {
        let m = &mut self.metrics;
        m.scce.reset();
        m.discriminator_scce.reset();
        m.domain_acc.reset();
        m.target_acc.reset();
        m.discriminator_acc.reset();
    }

    fn loss_names(&self) -> &'static [&'static str] {
        LOSS_NAMES
    }
}
