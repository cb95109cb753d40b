//! Domain classifier: predicts which domain an image was drawn from.
//!
//! Class labels are ignored; record `i` of a batch is labelled with domain
//! index `i`, target included.

use tch::Tensor;
use tracing::debug;

use super::source::SourceTestStep;
use super::{build_backbone, JointOptimizer, TrainStep};
use crate::balanced::{run_balanced, ForwardFlags, Heads};
use crate::batch::{domain_labels, DomainList, TrainBatch};
use crate::config::{Paradigm, StepConfig};
use crate::error::TrainResult;
use crate::losses::{ensure_finite, DomainLoss};
use crate::metrics::{Accuracy, DomainAccuracies, Mean, Metric};
use crate::model::{BackboneFactory, BufferSnapshot, Model, TopFactory};

const LOSS_NAMES: &[&str] = &[DomainLoss::NAME];

/// Evaluated like the source baseline, with one output per domain. Test
/// batches must carry domain indices as labels.
pub type DomainClassifierTestStep = SourceTestStep;

/// Build a [`DomainClassifierTestStep`] with one output per domain.
pub fn build_test_step(
    backbone_factory: &dyn BackboneFactory,
    top_factory: &dyn TopFactory,
    domains: &DomainList,
    config: &StepConfig,
) -> TrainResult<DomainClassifierTestStep> {
    SourceTestStep::with_outputs(backbone_factory, top_factory, config, domains.len())
}

/// Backbone + `n_domains`-way head trained on domain identity.
pub struct DomainClassifierTrainStep {
    domains: DomainList,
    iteration: i64,
    flags: ForwardFlags,
    backbone: Model,
    top: Model,
    domain: DomainLoss,
    scce: Mean,
    domain_acc: DomainAccuracies,
    optimizer: JointOptimizer,
}

impl DomainClassifierTrainStep {
    /// Build models and optimizer for `domains`.
    pub fn new(
        backbone_factory: &dyn BackboneFactory,
        top_factory: &dyn TopFactory,
        domains: DomainList,
        config: &StepConfig,
    ) -> TrainResult<Self> {
        let backbone = build_backbone(backbone_factory, config, "backbone")?;
        let top = top_factory.build_top(domains.len() as i64)?.with_name("top");
        let optimizer = JointOptimizer::adam("optimizer", &[&backbone, &top], config.learning_rate)?;
        Ok(DomainClassifierTrainStep {
            flags: ForwardFlags::train(config.backbone_training),
            domain: DomainLoss::new(config.batch_size),
            scce: Mean::new(),
            domain_acc: DomainAccuracies::new(domains.names()),
            domains,
            iteration: 0,
            backbone,
            top,
            optimizer,
        })
    }

    fn apply(&mut self, batch: &TrainBatch) -> TrainResult<()> {
        let images: Vec<&Tensor> = batch.records().iter().map(|r| &r.image).collect();

        let out = run_balanced(&self.backbone, Heads::Shared(&self.top), &images, self.flags)?;
        let predictions = (0..images.len())
            .map(|i| out.prediction(i))
            .collect::<TrainResult<Vec<_>>>()?;
        let loss = self.domain.forward(&predictions)?;
        let scce = ensure_finite(DomainLoss::NAME, &loss)?;

        let counts = predictions
            .iter()
            .enumerate()
            .map(|(i, p)| Accuracy::batch_counts(p, &domain_labels(p.size()[0], i, p.device())))
            .collect::<TrainResult<Vec<_>>>()?;

        self.optimizer.backward_step(&loss)?;

        self.scce.update(scce);
        for (i, c) in counts.into_iter().enumerate() {
            self.domain_acc.record(i, c);
        }
        self.iteration += 1;
        debug!(iteration = self.iteration, scce, "domain-classifier step");
        Ok(())
    }
}

impl TrainStep for DomainClassifierTrainStep {
    fn paradigm(&self) -> Paradigm {
        Paradigm::DomainClassifier
    }

    fn domains(&self) -> &DomainList {
        &self.domains
    }

    fn train(&mut self, batch: &TrainBatch) -> TrainResult<()> {
        batch.validate(&self.domains)?;
        let buffers = BufferSnapshot::capture(&[&self.backbone, &self.top]);
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
        vec![&self.backbone, &self.top]
    }

    fn models_mut(&mut self) -> Vec<&mut Model> {
        vec![&mut self.backbone, &mut self.top]
    }

    fn optimizers(&self) -> Vec<&JointOptimizer> {
        vec![&self.optimizer]
    }

    fn optimizers_mut(&mut self) -> Vec<&mut JointOptimizer> {
        vec![&mut self.optimizer]
    }

    fn metrics(&self) -> Vec<(String, f64)> {
        let mut out = vec![("scce".to_string(), self.scce.result())];
        self.domain_acc.export_into(&mut out);
        out
    }

    fn reset_metrics(&mut self) {
        self.scce.reset();
        self.domain_acc.reset();
    }

    fn loss_names(&self) -> &'static [&'static str] {
        LOSS_NAMES
    }
}
