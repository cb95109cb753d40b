//! Source-only baseline: supervised training on the source domains, target
//! accuracy tracked as a diagnostic.

use tch::Tensor;
use tracing::debug;

use super::{average, build_backbone, predict, JointOptimizer, TestOutput, TestStep, TrainStep};
use crate::balanced::{run_balanced, ForwardFlags, Heads};
use crate::batch::{DomainList, TestBatch, TrainBatch};
use crate::config::{Paradigm, StepConfig};
use crate::error::{TrainError, TrainResult};
use crate::losses::{ensure_finite, ClassificationLoss};
use crate::metrics::{Accuracy, ConfusionMatrix, DomainAccuracies, Mean, Metric};
use crate::model::{BackboneFactory, BufferSnapshot, Model, TopFactory};

const LOSS_NAMES: &[&str] = &[ClassificationLoss::NAME];

struct SourceMetrics {
    scce: Mean,
    domain_acc: DomainAccuracies,
    target_acc: Accuracy,
}

/// Shared backbone + top trained with summed source cross-entropy.
pub struct SourceTrainStep {
    domains: DomainList,
    iteration: i64,
    flags: ForwardFlags,
    backbone: Model,
    top: Model,
    classification: ClassificationLoss,
    metrics: SourceMetrics,
    optimizer: JointOptimizer,
}

impl SourceTrainStep {
    /// Build models and optimizer for `domains`.
    ///
    /// # Errors
    ///
    /// Factory failures and optimizer construction errors.
    pub fn new(
        backbone_factory: &dyn BackboneFactory,
        top_factory: &dyn TopFactory,
        domains: DomainList,
        config: &StepConfig,
    ) -> TrainResult<Self> {
        let backbone = build_backbone(backbone_factory, config, "backbone")?;
        let top = top_factory.build_top(config.num_classes as i64)?.with_name("top");
        let optimizer = JointOptimizer::adam("optimizer", &[&backbone, &top], config.learning_rate)?;
        let metrics = SourceMetrics {
            scce: Mean::new(),
            domain_acc: DomainAccuracies::new(domains.sources()),
            target_acc: Accuracy::new(),
        };
        Ok(SourceTrainStep {
            flags: ForwardFlags::train(config.backbone_training),
            classification: ClassificationLoss::new(config.batch_size),
            domains,
            iteration: 0,
            backbone,
            top,
            metrics,
            optimizer,
        })
    }

    /// Running target accuracy, scored in inference mode every call.
    pub fn target_accuracy(&self) -> &Accuracy {
        &self.metrics.target_acc
    }

    /// Everything after validation; the caller rolls back buffers on error.
    fn apply(&mut self, batch: &TrainBatch) -> TrainResult<()> {
        let target = batch.target().ok_or(TrainError::EmptyBatch)?;
        let images: Vec<&Tensor> = batch.sources().iter().map(|r| &r.image).collect();
        let labels: Vec<&Tensor> = batch.sources().iter().map(|r| &r.label).collect();

        let out = run_balanced(&self.backbone, Heads::Shared(&self.top), &images, self.flags)?;
        let predictions = (0..images.len())
            .map(|i| out.prediction(i))
            .collect::<TrainResult<Vec<_>>>()?;
        let loss = self.classification.forward(&predictions, &labels)?;
        let scce = ensure_finite(ClassificationLoss::NAME, &loss)?;

        let source_counts = predictions
            .iter()
            .zip(&labels)
            .map(|(p, y)| Accuracy::batch_counts(p, y))
            .collect::<TrainResult<Vec<_>>>()?;
        let target_pred = predict(&self.backbone, &self.top, &target.image);
        let target_counts = Accuracy::batch_counts(&target_pred, &target.label)?;

        self.optimizer.backward_step(&loss)?;

        self.metrics.scce.update(scce);
        for (i, counts) in source_counts.into_iter().enumerate() {
            self.metrics.domain_acc.record(i, counts);
        }
        self.metrics.target_acc.record(target_counts);
        self.iteration += 1;
        debug!(iteration = self.iteration, scce, "source step");
        Ok(())
    }
}

impl TrainStep for SourceTrainStep {
    fn paradigm(&self) -> Paradigm {
        Paradigm::Source
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
        let mut out = vec![("scce".to_string(), self.metrics.scce.result())];
        self.metrics.domain_acc.export_into(&mut out);
        out.push(("target_acc".to_string(), self.metrics.target_acc.result()));
        out
    }

    fn reset_metrics(&mut self) {
        self.metrics.scce.reset();
        self.metrics.domain_acc.reset();
        self.metrics.target_acc.reset();
    }

    fn loss_names(&self) -> &'static [&'static str] {
        LOSS_NAMES
    }
}

// ---------------------------------------------------------------------------
// SourceTestStep
// ---------------------------------------------------------------------------

/// Backbone + top evaluated in inference mode; predictions are averaged over
/// the entries of `TestBatch::image`.
///
/// Also serves DANN (the discriminator is not needed at test time) and the
/// domain classifier (built with one output per domain).
pub struct SourceTestStep {
    iteration: i64,
    backbone: Model,
    top: Model,
    acc: Accuracy,
    confusion: ConfusionMatrix,
}

/// DANN evaluates exactly like the source baseline.
pub type DannTestStep = SourceTestStep;

impl SourceTestStep {
    /// Test step with `config.num_classes` outputs.
    pub fn new(
        backbone_factory: &dyn BackboneFactory,
        top_factory: &dyn TopFactory,
        config: &StepConfig,
    ) -> TrainResult<Self> {
        Self::with_outputs(backbone_factory, top_factory, config, config.num_classes)
    }

    /// Test step whose head has `n_outputs` classes.
    pub fn with_outputs(
        backbone_factory: &dyn BackboneFactory,
        top_factory: &dyn TopFactory,
        config: &StepConfig,
        n_outputs: usize,
    ) -> TrainResult<Self> {
        let backbone = backbone_factory
            .build_backbone(&config.backbone, config.image_size as i64)?
            .with_name("backbone");
        let top = top_factory.build_top(n_outputs as i64)?.with_name("top");
        Ok(SourceTestStep {
            iteration: 0,
            backbone,
            top,
            acc: Accuracy::new(),
            confusion: ConfusionMatrix::new(n_outputs),
        })
    }

    /// Rename the models, e.g. to restore a self-ensembling teacher.
    pub fn with_model_names(mut self, backbone: &str, top: &str) -> Self {
        self.backbone = self.backbone.with_name(backbone);
        self.top = self.top.with_name(top);
        self
    }
}

impl TestStep for SourceTestStep {
    fn test(&mut self, batch: &TestBatch) -> TrainResult<TestOutput> {
        batch.validate()?;
        let predictions = average(
            batch
                .image
                .iter()
                .map(|image| predict(&self.backbone, &self.top, image))
                .collect(),
        )?;
        let counts = Accuracy::batch_counts(&predictions, &batch.label)?;
        self.confusion.update(&predictions, &batch.label)?;
        self.acc.record(counts);
        self.iteration += 1;
        Ok(TestOutput { paths: batch.path.clone(), predictions })
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

    fn metrics(&self) -> Vec<(String, f64)> {
        vec![("acc".to_string(), self.acc.result())]
    }

    fn reset_metrics(&mut self) {
        self.acc.reset();
        self.confusion.reset();
    }

    fn confusion_matrix(&self) -> &ConfusionMatrix {
        &self.confusion
    }
}
