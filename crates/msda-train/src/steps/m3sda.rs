//! Moment matching for multi-source domain adaptation (M3SDA).
//!
//! One shared backbone, one classification head per source domain
//! (`top_<domain>`). Training aligns raw feature moments across all domains;
//! inference averages the predictions of every source head.

use tch::Tensor;
use tracing::debug;

use super::{average, build_backbone, JointOptimizer, TestOutput, TestStep, TrainStep};
use crate::balanced::{run_balanced, ForwardFlags, Heads};
use crate::batch::{DomainList, TestBatch, TrainBatch};
use crate::config::{Paradigm, StepConfig};
use crate::error::{TrainError, TrainResult};
use crate::losses::{ensure_finite, ClassificationLoss, MomentMatchingLoss};
use crate::metrics::{Accuracy, ConfusionMatrix, DomainAccuracies, Mean, Metric};
use crate::model::{BackboneFactory, BufferSnapshot, Model, TopFactory};

const LOSS_NAMES: &[&str] = &[ClassificationLoss::NAME, MomentMatchingLoss::NAME];

fn build_tops(
    top_factory: &dyn TopFactory,
    domains: &DomainList,
    n_classes: usize,
) -> TrainResult<Vec<Model>> {
    domains
        .sources()
        .iter()
        .map(|d| -> TrainResult<Model> {
            Ok(top_factory.build_top(n_classes as i64)?.with_name(format!("top_{d}")))
        })
        .collect()
}

/// Mean of every head's prediction on `features`, without gradients.
fn ensemble(tops: &[Model], features: &Tensor) -> TrainResult<Tensor> {
    tch::no_grad(|| average(tops.iter().map(|t| t.forward_t(features, false)).collect()))
}

struct M3sdaMetrics {
    scce: Mean,
    md: Mean,
    domain_acc: DomainAccuracies,
    target_acc: Accuracy,
}

/// Shared backbone, per-source heads, moment-discrepancy regularisation.
pub struct M3sdaTrainStep {
    domains: DomainList,
    iteration: i64,
    flags: ForwardFlags,
    backbone: Model,
    tops: Vec<Model>,
    classification: ClassificationLoss,
    moment: MomentMatchingLoss,
    moment_weight: f64,
    metrics: M3sdaMetrics,
    optimizer: JointOptimizer,
}

impl M3sdaTrainStep {
    /// Build the backbone, one head per source and the optimizer.
    pub fn new(
        backbone_factory: &dyn BackboneFactory,
        top_factory: &dyn TopFactory,
        domains: DomainList,
        config: &StepConfig,
    ) -> TrainResult<Self> {
        let backbone = build_backbone(backbone_factory, config, "backbone")?;
        let tops = build_tops(top_factory, &domains, config.num_classes)?;
        let mut trained: Vec<&Model> = vec![&backbone];
        trained.extend(tops.iter());
        let optimizer = JointOptimizer::adam("optimizer", &trained, config.learning_rate)?;
        let metrics = M3sdaMetrics {
            scce: Mean::new(),
            md: Mean::new(),
            domain_acc: DomainAccuracies::new(domains.sources()),
            target_acc: Accuracy::new(),
        };
        Ok(M3sdaTrainStep {
            flags: ForwardFlags::train(config.backbone_training),
            classification: ClassificationLoss::new(config.batch_size),
            moment: MomentMatchingLoss::new(config.moment_order),
            moment_weight: config.moment_weight,
            domains,
            iteration: 0,
            backbone,
            tops,
            metrics,
            optimizer,
        })
    }

    fn apply(&mut self, batch: &TrainBatch) -> TrainResult<()> {
        let n_sources = self.domains.n_sources();
        let target = batch.target().ok_or(TrainError::EmptyBatch)?;
        let images: Vec<&Tensor> = batch.records().iter().map(|r| &r.image).collect();
        let labels: Vec<&Tensor> = batch.sources().iter().map(|r| &r.label).collect();

        // The target has no head of its own: it only contributes features.
        let out = run_balanced(&self.backbone, Heads::PerDomain(&self.tops), &images, self.flags)?;
        let predictions = (0..n_sources)
            .map(|i| out.prediction(i))
            .collect::<TrainResult<Vec<_>>>()?;
        let cls = self.classification.forward(&predictions, &labels)?;
        let source_features: Vec<&Tensor> = out.features[..n_sources].iter().collect();
        let md = self.moment.forward(&source_features, &out.features[n_sources])?;

        let scce = ensure_finite(ClassificationLoss::NAME, &cls)?;
        let md_value = ensure_finite(MomentMatchingLoss::NAME, &md)?;
        let loss = &cls + &md * self.moment_weight;

        let source_counts = predictions
            .iter()
            .zip(&labels)
            .map(|(p, y)| Accuracy::batch_counts(p, y))
            .collect::<TrainResult<Vec<_>>>()?;
        let target_features = tch::no_grad(|| self.backbone.forward_t(&target.image, false));
        let target_pred = ensemble(&self.tops, &target_features)?;
        let target_counts = Accuracy::batch_counts(&target_pred, &target.label)?;

        self.optimizer.backward_step(&loss)?;

        self.metrics.scce.update(scce);
        self.metrics.md.update(md_value);
        for (i, counts) in source_counts.into_iter().enumerate() {
            self.metrics.domain_acc.record(i, counts);
        }
        self.metrics.target_acc.record(target_counts);
        self.iteration += 1;
        debug!(iteration = self.iteration, scce, md = md_value, "m3sda step");
        Ok(())
    }
}

impl TrainStep for M3sdaTrainStep {
    fn paradigm(&self) -> Paradigm {
        Paradigm::M3sda
    }

    fn domains(&self) -> &DomainList {
        &self.domains
    }

    fn train(&mut self, batch: &TrainBatch) -> TrainResult<()> {
        batch.validate(&self.domains)?;
        let buffers = BufferSnapshot::capture(&self.models());
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
        std::iter::once(&self.backbone).chain(self.tops.iter()).collect()
    }

    fn models_mut(&mut self) -> Vec<&mut Model> {
        std::iter::once(&mut self.backbone).chain(self.tops.iter_mut()).collect()
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
            ("md".to_string(), m.md.result()),
        ];
        m.domain_acc.export_into(&mut out);
        out.push(("target_acc".to_string(), m.target_acc.result()));
        out
    }

    fn reset_metrics(&mut self) {
        let m = &mut self.metrics;
        m.scce.reset();
        m.md.reset();
        m.domain_acc.reset();
        m.target_acc.reset();
    }

    fn loss_names(&self) -> &'static [&'static str] {
        LOSS_NAMES
    }
}

// ---------------------------------------------------------------------------
// M3sdaTestStep
// ---------------------------------------------------------------------------

/// Averages every source head over every image view.
pub struct M3sdaTestStep {
    iteration: i64,
    backbone: Model,
    tops: Vec<Model>,
    acc: Accuracy,
    confusion: ConfusionMatrix,
}

impl M3sdaTestStep {
    /// Build the backbone and one head per source of `domains`.
    pub fn new(
        backbone_factory: &dyn BackboneFactory,
        top_factory: &dyn TopFactory,
        domains: &DomainList,
        config: &StepConfig,
    ) -> TrainResult<Self> {
        let backbone = backbone_factory
            .build_backbone(&config.backbone, config.image_size as i64)?
            .with_name("backbone");
        let tops = build_tops(top_factory, domains, config.num_classes)?;
        Ok(M3sdaTestStep {
            iteration: 0,
            backbone,
            tops,
            acc: Accuracy::new(),
            confusion: ConfusionMatrix::new(config.num_classes),
        })
    }
}

impl TestStep for M3sdaTestStep {
    fn test(&mut self, batch: &TestBatch) -> TrainResult<TestOutput> {
        batch.validate()?;
        let per_view = batch
            .image
            .iter()
            .map(|image| {
                let features = tch::no_grad(|| self.backbone.forward_t(image, false));
                ensemble(&self.tops, &features)
            })
            .collect::<TrainResult<Vec<_>>>()?;
        let predictions = average(per_view)?;
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
        std::iter::once(&self.backbone).chain(self.tops.iter()).collect()
    }

    fn models_mut(&mut self) -> Vec<&mut Model> {
        std::iter::once(&mut self.backbone).chain(self.tops.iter_mut()).collect()
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
