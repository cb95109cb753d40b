//! Self-ensembling (mean teacher) domain adaptation.
//!
//! The student is trained by gradient on labelled sources plus a consistency
//! term on the target; the teacher is an exponential moving average of the
//! student and is never back-propagated.
//!
//! ```text
//!  target view A ──► student ──┐
//!                              ├──► consistency (MSE of probabilities)
//!  target view B ──► teacher ──┘        (teacher side detached)
//!
//!  after each step: teacher ← decay · teacher + (1 − decay) · student
//! ```
//!
//! View B is the record's `augmented` tensor, produced by
//! [`crate::augment::SelfEnsemblingPreprocessor`].

use tch::Tensor;
use tracing::debug;

use super::source::SourceTestStep;
use super::{build_backbone, predict, JointOptimizer, TestOutput, TestStep, TrainStep};
use crate::balanced::{run_balanced, ForwardFlags, Heads};
use crate::batch::{DomainList, TestBatch, TrainBatch};
use crate::config::{Paradigm, StepConfig};
use crate::error::{TrainError, TrainResult};
use crate::losses::{ensure_finite, ClassificationLoss, ConsistencyLoss};
use crate::metrics::{Accuracy, ConfusionMatrix, DomainAccuracies, Mean, Metric};
use crate::model::{BackboneFactory, BufferSnapshot, Model, TopFactory};

const LOSS_NAMES: &[&str] = &[ClassificationLoss::NAME, ConsistencyLoss::NAME];

struct SelfEnsemblingMetrics {
    scce: Mean,
    cons: Mean,
    domain_acc: DomainAccuracies,
    target_acc: Accuracy,
}

/// Student/teacher pair with EMA teacher updates.
pub struct SelfEnsemblingTrainStep {
    domains: DomainList,
    iteration: i64,
    flags: ForwardFlags,
    student_backbone: Model,
    student_top: Model,
    teacher_backbone: Model,
    teacher_top: Model,
    classification: ClassificationLoss,
    consistency: ConsistencyLoss,
    consistency_weight: f64,
    ema_decay: f64,
    metrics: SelfEnsemblingMetrics,
    optimizer: JointOptimizer,
}

impl SelfEnsemblingTrainStep {
    /// Build student and teacher; the teacher starts as an exact copy of the
    /// student and is frozen.
    pub fn new(
        backbone_factory: &dyn BackboneFactory,
        top_factory: &dyn TopFactory,
        domains: DomainList,
        config: &StepConfig,
    ) -> TrainResult<Self> {
        let student_backbone = build_backbone(backbone_factory, config, "student_backbone")?;
        let student_top = top_factory
            .build_top(config.num_classes as i64)?
            .with_name("student_top");

        let mut teacher_backbone = backbone_factory
            .build_backbone(&config.backbone, config.image_size as i64)?
            .with_name("teacher_backbone");
        let mut teacher_top = top_factory
            .build_top(config.num_classes as i64)?
            .with_name("teacher_top");
        teacher_backbone.copy_weights_from(&student_backbone)?;
        teacher_top.copy_weights_from(&student_top)?;
        teacher_backbone.freeze();
        teacher_top.freeze();

        let optimizer = JointOptimizer::adam(
            "optimizer",
            &[&student_backbone, &student_top],
            config.learning_rate,
        )?;
        let metrics = SelfEnsemblingMetrics {
            scce: Mean::new(),
            cons: Mean::new(),
            domain_acc: DomainAccuracies::new(domains.sources()),
            target_acc: Accuracy::new(),
        };
        Ok(SelfEnsemblingTrainStep {
            flags: ForwardFlags::train(config.backbone_training),
            classification: ClassificationLoss::new(config.batch_size),
            consistency: ConsistencyLoss::new(config.confidence_threshold),
            consistency_weight: config.consistency_weight,
            ema_decay: config.ema_decay,
            domains,
            iteration: 0,
            student_backbone,
            student_top,
            teacher_backbone,
            teacher_top,
            metrics,
            optimizer,
        })
    }

    /// The EMA teacher as `(backbone, top)`.
    pub fn teacher(&self) -> (&Model, &Model) {
        (&self.teacher_backbone, &self.teacher_top)
    }

    /// The gradient-trained student as `(backbone, top)`.
    pub fn student(&self) -> (&Model, &Model) {
        (&self.student_backbone, &self.student_top)
    }

    /// Student update, then EMA into the teacher. Requires a validated batch.
    fn apply(&mut self, batch: &TrainBatch) -> TrainResult<()> {
        let n_sources = self.domains.n_sources();
        let target = batch.target().ok_or(TrainError::EmptyBatch)?;
        let view_b = target.augmented.as_ref().ok_or(TrainError::MissingAugmentedView)?;
        let images: Vec<&Tensor> = batch.records().iter().map(|r| &r.image).collect();
        let labels: Vec<&Tensor> = batch.sources().iter().map(|r| &r.label).collect();

        let out = run_balanced(
            &self.student_backbone,
            Heads::Shared(&self.student_top),
            &images,
            self.flags,
        )?;
        let predictions = (0..images.len())
            .map(|i| out.prediction(i))
            .collect::<TrainResult<Vec<_>>>()?;
        let cls = self.classification.forward(&predictions[..n_sources], &labels)?;
        let teacher_b = predict(&self.teacher_backbone, &self.teacher_top, view_b);
        let cons = self.consistency.forward(predictions[n_sources], &teacher_b)?;

        let scce = ensure_finite(ClassificationLoss::NAME, &cls)?;
        let cons_value = ensure_finite(ConsistencyLoss::NAME, &cons)?;
        let loss = &cls + &cons * self.consistency_weight;

        let source_counts = predictions[..n_sources]
            .iter()
            .zip(&labels)
            .map(|(p, y)| Accuracy::batch_counts(p, y))
            .collect::<TrainResult<Vec<_>>>()?;
        let teacher_a = predict(&self.teacher_backbone, &self.teacher_top, &target.image);
        let target_counts = Accuracy::batch_counts(&teacher_a, &target.label)?;

        self.optimizer.backward_step(&loss)?;
        self.teacher_backbone.ema_update(&self.student_backbone, self.ema_decay)?;
        self.teacher_top.ema_update(&self.student_top, self.ema_decay)?;

        self.metrics.scce.update(scce);
        self.metrics.cons.update(cons_value);
        for (i, counts) in source_counts.into_iter().enumerate() {
            self.metrics.domain_acc.record(i, counts);
        }
        self.metrics.target_acc.record(target_counts);
        self.iteration += 1;
        debug!(iteration = self.iteration, scce, cons = cons_value, "self-ensembling step");
        Ok(())
    }
}

impl TrainStep for SelfEnsemblingTrainStep {
    fn paradigm(&self) -> Paradigm {
        Paradigm::SelfEnsembling
    }

    fn domains(&self) -> &DomainList {
        &self.domains
    }

    fn train(&mut self, batch: &TrainBatch) -> TrainResult<()> {
        batch.validate(&self.domains)?;
        let buffers = BufferSnapshot::capture(&[&self.student_backbone, &self.student_top]);
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
        vec![
            &self.student_backbone,
            &self.student_top,
            &self.teacher_backbone,
            &self.teacher_top,
        ]
    }

    fn models_mut(&mut self) -> Vec<&mut Model> {
        vec![
            &mut self.student_backbone,
            &mut self.student_top,
            &mut self.teacher_backbone,
            &mut self.teacher_top,
        ]
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
            ("cons".to_string(), m.cons.result()),
        ];
        m.domain_acc.export_into(&mut out);
        out.push(("target_acc".to_string(), m.target_acc.result()));
        out
    }

    fn reset_metrics(&mut self) {
        let m = &mut self.metrics;
        m.scce.reset();
        m.cons.reset();
        m.domain_acc.reset();
        m.target_acc.reset();
    }

    fn loss_names(&self) -> &'static [&'static str] {
        LOSS_NAMES
    }
}

// ---------------------------------------------------------------------------
// SelfEnsemblingTestStep
// ---------------------------------------------------------------------------

/// Evaluates the EMA teacher (`teacher_backbone`, `teacher_top`).
pub struct SelfEnsemblingTestStep {
    inner: SourceTestStep,
}

impl SelfEnsemblingTestStep {
    /// Build teacher-named models for checkpoint restore.
    pub fn new(
        backbone_factory: &dyn BackboneFactory,
        top_factory: &dyn TopFactory,
        config: &StepConfig,
    ) -> TrainResult<Self> {
        let inner = SourceTestStep::new(backbone_factory, top_factory, config)?
            .with_model_names("teacher_backbone", "teacher_top");
        Ok(SelfEnsemblingTestStep { inner })
    }
}

impl TestStep for SelfEnsemblingTestStep {
    fn test(&mut self, batch: &TestBatch) -> TrainResult<TestOutput> {
        self.inner.test(batch)
    }

    fn iteration(&self) -> i64 {
        self.inner.iteration()
    }

    fn set_iteration(&mut self, iteration: i64) {
        self.inner.set_iteration(iteration);
    }

    fn models(&self) -> Vec<&Model> {
        self.inner.models()
    }

    fn models_mut(&mut self) -> Vec<&mut Model> {
        self.inner.models_mut()
    }

    fn metrics(&self) -> Vec<(String, f64)> {
        self.inner.metrics()
    }

    fn reset_metrics(&mut self) {
        self.inner.reset_metrics();
    }

    fn confusion_matrix(&self) -> &ConfusionMatrix {
        self.inner.confusion_matrix()
    }
}
