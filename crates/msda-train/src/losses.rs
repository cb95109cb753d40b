//! Loss functions for the domain-adaptation train steps.
//!
//! Heads end in a softmax, so every classification-style loss here consumes
//! **probabilities**, not logits:
//!
//! - [`ClassificationLoss`]: per-domain summed sparse categorical
//!   cross-entropy, summed across domains and divided by the configured batch
//!   size.
//! - [`DomainLoss`]: the same reduction against domain-index labels (DANN
//!   discriminator, domain classifier).
//! - [`MomentMatchingLoss`]: M3SDA moment discrepancy between source and
//!   target feature distributions.
//! - [`ConsistencyLoss`]: squared difference between student and teacher
//!   class probabilities (self-ensembling).
//!
//! ```text
//! L_cls = (Σ_d Σ_b −log p_d[b, y_d[b]]) / batch_size
//! ```

use tch::{Kind, Tensor};

use crate::batch::domain_labels;
use crate::domain::pool_features;
use crate::error::{TrainError, TrainResult};

/// Probabilities are clipped to `[ε, 1 − ε]` before the logarithm.
pub const PROBABILITY_EPSILON: f64 = 1e-7;

// ─────────────────────────────────────────────────────────────────────────────
// Cross-entropy on probabilities
// ─────────────────────────────────────────────────────────────────────────────

/// `Σ_b −log(probs[b, labels[b]])` with clipped probabilities.
///
/// # Shapes
/// - `probs`: `[B, K]`
/// - `labels`: `[B]` integer class indices in `0..K`
pub fn sparse_categorical_crossentropy_sum(probs: &Tensor, labels: &Tensor) -> Tensor {
    let log_p = probs
        .clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON)
        .log();
    let index = labels.to_kind(Kind::Int64).unsqueeze(1);
    -log_p.gather(1, &index, false).sum(Kind::Float)
}

fn scalar_zero(device: tch::Device) -> Tensor {
    Tensor::zeros(&[] as &[i64], (Kind::Float, device))
}

fn check_pairs(predictions: usize, labels: usize) -> TrainResult<()> {
    if predictions == 0 {
        return Err(TrainError::EmptyBatch);
    }
    if predictions != labels {
        return Err(TrainError::BatchLengthMismatch { expected: predictions, actual: labels });
    }
    Ok(())
}

/// `gather` aborts inside libtorch on an out-of-range index, so labels are
/// checked against the head width first.
fn check_label_range(index: usize, probs: &Tensor, labels: &Tensor) -> TrainResult<()> {
    if labels.numel() == 0 {
        return Ok(());
    }
    let n_classes = probs.size().last().copied().unwrap_or(0);
    let labels = labels.to_kind(Kind::Int64);
    for label in [labels.min().int64_value(&[]), labels.max().int64_value(&[])] {
        if !(0..n_classes).contains(&label) {
            return Err(TrainError::LabelOutOfRange { index, label, n_classes });
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// ClassificationLoss
// ─────────────────────────────────────────────────────────────────────────────

/// Summed cross-entropy across domains, normalised by the configured batch
/// size (not by the number of domains).
#[derive(Debug, Clone, Copy)]
pub struct ClassificationLoss {
    batch_size: i64,
}

impl ClassificationLoss {
    /// Registry name.
    pub const NAME: &'static str = "classification";

    /// Loss normalised by `batch_size` (clamped to at least 1).
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size: batch_size.max(1) as i64 }
    }

    /// Divisor applied to the summed cross-entropy.
    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// Compute the loss over index-aligned `predictions` and `labels`.
    ///
    /// # Errors
    ///
    /// [`TrainError::EmptyBatch`] without predictions,
    /// [`TrainError::BatchLengthMismatch`] when the two lists differ in length
    /// and [`TrainError::LabelOutOfRange`] for a label outside the head.
    pub fn forward(&self, predictions: &[&Tensor], labels: &[&Tensor]) -> TrainResult<Tensor> {
        check_pairs(predictions.len(), labels.len())?;
        for (index, (p, y)) in predictions.iter().zip(labels).enumerate() {
            check_label_range(index, p, y)?;
        }
        let total = predictions
            .iter()
            .zip(labels)
            .map(|(p, y)| sparse_categorical_crossentropy_sum(p, y))
            .reduce(|acc, l| acc + l)
            .ok_or(TrainError::EmptyBatch)?;
        Ok(total / self.batch_size as f64)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DomainLoss
// ─────────────────────────────────────────────────────────────────────────────

/// Cross-entropy of domain predictions against the domain index: prediction
/// `i` is scored against label `i` for every sample.
#[derive(Debug, Clone, Copy)]
pub struct DomainLoss {
    inner: ClassificationLoss,
}

impl DomainLoss {
    /// Registry name.
    pub const NAME: &'static str = "domain";

    /// Loss normalised by `batch_size`.
    pub fn new(batch_size: usize) -> Self {
        Self { inner: ClassificationLoss::new(batch_size) }
    }

    /// `predictions[i]` holds domain probabilities for inputs of domain `i`.
    pub fn forward(&self, predictions: &[&Tensor]) -> TrainResult<Tensor> {
        let labels: Vec<Tensor> = predictions
            .iter()
            .enumerate()
            .map(|(i, p)| domain_labels(p.size()[0], i, p.device()))
            .collect();
        let label_refs: Vec<&Tensor> = labels.iter().collect();
        self.inner.forward(predictions, &label_refs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MomentMatchingLoss
// ─────────────────────────────────────────────────────────────────────────────

/// M3SDA moment discrepancy.
///
/// For each order `k = 1..=order`, with `m_k(F) = mean_b(F[b]^k)` over pooled
/// features `[B, D]`:
///
/// ```text
/// MD = Σ_k [ mean_i ‖m_k(S_i) − m_k(T)‖₂ + mean_{i<j} ‖m_k(S_i) − m_k(S_j)‖₂ ]
/// ```
///
/// The source-source term is zero with a single source.
#[derive(Debug, Clone, Copy)]
pub struct MomentMatchingLoss {
    order: usize,
}

impl MomentMatchingLoss {
    /// Registry name.
    pub const NAME: &'static str = "moment";

    /// Align raw moments up to `order` (clamped to at least 1).
    pub fn new(order: usize) -> Self {
        Self { order: order.max(1) }
    }

    /// Highest moment order aligned.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Discrepancy between each source feature batch and the target batch.
    ///
    /// # Errors
    ///
    /// [`TrainError::EmptyBatch`] without sources and
    /// [`TrainError::ShapeMismatch`] when pooled widths differ.
    pub fn forward(&self, sources: &[&Tensor], target: &Tensor) -> TrainResult<Tensor> {
        if sources.is_empty() {
            return Err(TrainError::EmptyBatch);
        }
        let pooled_target = pool_features(target);
        let pooled_sources: Vec<Tensor> = sources.iter().map(|f| pool_features(f)).collect();
        let width = pooled_target.size();
        for s in &pooled_sources {
            if s.size()[1..] != width[1..] {
                return Err(TrainError::shape_mismatch(width.clone(), s.size()));
            }
        }

        let n = pooled_sources.len();
        let mut total = scalar_zero(target.device());
        for k in 1..=self.order {
            let moment = |f: &Tensor| {
                f.pow_tensor_scalar(k as f64)
                    .mean_dim(Some([0_i64].as_slice()), false, Kind::Float)
            };
            let m_t = moment(&pooled_target);
            let m_s: Vec<Tensor> = pooled_sources.iter().map(moment).collect();

            let mut st = scalar_zero(target.device());
            for m in &m_s {
                st = st + (m - &m_t).norm();
            }
            total = total + st / n as f64;

            if n > 1 {
                let mut ss = scalar_zero(target.device());
                for i in 0..n {
                    for j in (i + 1)..n {
                        ss = ss + (&m_s[i] - &m_s[j]).norm();
                    }
                }
                let pairs = (n * (n - 1) / 2) as f64;
                total = total + ss / pairs;
            }
        }
        Ok(total)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConsistencyLoss
// ─────────────────────────────────────────────────────────────────────────────

/// Mean squared difference between student and teacher class probabilities.
///
/// The teacher side is detached. With a positive `confidence_threshold`,
/// samples whose teacher max-probability is below the threshold contribute
/// zero; the mean still divides by the full batch.
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyLoss {
    confidence_threshold: f64,
}

impl ConsistencyLoss {
    /// Registry name.
    pub const NAME: &'static str = "consistency";

    /// `0.0` disables confidence masking.
    pub fn new(confidence_threshold: f64) -> Self {
        Self { confidence_threshold }
    }

    /// Compute the loss.
    ///
    /// # Errors
    ///
    /// [`TrainError::ShapeMismatch`] when the two probability tensors differ.
    pub fn forward(&self, student: &Tensor, teacher: &Tensor) -> TrainResult<Tensor> {
        if student.size() != teacher.size() {
            return Err(TrainError::shape_mismatch(student.size(), teacher.size()));
        }
        let teacher = teacher.detach();
        let per_sample = (student - &teacher)
            .pow_tensor_scalar(2)
            .mean_dim(Some([1_i64].as_slice()), false, Kind::Float);
        if self.confidence_threshold <= 0.0 {
            return Ok(per_sample.mean(Kind::Float));
        }
        let (confidence, _) = teacher.max_dim(1, false);
        let mask = confidence.ge(self.confidence_threshold).to_kind(Kind::Float);
        Ok((per_sample * mask).mean(Kind::Float))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Finiteness guard
// ─────────────────────────────────────────────────────────────────────────────

/// Extract the scalar value of `loss`, rejecting NaN and infinities.
///
/// # Errors
///
/// [`TrainError::NonFiniteLoss`] for a non-finite value.
pub fn ensure_finite(name: &'static str, loss: &Tensor) -> TrainResult<f64> {
    let value = loss.f_double_value(&[])?;
    if value.is_finite() {
        Ok(value)
    } else {
        tracing::warn!(loss = name, value, "rejecting non-finite loss");
        Err(TrainError::NonFiniteLoss { name, value })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
