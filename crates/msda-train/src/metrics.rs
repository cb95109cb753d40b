//! Running metrics for train and test steps.
//!
//! This module provides:
//!
//! - [`Mean`]: running average of scalar loss values (`scce`, `md`, ...).
//! - [`Accuracy`]: sparse categorical accuracy, `argmax(probs) == label`.
//! - [`DomainAccuracies`]: one [`Accuracy`] per domain, exported as
//!   `{domain}_acc`.
//! - [`ConfusionMatrix`]: `[true, predicted]` counts accumulated by test steps.
//!
//! Metrics accumulate across calls until `reset()`. Every step exports its
//! metrics as `(name, value)` pairs via [`Metric::result`].

use ndarray::{Array1, Array2};
use std::fmt::Write as _;
use tch::{Device, Kind, Tensor};

use crate::error::{TrainError, TrainResult};

/// A resettable running metric.
pub trait Metric {
    /// Current value; `0.0` before the first update.
    fn result(&self) -> f64;

    /// Discard all accumulated state.
    fn reset(&mut self);
}

// ---------------------------------------------------------------------------
// Mean
// ---------------------------------------------------------------------------

/// Running mean of scalar values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mean {
    total: f64,
    count: u64,
}

impl Mean {
    /// Empty mean.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one observation.
    pub fn update(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    /// Number of observations since the last reset.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Metric for Mean {
    fn result(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Accuracy
// ---------------------------------------------------------------------------

/// Sparse categorical accuracy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accuracy {
    correct: u64,
    total: u64,
}

impl Accuracy {
    /// Empty accuracy.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(correct, total)` for one batch of `[B, K]` probabilities and `[B]`
    /// labels, without touching any state.
    ///
    /// # Errors
    ///
    /// [`TrainError::ShapeMismatch`] when the batch dimensions differ.
    pub fn batch_counts(probs: &Tensor, labels: &Tensor) -> TrainResult<(u64, u64)> {
        let predicted = argmax_labels(probs)?;
        let truth = labels_to_vec(labels)?;
        if predicted.len() != truth.len() {
            return Err(TrainError::shape_mismatch(
                vec![truth.len() as i64],
                vec![predicted.len() as i64],
            ));
        }
        let correct = predicted.iter().zip(&truth).filter(|(p, t)| p == t).count();
        Ok((correct as u64, truth.len() as u64))
    }

    /// Add precomputed counts.
    pub fn record(&mut self, (correct, total): (u64, u64)) {
        self.correct += correct;
        self.total += total;
    }

    /// Score one batch.
    pub fn update(&mut self, probs: &Tensor, labels: &Tensor) -> TrainResult<()> {
        let counts = Self::batch_counts(probs, labels)?;
        self.record(counts);
        Ok(())
    }

    /// Samples scored since the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Metric for Accuracy {
    fn result(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// DomainAccuracies
// ---------------------------------------------------------------------------

/// One accuracy per domain, exported as `{domain}_acc`.
#[derive(Debug, Clone)]
pub struct DomainAccuracies {
    names: Vec<String>,
    accuracies: Vec<Accuracy>,
}

impl DomainAccuracies {
    /// Accuracies for `domains`, in order.
    pub fn new<S: AsRef<str>>(domains: &[S]) -> Self {
        DomainAccuracies {
            names: domains.iter().map(|d| format!("{}_acc", d.as_ref())).collect(),
            accuracies: vec![Accuracy::new(); domains.len()],
        }
    }

    /// Add counts for domain `i`; out-of-range indices are ignored.
    pub fn record(&mut self, i: usize, counts: (u64, u64)) {
        if let Some(acc) = self.accuracies.get_mut(i) {
            acc.record(counts);
        }
    }

    /// Accuracy of domain `i`.
    pub fn get(&self, i: usize) -> Option<&Accuracy> {
        self.accuracies.get(i)
    }

    /// Append `({domain}_acc, value)` pairs to `out`.
    pub fn export_into(&self, out: &mut Vec<(String, f64)>) {
        for (name, acc) in self.names.iter().zip(&self.accuracies) {
            out.push((name.clone(), acc.result()));
        }
    }

    /// Reset every domain.
    pub fn reset(&mut self) {
        self.accuracies.iter_mut().for_each(|acc| acc.reset());
    }
}

// ---------------------------------------------------------------------------
// ConfusionMatrix
// ---------------------------------------------------------------------------

/// Class confusion counts; rows are true labels, columns predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    counts: Array2<u64>,
}

impl ConfusionMatrix {
    /// Zeroed `n_classes × n_classes` matrix.
    pub fn new(n_classes: usize) -> Self {
        ConfusionMatrix { counts: Array2::zeros((n_classes, n_classes)) }
    }

    /// Number of classes.
    pub fn n_classes(&self) -> usize {
        self.counts.nrows()
    }

    /// Raw counts.
    pub fn counts(&self) -> &Array2<u64> {
        &self.counts
    }

    /// Score one batch. Samples with labels outside `0..n_classes` are
    /// skipped.
    pub fn update(&mut self, probs: &Tensor, labels: &Tensor) -> TrainResult<()> {
        let predicted = argmax_labels(probs)?;
        let truth = labels_to_vec(labels)?;
        let n = self.n_classes() as i64;
        for (&p, &t) in predicted.iter().zip(&truth) {
            if (0..n).contains(&p) && (0..n).contains(&t) {
                self.counts[[t as usize, p as usize]] += 1;
            }
        }
        Ok(())
    }

    /// Fraction of samples on the diagonal.
    pub fn accuracy(&self) -> f64 {
        let total = self.counts.sum();
        if total == 0 {
            return 0.0;
        }
        self.counts.diag().sum() as f64 / total as f64
    }

    /// Recall per true class; classes without samples score `0.0`.
    pub fn per_class_recall(&self) -> Array1<f64> {
        Array1::from_iter(self.counts.rows().into_iter().enumerate().map(|(i, row)| {
            let support = row.sum();
            if support == 0 {
                0.0
            } else {
                row[i] as f64 / support as f64
            }
        }))
    }

    /// Zero every count.
    pub fn reset(&mut self) {
        self.counts.fill(0);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn argmax_labels(probs: &Tensor) -> TrainResult<Vec<i64>> {
    let idx = probs.argmax(-1, false).to_device(Device::Cpu);
    Ok(Vec::<i64>::try_from(&idx)?)
}

fn labels_to_vec(labels: &Tensor) -> TrainResult<Vec<i64>> {
    let cpu = labels.to_kind(Kind::Int64).to_device(Device::Cpu);
    Ok(Vec::<i64>::try_from(&cpu)?)
}

/// Render `name=value` pairs on one line for logging.
pub fn summary(metrics: &[(String, f64)]) -> String {
    let mut out = String::new();
    for (i, (name, value)) in metrics.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{name}={value:.4}");
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
