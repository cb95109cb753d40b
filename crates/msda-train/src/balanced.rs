//! Balanced multi-domain dispatch.
//!
//! [`run_balanced`] pushes one input per domain through a shared backbone and
//! the selected head(s) inside a single gradient-enabled scope. The returned
//! features and predictions are index-aligned with the inputs; the caller
//! builds its loss from them and runs exactly one backward pass.

use tch::Tensor;

use crate::error::{TrainError, TrainResult};
use crate::model::Model;

/// Which heads follow the backbone.
#[derive(Clone, Copy)]
pub enum Heads<'a> {
    /// One head shared by every domain.
    Shared(&'a Model),
    /// `heads[i]` is applied to input `i`. Inputs without a head (e.g. the
    /// target in M3SDA) only produce features.
    PerDomain(&'a [Model]),
    /// No head; only features are produced.
    FeaturesOnly,
}

/// Normalisation-layer behaviour for the backbone and the heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardFlags {
    /// `train` flag passed to the backbone.
    pub backbone_training: bool,
    /// `train` flag passed to the heads.
    pub top_training: bool,
}

impl ForwardFlags {
    /// Training-time flags; the backbone follows `backbone_training`.
    pub fn train(backbone_training: bool) -> Self {
        ForwardFlags { backbone_training, top_training: true }
    }

    /// Inference flags for both parts.
    pub fn inference() -> Self {
        ForwardFlags { backbone_training: false, top_training: false }
    }
}

/// Per-domain outputs of [`run_balanced`].
pub struct BalancedOutput {
    /// Backbone features, one per input.
    pub features: Vec<Tensor>,
    /// Head outputs; `None` where no head applies.
    pub predictions: Vec<Option<Tensor>>,
}

impl BalancedOutput {
    /// Prediction for input `i`.
    ///
    /// # Errors
    ///
    /// [`TrainError::HeadCountMismatch`] when input `i` had no head.
    pub fn prediction(&self, i: usize) -> TrainResult<&Tensor> {
        self.predictions
            .get(i)
            .and_then(Option::as_ref)
            .ok_or(TrainError::HeadCountMismatch { heads: i, inputs: self.predictions.len() })
    }
}

/// Run `backbone` and `heads` over every input, gradients enabled.
///
/// # Errors
///
/// - [`TrainError::EmptyBatch`] when `inputs` is empty.
/// - [`TrainError::ShapeMismatch`] when inputs differ in shape.
/// - [`TrainError::HeadCountMismatch`] when more per-domain heads than
///   inputs are given.
pub fn run_balanced(
    backbone: &Model,
    heads: Heads<'_>,
    inputs: &[&Tensor],
    flags: ForwardFlags,
) -> TrainResult<BalancedOutput> {
    let first = inputs.first().ok_or(TrainError::EmptyBatch)?;
    let shape = first.size();
    for x in &inputs[1..] {
        if x.size() != shape {
            return Err(TrainError::shape_mismatch(shape, x.size()));
        }
    }
    if let Heads::PerDomain(models) = heads {
        if models.len() > inputs.len() {
            return Err(TrainError::HeadCountMismatch {
                heads: models.len(),
                inputs: inputs.len(),
            });
        }
    }

    let output = tch::with_grad(|| {
        let mut features = Vec::with_capacity(inputs.len());
        let mut predictions = Vec::with_capacity(inputs.len());
        for (i, x) in inputs.iter().enumerate() {
            let f = backbone.forward_t(x, flags.backbone_training);
            let head = match heads {
                Heads::Shared(top) => Some(top),
                Heads::PerDomain(tops) => tops.get(i),
                Heads::FeaturesOnly => None,
            };
            predictions.push(head.map(|top| top.forward_t(&f, flags.top_training)));
            features.push(f);
        }
        BalancedOutput { features, predictions }
    });
    Ok(output)
}
