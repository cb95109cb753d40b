//! Target-view augmentation for self-ensembling.
//!
//! [`SelfEnsemblingPreprocessor`] replaces the target record's image with one
//! random view and stores a second, independently drawn view in
//! `DomainBatch::augmented`. Each view applies, per sample:
//!
//! 1. horizontal flip with probability `flip_probability`,
//! 2. intensity scaling by a factor drawn uniformly from `intensity_range`,
//! 3. additive Gaussian noise with standard deviation `noise_std`.
//!
//! Randomness comes from libtorch's generator, so `tch::manual_seed` makes
//! the views reproducible.

use tch::{Kind, Tensor};

use crate::batch::TrainBatch;
use crate::error::{TrainError, TrainResult};

/// Produces the two target views consumed by the self-ensembling step.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfEnsemblingPreprocessor {
    /// Probability of a horizontal flip. Default: 0.5.
    pub flip_probability: f64,
    /// `(low, high)` intensity multiplier. Default: (0.8, 1.2).
    pub intensity_range: (f64, f64),
    /// Standard deviation of additive noise. Default: 0.05.
    pub noise_std: f64,
}

impl Default for SelfEnsemblingPreprocessor {
    fn default() -> Self {
        SelfEnsemblingPreprocessor {
            flip_probability: 0.5,
            intensity_range: (0.8, 1.2),
            noise_std: 0.05,
        }
    }
}

impl SelfEnsemblingPreprocessor {
    /// Draw one augmented view of `image` `[B, C, H, W]`.
    ///
    /// # Errors
    ///
    /// [`TrainError::ShapeMismatch`] for non-4-D input.
    pub fn view(&self, image: &Tensor) -> TrainResult<Tensor> {
        let size = image.size();
        if size.len() != 4 {
            return Err(TrainError::shape_mismatch(vec![-1, -1, -1, -1], size));
        }
        let per_sample = [size[0], 1, 1, 1];
        let opts = (Kind::Float, image.device());
        let (low, high) = self.intensity_range;

        let view = tch::no_grad(|| {
            let flip = Tensor::rand(per_sample, opts)
                .lt(self.flip_probability)
                .to_kind(Kind::Float);
            let keep = flip.ones_like() - &flip;
            let x = image.flip([3_i64]) * &flip + image * keep;
            let scale = Tensor::rand(per_sample, opts) * (high - low) + low;
            let x = x * scale;
            let noise = x.randn_like() * self.noise_std;
            x + noise
        });
        Ok(view)
    }

    /// Replace the target image with view A and attach view B.
    ///
    /// # Errors
    ///
    /// [`TrainError::EmptyBatch`] for a batch without records, or any
    /// [`SelfEnsemblingPreprocessor::view`] error.
    pub fn apply(&self, batch: &mut TrainBatch) -> TrainResult<()> {
        let target = batch.records_mut().last_mut().ok_or(TrainError::EmptyBatch)?;
        let view_a = self.view(&target.image)?;
        let view_b = self.view(&target.image)?;
        target.image = view_a;
        target.augmented = Some(view_b);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::DomainBatch;
    use tch::Device;

    fn record() -> DomainBatch {
        DomainBatch::new(
            Tensor::rand([4, 3, 8, 8], (Kind::Float, Device::Cpu)),
            Tensor::zeros([4], (Kind::Int64, Device::Cpu)),
        )
    }

    #[test]
    fn apply_attaches_second_view_to_target_only() {
        tch::manual_seed(3);
        let mut batch = TrainBatch::new(vec![record(), record()]);
        SelfEnsemblingPreprocessor::default().apply(&mut batch).unwrap();
        assert!(batch[0].augmented.is_none());
        let target = &batch[1];
        let view_b = target.augmented.as_ref().expect("target must carry view B");
        assert_eq!(view_b.size(), target.image.size());
        let diff = (view_b - &target.image).abs().max().double_value(&[]);
        assert!(diff > 0.0, "the two views must be drawn independently");
    }

    #[test]
    fn identity_settings_reproduce_input() {
        let pre = SelfEnsemblingPreprocessor {
            flip_probability: 0.0,
            intensity_range: (1.0, 1.0),
            noise_std: 0.0,
        };
        let x = Tensor::rand([2, 1, 4, 4], (Kind::Float, Device::Cpu));
        let y = pre.view(&x).unwrap();
        let diff = (y - &x).abs().max().double_value(&[]);
        assert!(diff < 1e-6, "got max diff {diff}");
    }

    #[test]
    fn certain_flip_mirrors_width_axis() {
        let pre = SelfEnsemblingPreprocessor {
            flip_probability: 1.0,
            intensity_range: (1.0, 1.0),
            noise_std: 0.0,
        };
        let x = Tensor::arange(4, (Kind::Float, Device::Cpu)).reshape([1, 1, 1, 4]);
        let y = pre.view(&x).unwrap();
        let expected = Tensor::from_slice(&[3.0_f32, 2.0, 1.0, 0.0]).reshape([1, 1, 1, 4]);
        assert!((y - expected).abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn rejects_flat_images() {
        let x = Tensor::zeros([2, 8], (Kind::Float, Device::Cpu));
        assert!(SelfEnsemblingPreprocessor::default().view(&x).is_err());
    }
}
