//! Adversarial domain-alignment building blocks.
//!
//! Components: [`GradientReverse`] (and the free function
//! [`gradient_reverse`]), [`AdversarialSchedule`] and [`pool_features`].
//!
//! Gradient reversal is expressed on tch autograd without a custom backward:
//!
//! ```text
//! y = x.detach() - scale * (x - x.detach())
//! ```
//!
//! `x - x.detach()` is numerically zero, so `y == x` exactly, while
//! `dy/dx = -scale`.

use tch::{Kind, Tensor};

// ---------------------------------------------------------------------------
// GradientReverse
// ---------------------------------------------------------------------------

/// Gradient Reversal Layer (Ganin & Lempitsky, ICML 2015).
///
/// Forward: identity. Backward: `-scale * grad`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientReverse {
    /// Reversal scaling factor, annealed via [`AdversarialSchedule`].
    pub scale: f64,
}

impl GradientReverse {
    /// Create a new reversal operator.
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }

    /// Apply the operator to `x`.
    pub fn forward(&self, x: &Tensor) -> Tensor {
        gradient_reverse(x, self.scale)
    }
}

/// Identity in the forward pass, `-scale * upstream` in the backward pass.
pub fn gradient_reverse(x: &Tensor, scale: f64) -> Tensor {
    let frozen = x.detach();
    let live = x - &frozen;
    &frozen - live * scale
}

// ---------------------------------------------------------------------------
// AdversarialSchedule
// ---------------------------------------------------------------------------

/// Scale annealing: `lambda(p) = 2 / (1 + exp(-10p)) - 1`,
/// `p = iteration / horizon` clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdversarialSchedule {
    /// Iterations over which the scale ramps up.
    pub horizon: usize,
}

impl AdversarialSchedule {
    /// Create a schedule; a zero horizon is treated as one iteration.
    pub fn new(horizon: usize) -> Self {
        Self { horizon: horizon.max(1) }
    }

    /// Training progress in `[0, 1]` at `iteration`.
    pub fn progress(&self, iteration: i64) -> f64 {
        (iteration as f64 / self.horizon as f64).clamp(0.0, 1.0)
    }

    /// Reversal scale for `iteration`. Returns a value in `[0, 1)`.
    pub fn lambda(&self, iteration: i64) -> f64 {
        let p = self.progress(iteration);
        2.0 / (1.0 + (-10.0 * p).exp()) - 1.0
    }
}

// ---------------------------------------------------------------------------
// Feature pooling
// ---------------------------------------------------------------------------

/// Reduce backbone features to `[B, D]`: spatial mean for 4-D maps,
/// flatten for anything else.
pub fn pool_features(features: &Tensor) -> Tensor {
    if features.dim() == 4 {
        features.mean_dim(Some([2_i64, 3].as_slice()), false, Kind::Float)
    } else {
        features.flatten(1, -1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn input() -> Tensor {
        Tensor::from_slice(&[1.0_f32, -2.0, 3.0, 0.0, -0.5])
            .to_device(Device::Cpu)
            .set_requires_grad(true)
    }

    #[test]
    fn forward_is_identity() {
        let x = input();
        let y = GradientReverse::new(0.5).forward(&x);
        let diff = (&y - &x).abs().max().double_value(&[]);
        assert_eq!(diff, 0.0, "forward pass must be an exact identity");
    }

    #[test]
    fn backward_negates_with_scale() {
        let x = input();
        let upstream = Tensor::from_slice(&[1.0_f32, -2.0, 3.0, 0.0, 4.0]);
        let y = gradient_reverse(&x, 0.7);
        (&y * &upstream).sum(Kind::Float).backward();
        let expected = &upstream * -0.7;
        let err = (x.grad() - expected).abs().max().double_value(&[]);
        assert!(err < 1e-6, "gradient must be -0.7 * upstream, max err {err}");
    }

    #[test]
    fn zero_scale_gives_zero_grad() {
        let x = input();
        gradient_reverse(&x, 0.0).sum(Kind::Float).backward();
        assert_eq!(x.grad().abs().max().double_value(&[]), 0.0);
    }

    #[test]
    fn schedule_lambda_zero_approx_zero() {
        let s = AdversarialSchedule::new(100);
        assert!(s.lambda(0).abs() < 1e-12, "lambda(0) = 0");
    }

    #[test]
    fn schedule_lambda_at_half() {
        let s = AdversarialSchedule::new(100);
        // p=0.5 => 2/(1+exp(-5))-1 ≈ 0.9866
        let lam = s.lambda(50);
        assert!((lam - 0.9866).abs() < 1e-3, "lambda(0.5)~0.987, got {lam}");
    }

    #[test]
    fn schedule_clamps_progress() {
        let s = AdversarialSchedule::new(100);
        assert_eq!(s.lambda(500), s.lambda(100));
        assert_eq!(s.lambda(-5), 0.0);
        assert_eq!(AdversarialSchedule::new(0).horizon, 1);
    }

    #[test]
    fn schedule_monotonically_increasing() {
        let s = AdversarialSchedule::new(100);
        let mut prev = s.lambda(0);
        for it in 1..=100 {
            let cur = s.lambda(it);
            assert!(cur >= prev, "not monotone at iteration {it}");
            prev = cur;
        }
    }

    #[test]
    fn pool_features_handles_maps_and_vectors() {
        let maps = Tensor::ones([2, 5, 3, 3], (Kind::Float, Device::Cpu));
        assert_eq!(pool_features(&maps).size(), vec![2, 5]);
        let vecs = Tensor::ones([2, 7], (Kind::Float, Device::Cpu));
        assert_eq!(pool_features(&vecs).size(), vec![2, 7]);
    }
}
