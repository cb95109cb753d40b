//! Models and the factories that build them, using tch-rs (PyTorch Rust
//! bindings).
//!
//! A [`Model`] owns one `nn::VarStore` and the `nn::SequentialT` network
//! whose parameters live in it. Steps never share a `Model`; the balanced
//! dispatcher borrows one for the duration of a forward pass.
//!
//! # Architecture
//!
//! ```text
//!  image [B, C, S, S]
//!       │
//!       ▼
//! ┌──────────────────────┐
//! │ Backbone             │  tiny_resnet → [B, 64, S/2, S/2]
//! │ (BackboneFactory)    │  mlp         → [B, 128]
//! └──────────────────────┘
//!       │ features
//!       ▼
//! ┌──────────────────────┐
//! │ Top (TopFactory)     │  GAP → Linear → ReLU → Linear → softmax
//! └──────────────────────┘
//!       │
//!       ▼
//!  class probabilities [B, n_classes]
//! ```
//!
//! The same [`TopFactory`] builds DANN discriminators and domain-classifier
//! heads; only the output width differs.

use std::path::Path;
use tch::nn::{self, ModuleT};
use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::error::{TrainError, TrainResult};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A named network and the variable store holding its parameters.
pub struct Model {
    name: String,
    vs: nn::VarStore,
    net: nn::SequentialT,
    frozen: bool,
}

impl Model {
    /// Wrap a network whose parameters were registered in `vs`.
    pub fn new(name: impl Into<String>, vs: nn::VarStore, net: nn::SequentialT) -> Self {
        Model { name: name.into(), vs, net, frozen: false }
    }

    /// Stable name used for checkpoints and registries.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the model (e.g. `"backbone"` → `"teacher_backbone"`).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Forward pass; `train` selects normalisation-layer behaviour.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(xs, train)
    }

    /// Forward pass without gradient tracking, in inference mode.
    pub fn forward_inference(&self, xs: &Tensor) -> Tensor {
        tch::no_grad(|| self.net.forward_t(xs, false))
    }

    /// Device the parameters live on.
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Return all trainable variable tensors (shallow clones).
    pub fn trainable_variables(&self) -> Vec<Tensor> {
        self.vs.trainable_variables()
    }

    /// Count total trainable parameters.
    pub fn num_parameters(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .map(|t| t.numel())
            .sum()
    }

    /// Stop gradient tracking for every parameter.
    pub fn freeze(&mut self) {
        self.vs.freeze();
        self.frozen = true;
    }

    /// Re-enable gradient tracking for every parameter.
    pub fn unfreeze(&mut self) {
        self.vs.unfreeze();
        self.frozen = false;
    }

    /// Whether [`Model::freeze`] is in effect.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Access the internal `VarStore` (e.g. to create an optimizer).
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Mutable access to the internal `VarStore`.
    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    /// Overwrite every variable with the same-named variable of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Tch`] when `source` lacks one of the variables.
    pub fn copy_weights_from(&mut self, source: &Model) -> TrainResult<()> {
        self.vs.copy(&source.vs)?;
        Ok(())
    }

    /// Exponential moving average towards `source`:
    /// `self = decay * self + (1 - decay) * source`, without gradients.
    ///
    /// Non-floating variables are copied verbatim.
    ///
    /// # Errors
    ///
    /// [`TrainError::ModelMismatch`] when the two variable sets differ in
    /// names or shapes. Nothing is modified in that case.
    pub fn ema_update(&mut self, source: &Model, decay: f64) -> TrainResult<()> {
        let src = source.vs.variables();
        let dst = self.vs.variables();
        if src.len() != dst.len() {
            return Err(TrainError::model_mismatch(
                &self.name,
                format!("{} variables vs {} in `{}`", dst.len(), src.len(), source.name),
            ));
        }
        for (name, t) in &dst {
            match src.get(name) {
                Some(s) if s.size() == t.size() => {}
                Some(s) => {
                    return Err(TrainError::model_mismatch(
                        &self.name,
                        format!("`{name}` has shape {:?} vs {:?}", t.size(), s.size()),
                    ))
                }
                None => {
                    return Err(TrainError::model_mismatch(
                        &self.name,
                        format!("`{name}` missing from `{}`", source.name),
                    ))
                }
            }
        }

        tch::no_grad(|| {
            for (name, mut t) in dst {
                let s = &src[&name];
                if is_float(t.kind()) {
                    let blended = &t * decay + s * (1.0 - decay);
                    t.copy_(&blended);
                } else {
                    t.copy_(s);
                }
            }
        });
        Ok(())
    }

    /// Save model weights to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> TrainResult<()> {
        self.vs.save(path)?;
        Ok(())
    }

    /// Load model weights from `path` into the existing parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the weights are
    /// incompatible with the model architecture.
    pub fn load(&mut self, path: &Path) -> TrainResult<()> {
        self.vs.load(path)?;
        Ok(())
    }
}

fn is_float(kind: Kind) -> bool {
    matches!(kind, Kind::Half | Kind::BFloat16 | Kind::Float | Kind::Double)
}

// ---------------------------------------------------------------------------
// BufferSnapshot
// ---------------------------------------------------------------------------

/// Copies of every variable that does not track gradients, taken before a
/// training-mode forward pass.
///
/// Batch-norm running statistics are updated in place during such a pass,
/// independently of the optimizer. A train step captures them up front and
/// puts them back when the transaction fails after the forward pass. The
/// parameters of frozen models are included as well.
pub struct BufferSnapshot {
    saved: Vec<(Tensor, Tensor)>,
}

impl BufferSnapshot {
    /// Copy the gradient-free variables of `models`.
    pub fn capture(models: &[&Model]) -> Self {
        let saved = models
            .iter()
            .flat_map(|m| m.vs.variables().into_values())
            .filter(|t| !t.requires_grad())
            .map(|live| {
                let copy = live.detach().copy();
                (live, copy)
            })
            .collect();
        BufferSnapshot { saved }
    }

    /// Number of captured tensors.
    pub fn len(&self) -> usize {
        self.saved.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }

    /// Write the captured values back into the live variables.
    pub fn restore(self) {
        tch::no_grad(|| {
            for (mut live, copy) in self.saved {
                live.copy_(&copy);
            }
        });
    }

    /// Restore when `result` is an error, then pass `result` through.
    pub fn restore_on_err<T>(self, result: TrainResult<T>) -> TrainResult<T> {
        if result.is_err() {
            self.restore();
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

/// Builds feature extractors by architecture name and input size.
pub trait BackboneFactory {
    /// Build a fresh backbone named `"backbone"`.
    ///
    /// # Errors
    ///
    /// [`TrainError::UnknownBackbone`] for unsupported names.
    fn build_backbone(&self, name: &str, size: i64) -> TrainResult<Model>;
}

/// Builds classification heads mapping backbone features to probabilities.
pub trait TopFactory {
    /// Build a fresh head named `"top"` with `n_classes` outputs.
    fn build_top(&self, n_classes: i64) -> TrainResult<Model>;
}

// ---------------------------------------------------------------------------
// ConvBackboneFactory
// ---------------------------------------------------------------------------

/// Backbone architectures understood by [`ConvBackboneFactory`].
pub const BACKBONE_NAMES: [&str; 2] = ["tiny_resnet", "mlp"];

const TINY_RESNET_STEM: i64 = 32;
const TINY_RESNET_OUT: i64 = 64;
const MLP_HIDDEN: i64 = 256;
const MLP_OUT: i64 = 128;

/// Builds the small backbones used for experiments and tests.
///
/// - `tiny_resnet`: conv stem + two ResNet basic blocks, `[B, 64, S/2, S/2]`.
/// - `mlp`: flatten + two dense layers, `[B, 128]`.
#[derive(Debug, Clone)]
pub struct ConvBackboneFactory {
    device: Device,
    in_channels: i64,
}

impl ConvBackboneFactory {
    /// Factory for images with `in_channels` channels on `device`.
    pub fn new(in_channels: i64, device: Device) -> Self {
        ConvBackboneFactory { device, in_channels }
    }

    /// Width of the features produced by backbone `name`, as consumed by a
    /// [`DenseTopFactory`].
    pub fn feature_dim(name: &str) -> Option<i64> {
        match name {
            "tiny_resnet" => Some(TINY_RESNET_OUT),
            "mlp" => Some(MLP_OUT),
            _ => None,
        }
    }
}

impl BackboneFactory for ConvBackboneFactory {
    fn build_backbone(&self, name: &str, size: i64) -> TrainResult<Model> {
        let vs = nn::VarStore::new(self.device);
        let net = {
            let root = vs.root();
            match name {
                "tiny_resnet" => tiny_resnet(&root, self.in_channels),
                "mlp" => mlp(&root, self.in_channels * size * size),
                other => return Err(TrainError::UnknownBackbone(other.to_string())),
            }
        };
        let model = Model::new("backbone", vs, net);
        debug!(backbone = name, size, params = model.num_parameters(), "built backbone");
        Ok(model)
    }
}

/// ResNet-style stem followed by two basic blocks.
///
/// ```text
/// Conv3x3(C→32) → BN → ReLU → BasicBlock(32→32) → BasicBlock(32→64, s=2)
/// ```
fn tiny_resnet(root: &nn::Path, in_channels: i64) -> nn::SequentialT {
    let stem_conv = nn::conv2d(
        root / "stem_conv",
        in_channels,
        TINY_RESNET_STEM,
        3,
        nn::ConvConfig { padding: 1, bias: false, ..Default::default() },
    );
    let stem_bn = nn::batch_norm2d(root / "stem_bn", TINY_RESNET_STEM, Default::default());

    nn::seq_t()
        .add(stem_conv)
        .add(stem_bn)
        .add_fn(|x| x.relu())
        .add(BasicBlock::new(&(root / "l1b1"), TINY_RESNET_STEM, TINY_RESNET_STEM, 1))
        .add(BasicBlock::new(&(root / "l2b1"), TINY_RESNET_STEM, TINY_RESNET_OUT, 2))
}

/// Flatten → Linear(in, 256) → ReLU → Linear(256, 128) → ReLU.
fn mlp(root: &nn::Path, in_features: i64) -> nn::SequentialT {
    nn::seq_t()
        .add_fn(|x| x.flatten(1, -1))
        .add(nn::linear(root / "fc1", in_features, MLP_HIDDEN, Default::default()))
        .add_fn(|x| x.relu())
        .add(nn::linear(root / "fc2", MLP_HIDDEN, MLP_OUT, Default::default()))
        .add_fn(|x| x.relu())
}

/// ResNet BasicBlock.
///
/// ```text
/// x ─── Conv2d(s) ─── BN ─── ReLU ─── Conv2d(1) ─── BN ──+── ReLU
///  │                                                      │
///  └── (downsample if needed) ───────────────────────────┘
/// ```
#[derive(Debug)]
struct BasicBlock {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
    downsample: Option<(nn::Conv2D, nn::BatchNorm)>,
}

impl BasicBlock {
    fn new(path: &nn::Path, in_ch: i64, out_ch: i64, stride: i64) -> Self {
        let conv1 = nn::conv2d(
            path / "conv1",
            in_ch,
            out_ch,
            3,
            nn::ConvConfig { stride, padding: 1, bias: false, ..Default::default() },
        );
        let bn1 = nn::batch_norm2d(path / "bn1", out_ch, Default::default());
        let conv2 = nn::conv2d(
            path / "conv2",
            out_ch,
            out_ch,
            3,
            nn::ConvConfig { padding: 1, bias: false, ..Default::default() },
        );
        let bn2 = nn::batch_norm2d(path / "bn2", out_ch, Default::default());

        let downsample = if in_ch != out_ch || stride != 1 {
            let ds_conv = nn::conv2d(
                path / "ds_conv",
                in_ch,
                out_ch,
                1,
                nn::ConvConfig { stride, bias: false, ..Default::default() },
            );
            let ds_bn = nn::batch_norm2d(path / "ds_bn", out_ch, Default::default());
            Some((ds_conv, ds_bn))
        } else {
            None
        };

        BasicBlock { conv1, bn1, conv2, bn2, downsample }
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let out = xs.apply(&self.conv1).apply_t(&self.bn1, train).relu();
        let out = out.apply(&self.conv2).apply_t(&self.bn2, train);

        // Residual / skip connection
        let residual = match &self.downsample {
            Some((conv, bn)) => xs.apply(conv).apply_t(bn, train),
            None => xs.shallow_clone(),
        };

        (out + residual).relu()
    }
}

// ---------------------------------------------------------------------------
// DenseTopFactory
// ---------------------------------------------------------------------------

/// Builds `GAP → Linear(in, hidden) → ReLU → Linear(hidden, n) → softmax`
/// heads. Flat `[B, D]` features skip the pooling.
#[derive(Debug, Clone)]
pub struct DenseTopFactory {
    device: Device,
    in_features: i64,
    hidden: i64,
}

impl DenseTopFactory {
    /// Factory for heads reading `in_features`-wide features.
    pub fn new(in_features: i64, hidden: i64, device: Device) -> Self {
        DenseTopFactory { device, in_features, hidden }
    }
}

impl TopFactory for DenseTopFactory {
    fn build_top(&self, n_classes: i64) -> TrainResult<Model> {
        let vs = nn::VarStore::new(self.device);
        let net = {
            let root = vs.root();
            nn::seq_t()
                .add_fn(global_average_pool)
                .add(nn::linear(&root / "fc1", self.in_features, self.hidden, Default::default()))
                .add_fn(|x| x.relu())
                .add(nn::linear(&root / "fc2", self.hidden, n_classes, Default::default()))
                .add_fn(|x| x.softmax(-1, Kind::Float))
        };
        Ok(Model::new("top", vs, net))
    }
}

/// Mean over every axis past the channel axis; `[B, D]` passes through.
pub fn global_average_pool(xs: &Tensor) -> Tensor {
    match xs.dim() {
        0..=2 => xs.shallow_clone(),
        n => {
            let axes: Vec<i64> = (2..n as i64).collect();
            xs.mean_dim(Some(axes.as_slice()), false, Kind::Float)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
