//! Multi-domain datasets and the loaders that turn them into step batches.
//!
//! This module defines the [`DomainDataset`] trait plus one concrete
//! implementation:
//!
//! - [`SyntheticDomainDataset`]: generates fully-deterministic images from a
//!   per-class prototype pattern, a per-domain appearance shift and hashed
//!   pixel noise. Useful for unit tests, integration tests and the `train`
//!   binary's smoke runs.
//!
//! Two loaders wrap any [`DomainDataset`]:
//!
//! - [`BalancedLoader`] yields [`TrainBatch`]es holding `batch_size` samples
//!   from every domain, sources first and target last. Each domain walks its
//!   own deterministic permutation and reshuffles when exhausted, so small
//!   domains wrap around while large ones keep going.
//! - [`TestLoader`] yields [`TestBatch`]es over one domain in index order.
//!
//! # Example
//!
//! ```rust
//! use msda_train::dataset::{BalancedLoader, DomainDataset, SyntheticConfig, SyntheticDomainDataset};
//!
//! let cfg = SyntheticConfig { samples_per_domain: 8, image_size: 8, ..SyntheticConfig::default() };
//! let ds = SyntheticDomainDataset::new(vec!["a".into(), "b".into()], cfg).unwrap();
//! assert_eq!(ds.len("a").unwrap(), 8);
//!
//! let mut loader = BalancedLoader::new(&ds, 4, 42, tch::Device::Cpu).unwrap();
//! let batch = loader.next_batch().unwrap();
//! assert_eq!(batch.len(), 2);
//! assert_eq!(batch.batch_size(), 4);
//! ```

use ndarray::Array3;
use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::batch::{DomainBatch, TestBatch, TrainBatch};
use crate::error::DatasetError;

// ---------------------------------------------------------------------------
// ImageSample
// ---------------------------------------------------------------------------

/// One labelled image.
#[derive(Debug, Clone)]
pub struct ImageSample {
    /// Pixels `[C, H, W]` in row-major order.
    pub image: Array3<f32>,
    /// Class label.
    pub label: i64,
    /// Sample identifier, `"{domain}/{index:05}"`.
    pub path: String,
}

// ---------------------------------------------------------------------------
// DomainDataset trait
// ---------------------------------------------------------------------------

/// Common interface for multi-domain image datasets. Loaders borrow the
/// dataset for their whole lifetime.
pub trait DomainDataset {
    /// Domain names, in the order loaders emit them.
    fn domains(&self) -> &[String];

    /// Number of samples in `domain`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::UnknownDomain`] for names not in [`Self::domains`].
    fn len(&self, domain: &str) -> Result<usize, DatasetError>;

    /// Load sample `idx` of `domain`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::UnknownDomain`] or [`DatasetError::IndexOutOfBounds`].
    fn get(&self, domain: &str, idx: usize) -> Result<ImageSample, DatasetError>;

    /// Image shape `[C, H, W]` shared by every sample.
    fn image_shape(&self) -> [usize; 3];

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// SyntheticDomainDataset
// ---------------------------------------------------------------------------

/// Configuration for [`SyntheticDomainDataset`].
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Number of classes; labels cycle `idx % num_classes`. Default: **10**.
    pub num_classes: usize,
    /// Square image side. Default: **32**.
    pub image_size: usize,
    /// Image channels. Default: **3**.
    pub channels: usize,
    /// Samples per domain. Default: **64**.
    pub samples_per_domain: usize,
    /// Brightness offset added per domain index. Default: **0.15**.
    pub domain_shift: f32,
    /// Amplitude of the hashed pixel noise. Default: **0.1**.
    pub noise: f32,
    /// Seed mixed into the pixel noise. Default: **42**.
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            num_classes: 10,
            image_size: 32,
            channels: 3,
            samples_per_domain: 64,
            domain_shift: 0.15,
            noise: 0.1,
            seed: 42,
        }
    }
}

/// Deterministic multi-domain image dataset.
///
/// Sample `idx` of domain `d` (position `d` in the domain list) has label
/// `y = idx % num_classes` and pixels
///
/// ```text
/// proto = 0.5 + 0.4 × sin(2π × ((y + 1) × x + (y % 3 + 1) × r) / S + c)
/// pixel = (1 + 0.1 × d) × proto + domain_shift × d + noise × h(seed, d, idx, c, r, x)
/// ```
///
/// where `h` is a xorshift hash mapped to `[-1, 1]`. Classes share structure
/// across domains while each domain has its own contrast and brightness.
pub struct SyntheticDomainDataset {
    domains: Vec<String>,
    config: SyntheticConfig,
}

impl SyntheticDomainDataset {
    /// Create a dataset over `domains`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::InvalidSetting`] for zero-sized settings or an empty
    /// domain list.
    pub fn new(domains: Vec<String>, config: SyntheticConfig) -> Result<Self, DatasetError> {
        if domains.is_empty() {
            return Err(DatasetError::invalid_setting("domains", "must be non-empty"));
        }
        for (field, value) in [
            ("num_classes", config.num_classes),
            ("image_size", config.image_size),
            ("channels", config.channels),
        ] {
            if value == 0 {
                return Err(DatasetError::invalid_setting(field, "must be > 0"));
            }
        }
        Ok(SyntheticDomainDataset { domains, config })
    }

    fn domain_index(&self, domain: &str) -> Result<usize, DatasetError> {
        self.domains
            .iter()
            .position(|d| d == domain)
            .ok_or_else(|| DatasetError::UnknownDomain(domain.to_string()))
    }

    #[inline]
    fn pixel(&self, d: usize, idx: usize, c: usize, r: usize, x: usize) -> f32 {
        let cfg = &self.config;
        let y = idx % cfg.num_classes;
        let s = cfg.image_size as f32;
        let arg = 2.0 * std::f32::consts::PI
            * ((y + 1) as f32 * x as f32 + (y % 3 + 1) as f32 * r as f32)
            / s
            + c as f32;
        let proto = 0.5 + 0.4 * arg.sin();
        let key = cfg.seed
            ^ (d as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (idx as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
            ^ ((c * cfg.image_size * cfg.image_size + r * cfg.image_size + x) as u64)
                .wrapping_mul(0x1656_67B1_9E37_79F9);
        (1.0 + 0.1 * d as f32) * proto + cfg.domain_shift * d as f32 + cfg.noise * hash_unit(key)
    }
}

impl DomainDataset for SyntheticDomainDataset {
    fn domains(&self) -> &[String] {
        &self.domains
    }

    fn len(&self, domain: &str) -> Result<usize, DatasetError> {
        self.domain_index(domain)?;
        Ok(self.config.samples_per_domain)
    }

    fn get(&self, domain: &str, idx: usize) -> Result<ImageSample, DatasetError> {
        let d = self.domain_index(domain)?;
        if idx >= self.config.samples_per_domain {
            return Err(DatasetError::IndexOutOfBounds {
                domain: domain.to_string(),
                idx,
                len: self.config.samples_per_domain,
            });
        }
        let [c, h, w] = self.image_shape();
        let image = Array3::from_shape_fn((c, h, w), |(ch, r, x)| self.pixel(d, idx, ch, r, x));
        Ok(ImageSample {
            image,
            label: (idx % self.config.num_classes) as i64,
            path: format!("{domain}/{idx:05}"),
        })
    }

    fn image_shape(&self) -> [usize; 3] {
        [self.config.channels, self.config.image_size, self.config.image_size]
    }

    fn name(&self) -> &str {
        "SyntheticDomainDataset"
    }
}

/// Xorshift64 hash of `key` mapped to `[-1, 1]`.
fn hash_unit(key: u64) -> f32 {
    let mut state = if key == 0 { 0x853c49e6748fea9b } else { key };
    for _ in 0..2 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
    }
    (state >> 40) as f32 / (1u64 << 24) as f32 * 2.0 - 1.0
}

// ---------------------------------------------------------------------------
// Collation
// ---------------------------------------------------------------------------

struct Collated {
    image: Tensor,
    label: Tensor,
    path: Vec<String>,
}

fn collate(samples: Vec<ImageSample>, shape: [usize; 3], device: Device) -> Collated {
    let b = samples.len() as i64;
    let mut pixels = Vec::with_capacity(samples.len() * shape.iter().product::<usize>());
    let mut labels = Vec::with_capacity(samples.len());
    let mut path = Vec::with_capacity(samples.len());
    for s in samples {
        pixels.extend(s.image.iter().copied());
        labels.push(s.label);
        path.push(s.path);
    }
    let [c, h, w] = shape.map(|v| v as i64);
    Collated {
        image: Tensor::from_slice(&pixels).reshape([b, c, h, w]).to_device(device),
        label: Tensor::from_slice(&labels).to_kind(Kind::Int64).to_device(device),
        path,
    }
}

// ---------------------------------------------------------------------------
// BalancedLoader
// ---------------------------------------------------------------------------

/// Draws `batch_size` samples from every domain per batch.
///
/// Each domain walks a seeded permutation of its indices; when it runs out,
/// the permutation is redrawn with the next epoch seed. The sequence of
/// batches is fully determined by `seed`.
pub struct BalancedLoader<'a> {
    dataset: &'a dyn DomainDataset,
    batch_size: usize,
    seed: u64,
    device: Device,
    cursors: Vec<DomainCursor>,
}

struct DomainCursor {
    domain: String,
    order: Vec<usize>,
    position: usize,
    epoch: u64,
}

impl<'a> BalancedLoader<'a> {
    /// Create a loader over every domain of `dataset`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::InvalidSetting`] for `batch_size == 0` and
    /// [`DatasetError::EmptyDomain`] when a domain has no samples.
    pub fn new(
        dataset: &'a dyn DomainDataset,
        batch_size: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self, DatasetError> {
        if batch_size == 0 {
            return Err(DatasetError::invalid_setting("batch_size", "must be > 0"));
        }
        let mut cursors = Vec::with_capacity(dataset.domains().len());
        for (d, domain) in dataset.domains().iter().enumerate() {
            let n = dataset.len(domain)?;
            if n == 0 {
                return Err(DatasetError::EmptyDomain(domain.clone()));
            }
            let mut cursor = DomainCursor {
                domain: domain.clone(),
                order: (0..n).collect(),
                position: 0,
                epoch: 0,
            };
            xorshift_shuffle(&mut cursor.order, epoch_seed(seed, d, 0));
            cursors.push(cursor);
        }
        Ok(BalancedLoader { dataset, batch_size, seed, device, cursors })
    }

    /// Assemble the next balanced batch.
    ///
    /// # Errors
    ///
    /// Propagates dataset access errors.
    pub fn next_batch(&mut self) -> Result<TrainBatch, DatasetError> {
        let shape = self.dataset.image_shape();
        let mut records = Vec::with_capacity(self.cursors.len());
        for (d, cursor) in self.cursors.iter_mut().enumerate() {
            let mut samples = Vec::with_capacity(self.batch_size);
            for _ in 0..self.batch_size {
                if cursor.position == cursor.order.len() {
                    cursor.epoch += 1;
                    cursor.position = 0;
                    xorshift_shuffle(&mut cursor.order, epoch_seed(self.seed, d, cursor.epoch));
                    debug!(domain = %cursor.domain, epoch = cursor.epoch, "domain reshuffled");
                }
                let idx = cursor.order[cursor.position];
                cursor.position += 1;
                samples.push(self.dataset.get(&cursor.domain, idx)?);
            }
            let batch = collate(samples, shape, self.device);
            records.push(DomainBatch::new(batch.image, batch.label));
        }
        Ok(TrainBatch::new(records))
    }

    /// Completed passes over `domain`, or `None` for unknown domains.
    pub fn epoch(&self, domain: &str) -> Option<u64> {
        self.cursors.iter().find(|c| c.domain == domain).map(|c| c.epoch)
    }
}

fn epoch_seed(seed: u64, domain: usize, epoch: u64) -> u64 {
    seed ^ (domain as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ epoch.wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

// ---------------------------------------------------------------------------
// TestLoader
// ---------------------------------------------------------------------------

/// Sequential, unshuffled batches over one domain. The last batch may be
/// smaller.
pub struct TestLoader<'a> {
    dataset: &'a dyn DomainDataset,
    domain: String,
    batch_size: usize,
    device: Device,
    label_override: Option<i64>,
}

impl<'a> TestLoader<'a> {
    /// Create a loader over `domain`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::UnknownDomain`] or [`DatasetError::InvalidSetting`]
    /// for `batch_size == 0`.
    pub fn new(
        dataset: &'a dyn DomainDataset,
        domain: &str,
        batch_size: usize,
        device: Device,
    ) -> Result<Self, DatasetError> {
        if batch_size == 0 {
            return Err(DatasetError::invalid_setting("batch_size", "must be > 0"));
        }
        dataset.len(domain)?;
        Ok(TestLoader {
            dataset,
            domain: domain.to_string(),
            batch_size,
            device,
            label_override: None,
        })
    }

    /// Label every sample with `index` instead of its class (domain
    /// classifier evaluation).
    pub fn with_domain_label(mut self, index: usize) -> Self {
        self.label_override = Some(index as i64);
        self
    }

    /// Number of batches per pass.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len(&self.domain).unwrap_or(0);
        (n + self.batch_size - 1) / self.batch_size
    }

    /// Iterate over the domain once.
    pub fn iter(&self) -> TestLoaderIter<'_> {
        TestLoaderIter {
            loader: self,
            len: self.dataset.len(&self.domain).unwrap_or(0),
            cursor: 0,
        }
    }
}

/// Iterator returned by [`TestLoader::iter`].
pub struct TestLoaderIter<'a> {
    loader: &'a TestLoader<'a>,
    len: usize,
    cursor: usize,
}

impl<'a> Iterator for TestLoaderIter<'a> {
    type Item = Result<TestBatch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.len {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.len);
        let range = self.cursor..end;
        self.cursor = end;

        let samples = range
            .map(|idx| self.loader.dataset.get(&self.loader.domain, idx))
            .collect::<Result<Vec<_>, _>>();
        Some(samples.map(|samples| {
            let mut batch = collate(samples, self.loader.dataset.image_shape(), self.loader.device);
            if let Some(index) = self.loader.label_override {
                batch.label = batch.label.full_like(index);
            }
            TestBatch::new(vec![batch.image], batch.label, batch.path)
        }))
    }
}

// ---------------------------------------------------------------------------
// Xorshift shuffle (deterministic, no external RNG state)
// ---------------------------------------------------------------------------

/// In-place Fisher-Yates shuffle using a 64-bit Xorshift PRNG seeded with
/// `seed`.
fn xorshift_shuffle(indices: &mut [usize], seed: u64) {
    let n = indices.len();
    if n <= 1 {
        return;
    }
    let mut state = if seed == 0 { 0x853c49e6748fea9b } else { seed };
    for i in (1..n).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let j = (state as usize) % (i + 1);
        indices.swap(i, j);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
