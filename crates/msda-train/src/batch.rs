//! Domain lists and the batch records consumed by train and test steps.
//!
//! A [`TrainBatch`] holds one [`DomainBatch`] per domain, in the order of the
//! step's [`DomainList`]: source domains first, the target domain last. A
//! [`TestBatch`] holds one or more image tensors (one per domain or per
//! augmented view) that share a single label and path vector.

use std::ops::Index;
use tch::{Kind, Tensor};

use crate::error::{TrainError, TrainResult};

// ---------------------------------------------------------------------------
// DomainList
// ---------------------------------------------------------------------------

/// Ordered list of distinct domain names whose last entry is the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainList {
    names: Vec<String>,
}

impl DomainList {
    /// Build a domain list.
    ///
    /// # Errors
    ///
    /// [`TrainError::EmptyDomainList`] for an empty list,
    /// [`TrainError::MissingSourceDomain`] when only the target is given and
    /// [`TrainError::DuplicateDomain`] when a name repeats.
    pub fn new<I, S>(names: I) -> TrainResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        match names.len() {
            0 => return Err(TrainError::EmptyDomainList),
            1 => return Err(TrainError::MissingSourceDomain { target: names[0].clone() }),
            _ => {}
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(TrainError::DuplicateDomain(name.clone()));
            }
        }
        Ok(DomainList { names })
    }

    /// Total number of domains, target included.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always `false`; construction rejects empty lists.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of source domains (`len() - 1`).
    pub fn n_sources(&self) -> usize {
        self.names.len() - 1
    }

    /// Source domain names, in order.
    pub fn sources(&self) -> &[String] {
        &self.names[..self.n_sources()]
    }

    /// Target domain name.
    pub fn target(&self) -> &str {
        &self.names[self.n_sources()]
    }

    /// All domain names, target last.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Position of `name` in the list.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Iterate over all names, target last.
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.names.iter()
    }
}

impl Index<usize> for DomainList {
    type Output = str;

    fn index(&self, index: usize) -> &str {
        &self.names[index]
    }
}

// ---------------------------------------------------------------------------
// DomainBatch
// ---------------------------------------------------------------------------

/// Images and labels drawn from one domain in one iteration.
#[derive(Debug)]
pub struct DomainBatch {
    /// Image batch `[B, C, H, W]`.
    pub image: Tensor,
    /// Integer class labels `[B]`. Ignored for the target during training.
    pub label: Tensor,
    /// Second, independently augmented view of `image` (self-ensembling).
    pub augmented: Option<Tensor>,
}

impl DomainBatch {
    /// Create a record without an augmented view.
    pub fn new(image: Tensor, label: Tensor) -> Self {
        DomainBatch { image, label, augmented: None }
    }

    /// Attach a second augmented view.
    pub fn with_augmented(mut self, view: Tensor) -> Self {
        self.augmented = Some(view);
        self
    }

    /// Leading dimension of the image tensor.
    pub fn batch_size(&self) -> i64 {
        self.image.size().first().copied().unwrap_or(0)
    }

    fn validate(&self, index: usize, expected: i64) -> TrainResult<()> {
        let bs = self.batch_size();
        if bs == 0 {
            return Err(TrainError::EmptyBatch);
        }
        if bs != expected {
            return Err(TrainError::BatchSizeMismatch { index, expected, actual: bs });
        }
        let label_shape = self.label.size();
        if label_shape != [bs] {
            return Err(TrainError::shape_mismatch(vec![bs], label_shape));
        }
        if let Some(view) = &self.augmented {
            if view.size() != self.image.size() {
                return Err(TrainError::shape_mismatch(self.image.size(), view.size()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TrainBatch
// ---------------------------------------------------------------------------

/// One balanced training batch: a record per domain, target last.
#[derive(Debug)]
pub struct TrainBatch {
    records: Vec<DomainBatch>,
}

impl TrainBatch {
    /// Wrap per-domain records. Validation happens in [`TrainBatch::validate`].
    pub fn new(records: Vec<DomainBatch>) -> Self {
        TrainBatch { records }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` when the batch has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, target last.
    pub fn records(&self) -> &[DomainBatch] {
        &self.records
    }

    /// Mutable access to the records (used by preprocessors).
    pub fn records_mut(&mut self) -> &mut [DomainBatch] {
        &mut self.records
    }

    /// Source records.
    pub fn sources(&self) -> &[DomainBatch] {
        let n = self.records.len().saturating_sub(1);
        &self.records[..n]
    }

    /// Target record, if any.
    pub fn target(&self) -> Option<&DomainBatch> {
        self.records.last()
    }

    /// Shared per-record batch size (of the first record).
    pub fn batch_size(&self) -> i64 {
        self.records.first().map(DomainBatch::batch_size).unwrap_or(0)
    }

    /// Check the batch against `domains`.
    ///
    /// # Errors
    ///
    /// - [`TrainError::BatchLengthMismatch`] when the record count differs
    ///   from the domain count.
    /// - [`TrainError::EmptyBatch`] when a record has zero samples.
    /// - [`TrainError::BatchSizeMismatch`] when records disagree on batch size.
    /// - [`TrainError::ShapeMismatch`] when labels are not `[B]` or image
    ///   shapes differ between records.
    pub fn validate(&self, domains: &DomainList) -> TrainResult<()> {
        if self.records.len() != domains.len() {
            return Err(TrainError::BatchLengthMismatch {
                expected: domains.len(),
                actual: self.records.len(),
            });
        }
        let expected = self.batch_size();
        let reference = self.records[0].image.size();
        for (i, record) in self.records.iter().enumerate() {
            record.validate(i, expected)?;
            if record.image.size() != reference {
                return Err(TrainError::shape_mismatch(reference, record.image.size()));
            }
        }
        Ok(())
    }
}

impl Index<usize> for TrainBatch {
    type Output = DomainBatch;

    fn index(&self, index: usize) -> &DomainBatch {
        &self.records[index]
    }
}

// ---------------------------------------------------------------------------
// TestBatch
// ---------------------------------------------------------------------------

/// One evaluation batch.
///
/// `image` holds one tensor per domain or per view; all of them describe the
/// same samples, which share `label` and `path`.
#[derive(Debug)]
pub struct TestBatch {
    /// Image tensors `[B, C, H, W]`, one per domain or view.
    pub image: Vec<Tensor>,
    /// Integer labels `[B]`.
    pub label: Tensor,
    /// Sample identifiers, `B` entries.
    pub path: Vec<String>,
}

impl TestBatch {
    /// Create a test batch.
    pub fn new(image: Vec<Tensor>, label: Tensor, path: Vec<String>) -> Self {
        TestBatch { image, label, path }
    }

    /// Number of samples.
    pub fn batch_size(&self) -> i64 {
        self.label.size().first().copied().unwrap_or(0)
    }

    /// Check that views, labels and paths agree.
    ///
    /// # Errors
    ///
    /// [`TrainError::EmptyBatch`] without views or samples,
    /// [`TrainError::ShapeMismatch`] when views differ in shape or disagree
    /// with the label/path count.
    pub fn validate(&self) -> TrainResult<()> {
        let first = self.image.first().ok_or(TrainError::EmptyBatch)?;
        let bs = self.batch_size();
        if bs == 0 {
            return Err(TrainError::EmptyBatch);
        }
        let reference = first.size();
        if reference.first().copied() != Some(bs) {
            return Err(TrainError::shape_mismatch(vec![bs], reference));
        }
        for view in &self.image[1..] {
            if view.size() != reference {
                return Err(TrainError::shape_mismatch(reference.clone(), view.size()));
            }
        }
        if self.path.len() as i64 != bs {
            return Err(TrainError::shape_mismatch(vec![bs], vec![self.path.len() as i64]));
        }
        Ok(())
    }
}

/// Constant label tensor `[batch]` filled with `index` (domain labels).
pub fn domain_labels(batch: i64, index: usize, device: tch::Device) -> Tensor {
    Tensor::full([batch], index as i64, (Kind::Int64, device))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn record(batch: i64) -> DomainBatch {
        DomainBatch::new(
            Tensor::zeros([batch, 3, 8, 8], (Kind::Float, Device::Cpu)),
            Tensor::zeros([batch], (Kind::Int64, Device::Cpu)),
        )
    }

    #[test]
    fn domain_list_splits_sources_and_target() {
        let d = DomainList::new(["a", "b", "c"]).unwrap();
        assert_eq!(d.n_sources(), 2);
        assert_eq!(d.sources(), &["a".to_string(), "b".to_string()]);
        assert_eq!(d.target(), "c");
        assert_eq!(&d[1], "b");
        assert_eq!(d.index_of("c"), Some(2));
    }

    #[test]
    fn domain_list_rejects_degenerate_inputs() {
        assert!(matches!(
            DomainList::new(Vec::<String>::new()),
            Err(TrainError::EmptyDomainList)
        ));
        assert!(matches!(
            DomainList::new(["only"]),
            Err(TrainError::MissingSourceDomain { .. })
        ));
        assert!(matches!(
            DomainList::new(["a", "a"]),
            Err(TrainError::DuplicateDomain(_))
        ));
    }

    #[test]
    fn train_batch_validates_record_count() {
        let d = DomainList::new(["a", "b", "c"]).unwrap();
        let batch = TrainBatch::new(vec![record(4), record(4)]);
        assert!(matches!(
            batch.validate(&d),
            Err(TrainError::BatchLengthMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn train_batch_validates_batch_sizes() {
        let d = DomainList::new(["a", "b"]).unwrap();
        let batch = TrainBatch::new(vec![record(4), record(3)]);
        assert!(matches!(
            batch.validate(&d),
            Err(TrainError::BatchSizeMismatch { index: 1, expected: 4, actual: 3 })
        ));
        let ok = TrainBatch::new(vec![record(4), record(4)]);
        assert!(ok.validate(&d).is_ok());
        assert_eq!(ok.sources().len(), 1);
    }

    #[test]
    fn test_batch_requires_matching_paths() {
        let img = Tensor::zeros([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let lbl = Tensor::zeros([2], (Kind::Int64, Device::Cpu));
        let bad = TestBatch::new(vec![img.shallow_clone()], lbl.shallow_clone(), vec!["x".into()]);
        assert!(bad.validate().is_err());
        let good = TestBatch::new(vec![img], lbl, vec!["x".into(), "y".into()]);
        assert!(good.validate().is_ok());
    }
}
