//! Integration tests for [`msda_train::metrics`].
//!
//! Probabilities and labels are built from fixed values so every expected
//! count can be read off the fixture.

use msda_train::metrics::{summary, Accuracy, ConfusionMatrix, DomainAccuracies, Mean, Metric};
use tch::Tensor;

fn probs(rows: &[[f32; 3]]) -> Tensor {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Tensor::from_slice(&flat).reshape([rows.len() as i64, 3])
}

fn labels(values: &[i64]) -> Tensor {
    Tensor::from_slice(values)
}

// ---------------------------------------------------------------------------
// Mean
// ---------------------------------------------------------------------------

/// An empty mean reports zero; reset forgets every observation.
#[test]
fn mean_accumulates_and_resets() {
    let mut m = Mean::new();
    assert_eq!(m.result(), 0.0);
    for v in [1.0, 2.0, 6.0] {
        m.update(v);
    }
    assert_eq!(m.count(), 3);
    assert!((m.result() - 3.0).abs() < 1e-12);
    m.reset();
    assert_eq!(m.count(), 0);
    assert_eq!(m.result(), 0.0);
}

// ---------------------------------------------------------------------------
// Accuracy
// ---------------------------------------------------------------------------

/// Argmax of each row is compared with the label.
#[test]
fn accuracy_counts_argmax_matches() {
    let p = probs(&[[0.7, 0.2, 0.1], [0.1, 0.3, 0.6], [0.3, 0.4, 0.3], [0.5, 0.25, 0.25]]);
    let y = labels(&[0, 2, 0, 1]);
    assert_eq!(Accuracy::batch_counts(&p, &y).expect("counts"), (2, 4));
}

/// Accuracy accumulates over batches until reset.
#[test]
fn accuracy_accumulates_over_batches() {
    let mut acc = Accuracy::new();
    acc.update(&probs(&[[0.9, 0.05, 0.05]]), &labels(&[0])).expect("update");
    acc.update(&probs(&[[0.9, 0.05, 0.05], [0.1, 0.8, 0.1]]), &labels(&[1, 2]))
        .expect("update");
    assert_eq!(acc.total(), 3);
    assert!((acc.result() - 1.0 / 3.0).abs() < 1e-12);
    acc.reset();
    assert_eq!(acc.total(), 0);
    assert_eq!(acc.result(), 0.0);
}

/// A label count that disagrees with the prediction rows is an error.
#[test]
fn accuracy_rejects_length_mismatch() {
    let p = probs(&[[0.9, 0.05, 0.05], [0.1, 0.8, 0.1]]);
    assert!(Accuracy::batch_counts(&p, &labels(&[0])).is_err());
}

// ---------------------------------------------------------------------------
// DomainAccuracies
// ---------------------------------------------------------------------------

/// Domains export as `{domain}_acc`, in construction order.
#[test]
fn domain_accuracies_export_in_order() {
    let mut d = DomainAccuracies::new(&["clipart", "painting"]);
    d.record(0, (1, 2));
    d.record(1, (3, 4));
    d.record(7, (9, 9));
    let mut out = Vec::new();
    d.export_into(&mut out);
    assert_eq!(
        out,
        vec![("clipart_acc".to_string(), 0.5), ("painting_acc".to_string(), 0.75)]
    );
    d.reset();
    assert_eq!(d.get(1).map(Accuracy::total), Some(0));
}

// ---------------------------------------------------------------------------
// ConfusionMatrix
// ---------------------------------------------------------------------------

/// Rows are true labels, columns predictions.
#[test]
fn confusion_matrix_layout() {
    let mut cm = ConfusionMatrix::new(3);
    let p = probs(&[[0.7, 0.2, 0.1], [0.1, 0.3, 0.6], [0.3, 0.4, 0.3], [0.1, 0.1, 0.8]]);
    cm.update(&p, &labels(&[0, 2, 0, 1])).expect("update");
    let c = cm.counts();
    assert_eq!(c[[0, 0]], 1);
    assert_eq!(c[[2, 2]], 1);
    assert_eq!(c[[0, 1]], 1);
    assert_eq!(c[[1, 2]], 1);
    assert_eq!(c.sum(), 4);
    assert!((cm.accuracy() - 0.5).abs() < 1e-12);

    let recall = cm.per_class_recall();
    assert!((recall[0] - 0.5).abs() < 1e-12);
    assert_eq!(recall[1], 0.0);
    assert_eq!(recall[2], 1.0);
}

/// Out-of-range labels are skipped; reset zeroes the counts.
#[test]
fn confusion_matrix_skips_unknown_labels_and_resets() {
    let mut cm = ConfusionMatrix::new(3);
    cm.update(&probs(&[[0.8, 0.1, 0.1], [0.8, 0.1, 0.1]]), &labels(&[0, 5]))
        .expect("update");
    assert_eq!(cm.counts().sum(), 1);
    cm.reset();
    assert_eq!(cm.counts().sum(), 0);
    assert_eq!(cm.accuracy(), 0.0);
    assert_eq!(cm.n_classes(), 3);
}

// ---------------------------------------------------------------------------
// summary
// ---------------------------------------------------------------------------

/// Metrics render as space-separated `name=value` with four decimals.
#[test]
fn summary_formats_pairs() {
    let line = summary(&[("scce".to_string(), 1.23456), ("target_acc".to_string(), 0.5)]);
    assert_eq!(line, "scce=1.2346 target_acc=0.5000");
    assert_eq!(summary(&[]), "");
}
