//! Classification metrics over integer labels.
//!
//! F1 is support-weighted across the classes present in either the true
//! labels or the predictions. Curves are one-vs-rest over class
//! probabilities.

use std::collections::BTreeSet;
use std::fmt;

use crate::data::label_name;

/// Fraction of predictions equal to the true label. Empty input yields 0.
pub fn accuracy(labels: &[i64], predictions: &[i64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = labels.iter().zip(predictions).filter(|(l, p)| l == p).count();
    correct as f64 / labels.len() as f64
}

/// Fraction of positions where two prediction vectors agree.
pub fn agreement(a: &[i64], b: &[i64]) -> f64 {
    accuracy(a, b)
}

/// Precision, recall and F1 for one class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassScores {
    pub label: i64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Per-class scores for every label in `labels` or `predictions`, sorted.
pub fn per_class_scores(labels: &[i64], predictions: &[i64]) -> Vec<ClassScores> {
    let classes: BTreeSet<i64> = labels.iter().chain(predictions).copied().collect();
    classes
        .into_iter()
        .map(|class| {
            let mut tp = 0;
            let mut fp = 0;
            let mut fn_ = 0;
            for (&l, &p) in labels.iter().zip(predictions) {
                match (l == class, p == class) {
                    (true, true) => tp += 1,
                    (false, true) => fp += 1,
                    (true, false) => fn_ += 1,
                    (false, false) => {}
                }
            }
            ClassScores {
                label: class,
                precision: ratio(tp, tp + fp),
                recall: ratio(tp, tp + fn_),
                f1: ratio(2 * tp, 2 * tp + fp + fn_),
                support: tp + fn_,
            }
        })
        .collect()
}

/// Support-weighted F1. Empty input yields 0.
pub fn f1_weighted(labels: &[i64], predictions: &[i64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let scores = per_class_scores(labels, predictions);
    let total: usize = scores.iter().map(|s| s.support).sum();
    if total == 0 {
        return 0.0;
    }
    scores.iter().map(|s| s.f1 * s.support as f64).sum::<f64>() / total as f64
}

pub fn f1_macro(labels: &[i64], predictions: &[i64]) -> f64 {
    let scores = per_class_scores(labels, predictions);
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().map(|s| s.f1).sum::<f64>() / scores.len() as f64
}

/// Rows are true labels, columns are predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    pub num_classes: usize,
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Pairs with a label outside `[0, num_classes)` are ignored.
    pub fn from_predictions(labels: &[i64], predictions: &[i64], num_classes: usize) -> Self {
        let mut counts = vec![vec![0; num_classes]; num_classes];
        for (&l, &p) in labels.iter().zip(predictions) {
            let (Ok(l), Ok(p)) = (usize::try_from(l), usize::try_from(p)) else {
                continue;
            };
            if l < num_classes && p < num_classes {
                counts[l][p] += 1;
            }
        }
        Self { num_classes, counts }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.counts[i][i]).sum()
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>8}", "true\\pred")?;
        for j in 0..self.num_classes {
            write!(f, "{:>6}", j)?;
        }
        writeln!(f)?;
        for (i, row) in self.counts.iter().enumerate() {
            write!(f, "{:>9}", i)?;
            for count in row {
                write!(f, "{:>6}", count)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Per-class table plus overall accuracy and F1.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationReport {
    pub classes: Vec<ClassScores>,
    pub accuracy: f64,
    pub macro_f1: f64,
    pub weighted_f1: f64,
}

impl ClassificationReport {
    pub fn new(labels: &[i64], predictions: &[i64]) -> Self {
        Self {
            classes: per_class_scores(labels, predictions),
            accuracy: accuracy(labels, predictions),
            macro_f1: f1_macro(labels, predictions),
            weighted_f1: f1_weighted(labels, predictions),
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<34}{:>10}{:>10}{:>10}{:>9}",
            "class", "precision", "recall", "f1", "support"
        )?;
        for s in &self.classes {
            let name = label_name(s.label)
                .map(str::to_string)
                .unwrap_or_else(|| s.label.to_string());
            writeln!(
                f,
                "{:<34}{:>10.4}{:>10.4}{:>10.4}{:>9}",
                name, s.precision, s.recall, s.f1, s.support
            )?;
        }
        writeln!(f, "accuracy    {:.4}", self.accuracy)?;
        writeln!(f, "macro f1    {:.4}", self.macro_f1)?;
        write!(f, "weighted f1 {:.4}", self.weighted_f1)
    }
}

/// Row-wise softmax of logits.
pub fn softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = logits.iter().map(|&x| (x as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value; ties resolve to the first.
pub fn argmax(values: &[f32]) -> i64 {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best as i64
}

#[derive(Debug, Clone, PartialEq)]
pub struct RocCurve {
    pub label: i64,
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub thresholds: Vec<f64>,
    pub auc: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrecisionRecallCurve {
    pub label: i64,
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub thresholds: Vec<f64>,
    pub average_precision: f64,
}

/// Cumulative true/false positive counts at each distinct score, from
/// the highest score down.
fn cumulative_counts(positives: &[bool], scores: &[f64]) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let (mut tps, mut fps, mut thresholds) = (Vec::new(), Vec::new(), Vec::new());
    let (mut tp, mut fp) = (0, 0);
    for (k, &i) in order.iter().enumerate() {
        if positives[i] {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_group = order
            .get(k + 1)
            .map_or(true, |&next| scores[next] != scores[i]);
        if last_of_group {
            tps.push(tp);
            fps.push(fp);
            thresholds.push(scores[i]);
        }
    }
    (tps, fps, thresholds)
}

/// Trapezoidal area under `(x, y)`.
pub fn auc(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[0] + ys[1]) / 2.0)
        .sum()
}

/// Binary ROC curve. Starts at `(0, 0)` with an infinite threshold.
pub fn roc_curve(positives: &[bool], scores: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let (tps, fps, thresholds) = cumulative_counts(positives, scores);
    let total_pos = positives.iter().filter(|&&p| p).count();
    let total_neg = positives.len() - total_pos;

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    let mut thr = vec![f64::INFINITY];
    for ((tp, fp), t) in tps.into_iter().zip(fps).zip(thresholds) {
        fpr.push(ratio(fp, total_neg));
        tpr.push(ratio(tp, total_pos));
        thr.push(t);
    }
    (fpr, tpr, thr)
}

/// Binary precision-recall curve, ordered by decreasing threshold, plus
/// average precision (step-wise area).
pub fn precision_recall_curve(positives: &[bool], scores: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>, f64) {
    let (tps, fps, thresholds) = cumulative_counts(positives, scores);
    let total_pos = positives.iter().filter(|&&p| p).count();

    let mut precision = Vec::with_capacity(tps.len());
    let mut recall = Vec::with_capacity(tps.len());
    let mut average_precision = 0.0;
    let mut previous_recall = 0.0;
    for (&tp, &fp) in tps.iter().zip(&fps) {
        let p = ratio(tp, tp + fp);
        let r = ratio(tp, total_pos);
        average_precision += (r - previous_recall) * p;
        previous_recall = r;
        precision.push(p);
        recall.push(r);
    }
    (precision, recall, thresholds, average_precision)
}

/// Whether both outcomes occur, so that ranking scores are defined.
fn has_both_outcomes(positives: &[bool]) -> bool {
    positives.iter().any(|&p| p) && positives.iter().any(|&p| !p)
}

/// One-vs-rest ROC curves for every class. A class absent from `labels`
/// (or the only class present) has an undefined AUC, reported as NaN.
pub fn roc_one_vs_rest(labels: &[i64], probabilities: &[Vec<f64>], num_classes: usize) -> Vec<RocCurve> {
    (0..num_classes)
        .map(|class| {
            let positives: Vec<bool> = labels.iter().map(|&l| l == class as i64).collect();
            let scores: Vec<f64> = probabilities
                .iter()
                .map(|p| p.get(class).copied().unwrap_or(0.0))
                .collect();
            let (fpr, tpr, thresholds) = roc_curve(&positives, &scores);
            RocCurve {
                label: class as i64,
                auc: if has_both_outcomes(&positives) { auc(&fpr, &tpr) } else { f64::NAN },
                fpr,
                tpr,
                thresholds,
            }
        })
        .collect()
}

/// One-vs-rest precision-recall curves for every class. Average precision
/// is NaN for a class with no positive example.
pub fn precision_recall_one_vs_rest(
    labels: &[i64],
    probabilities: &[Vec<f64>],
    num_classes: usize,
) -> Vec<PrecisionRecallCurve> {
    (0..num_classes)
        .map(|class| {
            let positives: Vec<bool> = labels.iter().map(|&l| l == class as i64).collect();
            let scores: Vec<f64> = probabilities
                .iter()
                .map(|p| p.get(class).copied().unwrap_or(0.0))
                .collect();
            let (precision, recall, thresholds, average_precision) =
                precision_recall_curve(&positives, &scores);
            PrecisionRecallCurve {
                label: class as i64,
                precision,
                recall,
                thresholds,
                average_precision: if positives.contains(&true) { average_precision } else { f64::NAN },
            }
        })
        .collect()
}
