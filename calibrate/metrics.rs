//! # Metrics Engine
//!
//! Confusion-matrix counts at any threshold are read straight off the 8×2
//! histogram: a pattern whose score clears the threshold contributes all of its
//! positives to `tp` and all of its negatives to `fp`, every other pattern
//! contributes to `fn` and `tn`. This is exact and costs O(8) per threshold.
//!
//! Ratios whose denominator is zero are reported as `0.0`. A threshold with no
//! predicted positives is a legitimate (if useless) operating point, not an error.

use crate::calibrate::histogram::Histogram;
use crate::calibrate::pattern::{NUM_PATTERNS, Pattern};
use crate::calibrate::weights::WeightVector;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Scores below this distance of each other are treated as one level.
const LEVEL_EPSILON: f64 = 1e-12;

/// Raw confusion-matrix counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confusion {
    pub tp: u64,
    pub fp: u64,
    pub tn: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
}

impl Confusion {
    pub fn positives(&self) -> u64 {
        self.tp + self.fn_
    }

    pub fn negatives(&self) -> u64 {
        self.tn + self.fp
    }

    pub fn total(&self) -> u64 {
        self.positives() + self.negatives()
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            tpr: ratio(self.tp, self.tp + self.fn_),
            fpr: ratio(self.fp, self.fp + self.tn),
            precision: ratio(self.tp, self.tp + self.fp),
            specificity: ratio(self.tn, self.tn + self.fp),
            accuracy: ratio(self.tp + self.tn, self.total()),
            f1: ratio(2 * self.tp, 2 * self.tp + self.fp + self.fn_),
            youden_j: ratio(self.tp, self.tp + self.fn_) - ratio(self.fp, self.fp + self.tn),
        }
    }
}

/// Rates derived from a [`Confusion`]. Never NaN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub tpr: f64,
    pub fpr: f64,
    pub precision: f64,
    pub specificity: f64,
    pub accuracy: f64,
    pub f1: f64,
    #[serde(rename = "youdenJ")]
    pub youden_j: f64,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Confusion counts at `threshold` for an arbitrary per-pattern score function.
/// Patterns with `score_fn(p) >= threshold` are predicted positive.
pub fn confusion_at<F>(histogram: &Histogram, score_fn: F, threshold: f64) -> Confusion
where
    F: Fn(Pattern) -> f64,
{
    let mut confusion = Confusion::default();
    for (pattern, counts) in histogram.iter() {
        if score_fn(pattern) >= threshold {
            confusion.tp += counts.positives;
            confusion.fp += counts.negatives;
        } else {
            confusion.fn_ += counts.positives;
            confusion.tn += counts.negatives;
        }
    }
    confusion
}

/// Combined score of every pattern under a fixed weight vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternScores {
    scores: [f64; NUM_PATTERNS],
}

impl PatternScores {
    pub fn from_weights(weights: &WeightVector) -> Self {
        Self {
            scores: Pattern::ALL.map(|p| weights.score(p)),
        }
    }

    pub fn score(&self, pattern: Pattern) -> f64 {
        self.scores[pattern.index()]
    }

    pub fn as_array(&self) -> [f64; NUM_PATTERNS] {
        self.scores
    }

    /// Distinct score values in ascending order. Near-equal values (floating
    /// noise from summing weights in different orders) collapse to the lowest.
    pub fn levels(&self) -> Vec<f64> {
        self.scores
            .iter()
            .copied()
            .sorted_by(f64::total_cmp)
            .dedup_by(|a, b| (a - b).abs() <= LEVEL_EPSILON)
            .collect()
    }

    pub fn confusion_at(&self, histogram: &Histogram, threshold: f64) -> Confusion {
        confusion_at(histogram, |p| self.score(p), threshold)
    }
}

/// Confusion counts and rates at one threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdEvaluation {
    pub threshold: f64,
    pub confusion: Confusion,
    pub metrics: Metrics,
}

impl ThresholdEvaluation {
    pub fn new(threshold: f64, confusion: Confusion) -> Self {
        Self {
            threshold,
            confusion,
            metrics: confusion.metrics(),
        }
    }

    pub fn record(&self) -> OperatingPointRecord {
        OperatingPointRecord::new(self.threshold, self.confusion)
    }
}

/// Evaluates every threshold in `thresholds`, in the given order.
pub fn evaluate_thresholds(
    histogram: &Histogram,
    scores: &PatternScores,
    thresholds: &[f64],
) -> Vec<ThresholdEvaluation> {
    thresholds
        .iter()
        .map(|&t| ThresholdEvaluation::new(t, scores.confusion_at(histogram, t)))
        .collect()
}

/// The achievable levels merged with caller-supplied thresholds, sorted and
/// deduplicated. NaN entries are discarded.
pub fn sweep_thresholds(scores: &PatternScores, extra: &[f64]) -> Vec<f64> {
    scores
        .levels()
        .into_iter()
        .chain(extra.iter().copied().filter(|t| !t.is_nan()))
        .sorted_by(f64::total_cmp)
        .dedup()
        .collect()
}

/// The flat operating-point row consumed by tabular export. Field names and
/// order are a reporting contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatingPointRecord {
    pub threshold: f64,
    pub tp: u64,
    pub fp: u64,
    pub tn: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
    pub tpr: f64,
    pub fpr: f64,
    pub precision: f64,
    pub specificity: f64,
    pub accuracy: f64,
    pub f1: f64,
    #[serde(rename = "youdenJ")]
    pub youden_j: f64,
    pub sample_pos: u64,
    pub sample_neg: u64,
}

impl OperatingPointRecord {
    pub fn new(threshold: f64, confusion: Confusion) -> Self {
        let m = confusion.metrics();
        Self {
            threshold,
            tp: confusion.tp,
            fp: confusion.fp,
            tn: confusion.tn,
            fn_: confusion.fn_,
            tpr: m.tpr,
            fpr: m.fpr,
            precision: m.precision,
            specificity: m.specificity,
            accuracy: m.accuracy,
            f1: m.f1,
            youden_j: m.youden_j,
            sample_pos: confusion.positives(),
            sample_neg: confusion.negatives(),
        }
    }

    pub fn confusion(&self) -> Confusion {
        Confusion {
            tp: self.tp,
            fp: self.fp,
            tn: self.tn,
            fn_: self.fn_,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn separable() -> Histogram {
        Histogram::from_entries(&[(0, 100, 0), (7, 0, 50)])
    }

    #[test]
    fn uniform_weights_separate_all_zero_from_all_one() {
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        assert_abs_diff_eq!(scores.score(Pattern::new(0).unwrap()), 0.0);
        assert_abs_diff_eq!(scores.score(Pattern::new(7).unwrap()), 1.0, epsilon = 1e-12);

        let c = scores.confusion_at(&separable(), 0.5);
        assert_eq!(c, Confusion { tp: 50, fp: 0, tn: 100, fn_: 0 });
        let m = c.metrics();
        assert_abs_diff_eq!(m.tpr, 1.0);
        assert_abs_diff_eq!(m.fpr, 0.0);
        assert_abs_diff_eq!(m.youden_j, 1.0);
        assert_abs_diff_eq!(m.accuracy, 1.0);
        assert_abs_diff_eq!(m.f1, 1.0);
    }

    #[test]
    fn zero_denominators_degrade_to_zero() {
        let m = Confusion::default().metrics();
        for value in [m.tpr, m.fpr, m.precision, m.specificity, m.accuracy, m.f1, m.youden_j] {
            assert_eq!(value, 0.0);
            assert!(!value.is_nan());
        }

        // Only negatives, threshold above every score: no predicted positives.
        let only_neg = Histogram::from_entries(&[(3, 10, 0)]);
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        let m = scores.confusion_at(&only_neg, 2.0).metrics();
        assert_eq!(m.tpr, 0.0);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.f1, 0.0);
        assert_abs_diff_eq!(m.specificity, 1.0);
    }

    #[test]
    fn custom_score_function_is_respected() {
        let histogram = Histogram::from_entries(&[(1, 5, 1), (2, 1, 5)]);
        let c = confusion_at(&histogram, |p| if p.value() == 2 { 1.0 } else { 0.0 }, 0.5);
        assert_eq!(c, Confusion { tp: 5, fp: 1, tn: 5, fn_: 1 });
    }

    #[test]
    fn production_weights_produce_eight_distinct_levels() {
        let scores = PatternScores::from_weights(&WeightVector::production_default());
        let levels = scores.levels();
        assert_eq!(levels.len(), 8);
        assert!(levels.windows(2).all(|w| w[0] < w[1]));
        assert_abs_diff_eq!(levels[0], 0.0);
        assert_abs_diff_eq!(*levels.last().unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn uniform_weights_collapse_to_four_levels() {
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        assert_eq!(scores.levels().len(), 4);
    }

    #[test]
    fn sweep_merges_user_thresholds() {
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        let sweep = sweep_thresholds(&scores, &[0.5, f64::NAN, 0.0]);
        assert_eq!(sweep.len(), 5);
        assert!(sweep.contains(&0.5));
    }

    #[test]
    fn record_carries_sample_sizes() {
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        let evals = evaluate_thresholds(&separable(), &scores, &scores.levels());
        assert_eq!(evals.len(), 4);
        for e in &evals {
            let r = e.record();
            assert_eq!(r.sample_pos, 50);
            assert_eq!(r.sample_neg, 100);
            assert_eq!(r.confusion(), e.confusion);
        }
        // Lowest level predicts everything positive.
        assert_eq!(evals[0].confusion.fp, 100);
    }
}
