//! # ROC curves and per-detector tau search
//!
//! Two ROC constructions live here:
//!
//! * [`RocCurve::from_histogram`] walks the (at most eight) score levels of a
//!   weighted pattern histogram.
//! * [`RocCurve::from_scores`] walks the distinct raw values of a single
//!   detector, which is how the per-detector binarization thresholds (taus) are
//!   found in the first place.
//!
//! Both start at `(0, 0)` with threshold `+inf`, visit thresholds in descending
//! order and end at `(1, 1)`. The area is computed with the trapezoidal rule.

use crate::calibrate::histogram::Histogram;
use crate::calibrate::metrics::{Confusion, PatternScores, ThresholdEvaluation};
use crate::calibrate::pattern::Detector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RocError {
    #[error("Cannot build a ROC curve from an empty sample.")]
    Empty,

    #[error("Scores and labels differ in length ({scores} scores, {labels} labels).")]
    LengthMismatch { scores: usize, labels: usize },

    #[error("Cannot build a ROC curve without positive samples ({negatives} negatives present).")]
    NoPositives { negatives: u64 },

    #[error("Cannot build a ROC curve without negative samples ({positives} positives present).")]
    NoNegatives { positives: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub threshold: f64,
    pub fpr: f64,
    pub tpr: f64,
    pub confusion: Confusion,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RocCurve {
    /// From `(0, 0)` at `+inf` to `(1, 1)`, thresholds descending.
    pub points: Vec<RocPoint>,
    pub auc: f64,
}

fn check_classes(positives: u64, negatives: u64) -> Result<(), RocError> {
    match (positives, negatives) {
        (0, 0) => Err(RocError::Empty),
        (0, n) => Err(RocError::NoPositives { negatives: n }),
        (p, 0) => Err(RocError::NoNegatives { positives: p }),
        _ => Ok(()),
    }
}

fn point(threshold: f64, confusion: Confusion) -> RocPoint {
    let metrics = confusion.metrics();
    RocPoint {
        threshold,
        fpr: metrics.fpr,
        tpr: metrics.tpr,
        confusion,
    }
}

impl RocCurve {
    fn from_points(points: Vec<RocPoint>) -> Self {
        let auc = trapezoidal_auc(&points);
        Self { points, auc }
    }

    /// The ROC curve of a weighted pattern histogram.
    pub fn from_histogram(histogram: &Histogram, scores: &PatternScores) -> Result<Self, RocError> {
        check_classes(histogram.total_positives(), histogram.total_negatives())?;

        let mut points = vec![point(f64::INFINITY, scores.confusion_at(histogram, f64::INFINITY))];
        for level in scores.levels().into_iter().rev() {
            points.push(point(level, scores.confusion_at(histogram, level)));
        }
        Ok(Self::from_points(points))
    }

    /// The empirical ROC curve of raw values against binary labels.
    pub fn from_scores(values: &[f64], labels: &[bool]) -> Result<Self, RocError> {
        if values.len() != labels.len() {
            return Err(RocError::LengthMismatch {
                scores: values.len(),
                labels: labels.len(),
            });
        }
        let positives = labels.iter().filter(|&&l| l).count() as u64;
        let negatives = labels.len() as u64 - positives;
        check_classes(positives, negatives)?;

        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

        let mut confusion = Confusion {
            tp: 0,
            fp: 0,
            tn: negatives,
            fn_: positives,
        };
        let mut points = vec![point(f64::INFINITY, confusion)];

        let mut i = 0;
        while i < order.len() {
            let current = values[order[i]];
            while i < order.len() && values[order[i]] == current {
                if labels[order[i]] {
                    confusion.tp += 1;
                    confusion.fn_ -= 1;
                } else {
                    confusion.fp += 1;
                    confusion.tn -= 1;
                }
                i += 1;
            }
            points.push(point(current, confusion));
        }
        Ok(Self::from_points(points))
    }

    /// Youden-J optimum. Ties keep the first point in curve order, i.e. the
    /// highest threshold. The `+inf` start point is never chosen.
    pub fn youden(&self) -> Option<ThresholdEvaluation> {
        let mut best: Option<&RocPoint> = None;
        for p in self.finite_points() {
            if best.is_none_or(|b| p.tpr - p.fpr > b.tpr - b.fpr) {
                best = Some(p);
            }
        }
        best.map(|p| ThresholdEvaluation::new(p.threshold, p.confusion))
    }

    /// Lowest FPR among points with `tpr >= target`; ties keep the highest
    /// threshold. `None` when the target is not reachable.
    pub fn recall_floor(&self, target: f64) -> Option<ThresholdEvaluation> {
        let mut best: Option<&RocPoint> = None;
        for p in self.finite_points().filter(|p| p.tpr >= target) {
            if best.is_none_or(|b| p.fpr < b.fpr) {
                best = Some(p);
            }
        }
        best.map(|p| ThresholdEvaluation::new(p.threshold, p.confusion))
    }

    fn finite_points(&self) -> impl Iterator<Item = &RocPoint> {
        self.points.iter().filter(|p| p.threshold.is_finite())
    }
}

/// Trapezoidal area under the `(fpr, tpr)` polyline.
pub fn trapezoidal_auc(points: &[RocPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| (w[1].fpr - w[0].fpr) * (w[1].tpr + w[0].tpr) / 2.0)
        .sum()
}

/// Streaming sampler for one detector's (value, label) pairs.
///
/// Non-finite values are skipped. Negatives are kept only while
/// `negatives < positives * neg_pos_ratio` (a ratio of 0 keeps everything), and
/// the sampler reports itself full once `max_rows` pairs are kept.
#[derive(Debug, Clone)]
pub struct TauSampler {
    detector: Detector,
    neg_pos_ratio: f64,
    max_rows: Option<usize>,
    values: Vec<f64>,
    labels: Vec<bool>,
    positives: u64,
    negatives: u64,
}

impl TauSampler {
    pub fn new(detector: Detector, neg_pos_ratio: f64, max_rows: Option<usize>) -> Self {
        Self {
            detector,
            neg_pos_ratio,
            max_rows: max_rows.filter(|&m| m > 0),
            values: Vec::new(),
            labels: Vec::new(),
            positives: 0,
            negatives: 0,
        }
    }

    pub fn detector(&self) -> Detector {
        self.detector
    }

    pub fn is_full(&self) -> bool {
        self.max_rows.is_some_and(|m| self.values.len() >= m)
    }

    /// Offers one pair. Returns whether it was kept.
    pub fn offer(&mut self, value: Option<f64>, positive: bool) -> bool {
        let Some(value) = value.filter(|v| v.is_finite()) else {
            return false;
        };
        if self.is_full() {
            return false;
        }
        if positive {
            self.positives += 1;
        } else {
            let keep = self.neg_pos_ratio <= 0.0
                || (self.negatives as f64) < self.positives as f64 * self.neg_pos_ratio;
            if !keep {
                return false;
            }
            self.negatives += 1;
        }
        self.values.push(value);
        self.labels.push(positive);
        true
    }

    pub fn positives(&self) -> u64 {
        self.positives
    }

    pub fn negatives(&self) -> u64 {
        self.negatives
    }

    pub fn finish(self, recall_targets: &[f64]) -> Result<TauReport, RocError> {
        let curve = RocCurve::from_scores(&self.values, &self.labels)?;
        let youden = curve.youden().ok_or(RocError::Empty)?;
        let recall = recall_targets
            .iter()
            .map(|&target| RecallChoice {
                target,
                evaluation: curve.recall_floor(target),
            })
            .collect();
        Ok(TauReport {
            detector: self.detector,
            sample_pos: self.positives,
            sample_neg: self.negatives,
            auc: curve.auc,
            youden,
            recall,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecallChoice {
    pub target: f64,
    /// `None` when no threshold reaches the target.
    pub evaluation: Option<ThresholdEvaluation>,
}

/// Tau candidates for one detector.
#[derive(Debug, Clone, PartialEq)]
pub struct TauReport {
    pub detector: Detector,
    pub sample_pos: u64,
    pub sample_neg: u64,
    pub auc: f64,
    pub youden: ThresholdEvaluation,
    pub recall: Vec<RecallChoice>,
}

/// Runs the tau search over in-memory pairs.
pub fn find_tau(
    detector: Detector,
    pairs: impl IntoIterator<Item = (Option<f64>, bool)>,
    neg_pos_ratio: f64,
    max_rows: Option<usize>,
    recall_targets: &[f64],
) -> Result<TauReport, RocError> {
    let mut sampler = TauSampler::new(detector, neg_pos_ratio, max_rows);
    for (value, positive) in pairs {
        if sampler.is_full() {
            break;
        }
        sampler.offer(value, positive);
    }
    sampler.finish(recall_targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::weights::WeightVector;
    use approx::assert_abs_diff_eq;

    #[test]
    fn separable_histogram_has_unit_auc() {
        let histogram = Histogram::from_entries(&[(0, 100, 0), (7, 0, 50)]);
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        let curve = RocCurve::from_histogram(&histogram, &scores).unwrap();
        assert_abs_diff_eq!(curve.auc, 1.0);
        let first = curve.points.first().unwrap();
        let last = curve.points.last().unwrap();
        assert_eq!((first.fpr, first.tpr), (0.0, 0.0));
        assert_eq!((last.fpr, last.tpr), (1.0, 1.0));
        assert!(curve.points.windows(2).all(|w| w[0].threshold > w[1].threshold));
    }

    #[test]
    fn uninformative_histogram_has_half_auc() {
        let histogram = Histogram::from_entries(&[(0, 10, 10), (7, 10, 10)]);
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        let curve = RocCurve::from_histogram(&histogram, &scores).unwrap();
        assert_abs_diff_eq!(curve.auc, 0.5);
    }

    #[test]
    fn single_class_inputs_are_rejected() {
        let only_neg = Histogram::from_entries(&[(0, 10, 0)]);
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        assert_eq!(
            RocCurve::from_histogram(&only_neg, &scores).unwrap_err(),
            RocError::NoPositives { negatives: 10 }
        );
        assert_eq!(
            RocCurve::from_scores(&[0.1, 0.2], &[true]).unwrap_err(),
            RocError::LengthMismatch { scores: 2, labels: 1 }
        );
    }

    #[test]
    fn score_curve_groups_tied_values() {
        let values = [0.9, 0.9, 0.5, 0.1];
        let labels = [true, false, true, false];
        let curve = RocCurve::from_scores(&values, &labels).unwrap();
        // +inf, 0.9, 0.5, 0.1
        assert_eq!(curve.points.len(), 4);
        assert_eq!(curve.points[1].confusion, Confusion { tp: 1, fp: 1, tn: 1, fn_: 1 });
        assert_abs_diff_eq!(curve.auc, 0.625);
    }

    #[test]
    fn tau_search_picks_youden_and_recall_thresholds() {
        let pairs = vec![
            (Some(0.95), true),
            (Some(0.80), true),
            (Some(0.70), true),
            (Some(0.30), true),
            (Some(0.60), false),
            (Some(0.20), false),
            (Some(0.10), false),
            (Some(f64::NAN), false),
            (None, true),
        ];
        let report = find_tau(Detector::CodeRegions, pairs, 0.0, None, &[0.75, 1.0]).unwrap();
        assert_eq!(report.sample_pos, 4);
        assert_eq!(report.sample_neg, 3);

        // J = 0.75 at 0.70 (3/4 - 0) and at 0.30 (1 - 1/3 < 0.75), so 0.70.
        assert_abs_diff_eq!(report.youden.threshold, 0.70);
        assert_abs_diff_eq!(report.youden.metrics.youden_j, 0.75);

        let r75 = report.recall[0].evaluation.unwrap();
        assert_abs_diff_eq!(r75.threshold, 0.70);
        assert_eq!(r75.confusion.fp, 0);

        let r100 = report.recall[1].evaluation.unwrap();
        assert_abs_diff_eq!(r100.threshold, 0.30);
        assert_eq!(r100.confusion.fp, 1);
    }

    #[test]
    fn sampler_caps_negatives_and_rows() {
        let mut sampler = TauSampler::new(Detector::StringMinhash, 2.0, Some(5));
        // No positive yet: negatives are refused.
        assert!(!sampler.offer(Some(0.1), false));
        assert!(sampler.offer(Some(0.9), true));
        assert!(sampler.offer(Some(0.1), false));
        assert!(sampler.offer(Some(0.2), false));
        assert!(!sampler.offer(Some(0.3), false));
        assert!(sampler.offer(Some(0.8), true));
        assert!(sampler.offer(Some(0.4), false));
        assert!(sampler.is_full());
        assert!(!sampler.offer(Some(0.7), true));
        assert_eq!((sampler.positives(), sampler.negatives()), (2, 3));
    }
}
