//! # Threshold Selector
//!
//! Under a fixed weight vector there are at most eight distinct pattern scores,
//! so the achievable ROC curve has at most eight interior operating points. The
//! selector evaluates every achievable threshold (ascending, ending with `+inf`
//! which predicts everything negative) and picks one by Youden's J or by the
//! lowest false-positive rate that still meets a recall floor.

use crate::calibrate::histogram::Histogram;
use crate::calibrate::metrics::{
    Confusion, Metrics, OperatingPointRecord, PatternScores, ThresholdEvaluation,
    evaluate_thresholds,
};
use crate::calibrate::weights::WeightVector;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectionError {
    #[error(
        "Cannot select an operating threshold: the histogram is empty. No valid comparison records were aggregated."
    )]
    EmptyHistogram,

    #[error("Recall target {0} is outside (0, 1].")]
    InvalidRecallTarget(f64),

    #[error("No candidate thresholds were supplied (after discarding NaN values).")]
    NoCandidates,
}

/// How the operating threshold is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "criterion", rename_all = "snake_case")]
pub enum SelectionMode {
    /// Maximise `tpr - fpr`; ties go to the lowest threshold.
    YoudenJ,
    /// Minimise `fpr` subject to `tpr >= target`; ties go to the lowest threshold.
    RecallFloor { target: f64 },
}

impl SelectionMode {
    pub fn recall_floor(target: f64) -> Result<Self, SelectionError> {
        if target > 0.0 && target <= 1.0 {
            Ok(SelectionMode::RecallFloor { target })
        } else {
            Err(SelectionError::InvalidRecallTarget(target))
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMode::YoudenJ => f.write_str("youdenJ"),
            SelectionMode::RecallFloor { target } => write!(f, "recall>={target}"),
        }
    }
}

/// A weight vector, a threshold and the metrics achieved there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatingPoint {
    pub weights: WeightVector,
    pub threshold: f64,
    pub confusion: Confusion,
    pub metrics: Metrics,
}

impl OperatingPoint {
    fn new(weights: WeightVector, evaluation: ThresholdEvaluation) -> Self {
        Self {
            weights,
            threshold: evaluation.threshold,
            confusion: evaluation.confusion,
            metrics: evaluation.metrics,
        }
    }

    pub fn record(&self) -> OperatingPointRecord {
        OperatingPointRecord::new(self.threshold, self.confusion)
    }
}

/// Outcome of a selection. An unreachable recall floor is a result, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selection {
    Reached(OperatingPoint),
    NotReachable { target: f64, best_tpr: f64 },
}

impl Selection {
    pub fn operating_point(&self) -> Option<&OperatingPoint> {
        match self {
            Selection::Reached(point) => Some(point),
            Selection::NotReachable { .. } => None,
        }
    }

    pub fn is_reached(&self) -> bool {
        matches!(self, Selection::Reached(_))
    }
}

/// Distinct pattern scores in ascending order followed by `+inf`.
pub fn achievable_thresholds(scores: &PatternScores) -> Vec<f64> {
    let mut thresholds = scores.levels();
    thresholds.push(f64::INFINITY);
    thresholds
}

/// Selects over the achievable thresholds of `weights`.
pub fn select_threshold(
    histogram: &Histogram,
    weights: &WeightVector,
    mode: SelectionMode,
) -> Result<Selection, SelectionError> {
    let scores = PatternScores::from_weights(weights);
    select_over(histogram, weights, &scores, mode, &achievable_thresholds(&scores))
}

/// Selects over an external candidate set. Candidates are sorted ascending and
/// deduplicated; NaN entries are discarded.
pub fn select_threshold_from(
    histogram: &Histogram,
    weights: &WeightVector,
    mode: SelectionMode,
    candidates: &[f64],
) -> Result<Selection, SelectionError> {
    let candidates: Vec<f64> = candidates
        .iter()
        .copied()
        .filter(|c| !c.is_nan())
        .sorted_by(f64::total_cmp)
        .dedup()
        .collect();
    if candidates.is_empty() {
        return Err(SelectionError::NoCandidates);
    }
    let scores = PatternScores::from_weights(weights);
    select_over(histogram, weights, &scores, mode, &candidates)
}

fn select_over(
    histogram: &Histogram,
    weights: &WeightVector,
    scores: &PatternScores,
    mode: SelectionMode,
    thresholds: &[f64],
) -> Result<Selection, SelectionError> {
    if histogram.is_empty() {
        return Err(SelectionError::EmptyHistogram);
    }
    let evaluations = evaluate_thresholds(histogram, scores, thresholds);

    match mode {
        SelectionMode::YoudenJ => {
            let mut best: Option<&ThresholdEvaluation> = None;
            for e in &evaluations {
                if best.is_none_or(|b| e.metrics.youden_j > b.metrics.youden_j) {
                    best = Some(e);
                }
            }
            best.map(|e| Selection::Reached(OperatingPoint::new(*weights, *e)))
                .ok_or(SelectionError::NoCandidates)
        }
        SelectionMode::RecallFloor { target } => {
            if !(target > 0.0 && target <= 1.0) {
                return Err(SelectionError::InvalidRecallTarget(target));
            }
            let mut best: Option<&ThresholdEvaluation> = None;
            for e in evaluations.iter().filter(|e| e.metrics.tpr >= target) {
                if best.is_none_or(|b| e.metrics.fpr < b.metrics.fpr) {
                    best = Some(e);
                }
            }
            Ok(match best {
                Some(e) => Selection::Reached(OperatingPoint::new(*weights, *e)),
                None => {
                    let best_tpr = evaluations
                        .iter()
                        .map(|e| e.metrics.tpr)
                        .fold(0.0, f64::max);
                    log::warn!(
                        "Recall target {target} is not reachable; the best achievable TPR is {best_tpr:.6}."
                    );
                    Selection::NotReachable { target, best_tpr }
                }
            })
        }
    }
}

/// Runs one Youden-J selection plus one selection per recall target.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSelector {
    weights: WeightVector,
    candidates: Option<Vec<f64>>,
}

impl ThresholdSelector {
    pub fn new(weights: WeightVector) -> Self {
        Self {
            weights,
            candidates: None,
        }
    }

    /// Restricts selection to an external candidate set.
    pub fn with_candidates(mut self, candidates: Vec<f64>) -> Self {
        self.candidates = Some(candidates);
        self
    }

    pub fn weights(&self) -> &WeightVector {
        &self.weights
    }

    pub fn select(&self, histogram: &Histogram, mode: SelectionMode) -> Result<Selection, SelectionError> {
        match &self.candidates {
            Some(candidates) => select_threshold_from(histogram, &self.weights, mode, candidates),
            None => select_threshold(histogram, &self.weights, mode),
        }
    }

    /// Youden-J first, then each recall target in the given order.
    pub fn select_all(
        &self,
        histogram: &Histogram,
        recall_targets: &[f64],
    ) -> Result<Vec<(SelectionMode, Selection)>, SelectionError> {
        std::iter::once(Ok(SelectionMode::YoudenJ))
            .chain(recall_targets.iter().map(|&t| SelectionMode::recall_floor(t)))
            .map(|mode| {
                let mode = mode?;
                Ok((mode, self.select(histogram, mode)?))
            })
            .collect()
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
    fn youden_picks_the_lowest_perfect_threshold() {
        let selection =
            select_threshold(&separable(), &WeightVector::uniform(), SelectionMode::YoudenJ).unwrap();
        let point = selection.operating_point().unwrap();
        assert_abs_diff_eq!(point.threshold, 1.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(point.metrics.youden_j, 1.0);
        assert_eq!(point.confusion, Confusion { tp: 50, fp: 0, tn: 100, fn_: 0 });
    }

    #[test]
    fn recall_floor_is_reachable_on_separable_data() {
        let mode = SelectionMode::recall_floor(0.99).unwrap();
        let selection = select_threshold(&separable(), &WeightVector::uniform(), mode).unwrap();
        let point = selection.operating_point().expect("reachable");
        assert!(point.threshold <= 1.0);
        assert_abs_diff_eq!(point.metrics.tpr, 1.0);
        assert_abs_diff_eq!(point.metrics.fpr, 0.0);
    }

    #[test]
    fn recall_floor_trades_fpr_for_recall() {
        // Pattern 1 (string-minhash only) holds a mix; pattern 7 is clean.
        let histogram = Histogram::from_entries(&[(0, 1000, 5), (1, 50, 45), (7, 2, 950)]);
        let weights = WeightVector::production_default();

        let strict = select_threshold(&histogram, &weights, SelectionMode::recall_floor(0.9).unwrap())
            .unwrap();
        // Every level above string-minhash + program-header keeps only pattern 7;
        // the lowest of them wins the tie.
        let point = strict.operating_point().unwrap();
        assert_abs_diff_eq!(point.threshold, 0.7054, epsilon = 1e-12);
        assert_eq!(point.confusion.fp, 2);

        let loose = select_threshold(&histogram, &weights, SelectionMode::recall_floor(0.99).unwrap())
            .unwrap();
        let point = loose.operating_point().unwrap();
        assert_abs_diff_eq!(point.threshold, 0.0884, epsilon = 1e-12);
        assert_eq!(point.confusion.fp, 52);
        assert_eq!(point.confusion.tp, 995);
    }

    #[test]
    fn unreachable_target_is_reported() {
        let histogram = Histogram::from_entries(&[(0, 10, 10), (7, 10, 10)]);
        let mode = SelectionMode::recall_floor(0.99).unwrap();
        let selection =
            select_threshold_from(&histogram, &WeightVector::uniform(), mode, &[0.5, 2.0]).unwrap();
        match selection {
            Selection::NotReachable { target, best_tpr } => {
                assert_eq!(target, 0.99);
                assert_abs_diff_eq!(best_tpr, 0.5);
            }
            Selection::Reached(p) => panic!("unexpectedly reached at {}", p.threshold),
        }
    }

    #[test]
    fn youden_ties_keep_the_lowest_threshold() {
        // Uninformative data: J is 0 everywhere.
        let histogram = Histogram::from_entries(&[(0, 10, 10), (7, 10, 10)]);
        let selection =
            select_threshold(&histogram, &WeightVector::uniform(), SelectionMode::YoudenJ).unwrap();
        assert_eq!(selection.operating_point().unwrap().threshold, 0.0);
    }

    #[test]
    fn achievable_thresholds_end_with_predict_all_negative() {
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        let thresholds = achievable_thresholds(&scores);
        assert_eq!(thresholds.len(), 5);
        assert_eq!(*thresholds.last().unwrap(), f64::INFINITY);

        let evals = evaluate_thresholds(&separable(), &scores, &thresholds);
        let last = evals.last().unwrap();
        assert_eq!(last.confusion.tp + last.confusion.fp, 0);
    }

    #[test]
    fn empty_histogram_and_bad_inputs_fail() {
        let empty = Histogram::new();
        assert_eq!(
            select_threshold(&empty, &WeightVector::uniform(), SelectionMode::YoudenJ).unwrap_err(),
            SelectionError::EmptyHistogram
        );
        assert!(SelectionMode::recall_floor(0.0).is_err());
        assert!(SelectionMode::recall_floor(1.5).is_err());
        assert_eq!(
            select_threshold_from(&separable(), &WeightVector::uniform(), SelectionMode::YoudenJ, &[f64::NAN])
                .unwrap_err(),
            SelectionError::NoCandidates
        );
    }

    #[test]
    fn selector_reports_every_criterion() {
        let selector = ThresholdSelector::new(WeightVector::uniform());
        let results = selector.select_all(&separable(), &[0.95, 0.99]).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, SelectionMode::YoudenJ);
        assert!(results.iter().all(|(_, s)| s.is_reached()));
    }
}
