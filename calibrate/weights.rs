//! # Weight Learner
//!
//! Fits the combination weights of the three detectors from an 8×2 histogram.
//!
//! The histogram expands into a synthetic design with at most 16 rows: one row per
//! non-empty (pattern, label) cell, carrying the cell count as its sample weight.
//! Because every record in a cell has the same features and the same label, the
//! weighted log-loss over those rows equals the log-loss over the full record
//! stream.
//!
//! The model is an L2-penalised logistic regression with an unpenalised
//! intercept, minimising
//!
//! ```text
//! 0.5 * ||beta||^2 + C * sum_i s_i * logloss(y_i, sigmoid(beta_0 + x_i . beta))
//! ```
//!
//! by Newton / IRLS with step halving. The slope coefficients are then clipped at
//! zero and renormalised to sum to one; the intercept is discarded.

use crate::calibrate::config::FitConfig;
use crate::calibrate::histogram::Histogram;
use crate::calibrate::pattern::{Detector, NUM_DETECTORS, Pattern};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance on the sum of a weight vector.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum FitError {
    #[error(
        "Cannot fit detector weights: the histogram is empty. No valid comparison records reached the weight learner."
    )]
    EmptyHistogram,

    #[error("A linear system solve failed during the Newton update. The Hessian may be singular. Error: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error("The logistic objective became non-finite at iteration {iteration}.")]
    NonFiniteObjective { iteration: usize },

    #[error("Invalid weight vector {weights:?}: {reason}")]
    InvalidWeights {
        weights: [f64; NUM_DETECTORS],
        reason: String,
    },

    #[error("Unknown detector name '{0}' in weight list.")]
    UnknownDetector(String),
}

/// Non-negative per-detector weights summing to one, in canonical bit order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightVector([f64; NUM_DETECTORS]);

impl WeightVector {
    /// Validates and wraps `weights`. Entries must be finite, non-negative and
    /// sum to one within [`WEIGHT_SUM_TOLERANCE`].
    pub fn new(weights: [f64; NUM_DETECTORS]) -> Result<Self, FitError> {
        let invalid = |reason: &str| FitError::InvalidWeights {
            weights,
            reason: reason.to_string(),
        };
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(invalid("entries must be finite"));
        }
        if weights.iter().any(|&w| w < 0.0) {
            return Err(invalid("entries must be non-negative"));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(invalid(&format!("entries sum to {sum}, expected 1")));
        }
        Ok(Self(weights))
    }

    /// Rescales non-negative finite entries to sum to one.
    pub fn normalized(weights: [f64; NUM_DETECTORS]) -> Result<Self, FitError> {
        let sum: f64 = weights.iter().sum();
        if !sum.is_finite() || sum <= 0.0 || weights.iter().any(|&w| w < 0.0) {
            return Err(FitError::InvalidWeights {
                weights,
                reason: "cannot normalise: entries must be non-negative with a positive sum"
                    .to_string(),
            });
        }
        Self::new(weights.map(|w| w / sum))
    }

    pub fn uniform() -> Self {
        Self([1.0 / NUM_DETECTORS as f64; NUM_DETECTORS])
    }

    /// The weights currently used in production scoring.
    pub fn production_default() -> Self {
        Self([0.6170, 0.2946, 0.0884])
    }

    /// Clips raw coefficients at zero and renormalises. Returns the vector and
    /// whether the uniform fallback was taken (every clipped entry was zero).
    pub fn from_coefficients(coefficients: [f64; NUM_DETECTORS]) -> (Self, bool) {
        let clipped = coefficients.map(|c| if c.is_finite() { c.max(0.0) } else { 0.0 });
        let sum: f64 = clipped.iter().sum();
        if sum <= 0.0 {
            (Self::uniform(), true)
        } else {
            (Self(clipped.map(|c| c / sum)), false)
        }
    }

    /// Builds a vector from `(detector_name, weight)` pairs in any order.
    pub fn from_named<S: AsRef<str>>(pairs: &[(S, f64)]) -> Result<Self, FitError> {
        let mut weights = [f64::NAN; NUM_DETECTORS];
        for (name, weight) in pairs {
            let detector = Detector::from_name(name.as_ref())
                .ok_or_else(|| FitError::UnknownDetector(name.as_ref().to_string()))?;
            weights[detector.bit()] = *weight;
        }
        Self::new(weights)
    }

    pub fn get(&self, detector: Detector) -> f64 {
        self.0[detector.bit()]
    }

    pub fn as_array(&self) -> [f64; NUM_DETECTORS] {
        self.0
    }

    /// Ordered `(detector_name, weight)` pairs.
    pub fn named(&self) -> Vec<(String, f64)> {
        Detector::ALL
            .iter()
            .map(|d| (d.name().to_string(), self.get(*d)))
            .collect()
    }

    /// `score(p) = sum_i w_i * bit_i(p)`.
    pub fn score(&self, pattern: Pattern) -> f64 {
        Detector::ALL
            .iter()
            .filter(|d| pattern.bit(**d))
            .map(|d| self.get(*d))
            .sum()
    }
}

impl Default for WeightVector {
    fn default() -> Self {
        Self::production_default()
    }
}

/// The weighted synthetic design built from a histogram.
#[derive(Debug, Clone)]
pub struct WeightedDesign {
    /// Rows of `[1, sm, cr, ph]`.
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub sample_weights: Array1<f64>,
}

impl WeightedDesign {
    pub fn nrows(&self) -> usize {
        self.x.nrows()
    }
}

/// Expands the histogram into at most 16 weighted rows, intercept column first.
pub fn build_weighted_design(histogram: &Histogram) -> WeightedDesign {
    let mut rows: Vec<([f64; NUM_DETECTORS], f64, f64)> = Vec::with_capacity(16);
    for (pattern, counts) in histogram.iter() {
        if counts.negatives > 0 {
            rows.push((pattern.features(), 0.0, counts.negatives as f64));
        }
        if counts.positives > 0 {
            rows.push((pattern.features(), 1.0, counts.positives as f64));
        }
    }

    let mut x = Array2::<f64>::zeros((rows.len(), NUM_DETECTORS + 1));
    let mut y = Array1::<f64>::zeros(rows.len());
    let mut sample_weights = Array1::<f64>::zeros(rows.len());
    for (i, (features, label, weight)) in rows.into_iter().enumerate() {
        x[[i, 0]] = 1.0;
        for (j, f) in features.into_iter().enumerate() {
            x[[i, j + 1]] = f;
        }
        y[i] = label;
        sample_weights[i] = weight;
    }
    WeightedDesign {
        x,
        y,
        sample_weights,
    }
}

/// Outcome of the Newton iterations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// The objective change fell below tolerance.
    Converged,
    /// No step along the Newton direction reduced the objective; the iterate is
    /// at the numerical minimum.
    StalledAtMinimum,
    /// The iteration ceiling was reached first.
    MaxIterationsReached,
}

impl FitStatus {
    pub fn converged(self) -> bool {
        !matches!(self, FitStatus::MaxIterationsReached)
    }
}

/// What the learner returns besides the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub weights: [f64; NUM_DETECTORS],
    pub coefficients: [f64; NUM_DETECTORS],
    pub intercept: f64,
    pub iterations: usize,
    pub status: FitStatus,
    pub converged: bool,
    pub objective: f64,
    pub design_rows: usize,
    pub patterns_present: usize,
    /// Fraction of positive records, weighted by count.
    pub positive_rate: f64,
    pub uniform_fallback: bool,
}

impl FitReport {
    pub fn weight_vector(&self) -> WeightVector {
        WeightVector(self.weights)
    }
}

/// Numerically stable `ln(1 + e^x)`.
fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

fn sigmoid(x: f64) -> f64 {
    let e = x.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-e).exp())
}

/// Penalised objective at `beta` (intercept first).
fn objective(beta: ArrayView1<f64>, design: &WeightedDesign, c: f64) -> f64 {
    let eta = design.x.dot(&beta);
    let loss = Zip::from(&eta)
        .and(&design.y)
        .and(&design.sample_weights)
        .fold(0.0, |acc, &e, &y, &s| acc + s * (softplus(e) - y * e));
    let penalty = 0.5 * beta.slice(s![1..]).dot(&beta.slice(s![1..]));
    penalty + c * loss
}

/// Gradient and Hessian of the penalised objective.
fn newton_system(
    beta: ArrayView1<f64>,
    x: ArrayView2<f64>,
    design: &WeightedDesign,
    c: f64,
) -> (Array1<f64>, Array2<f64>) {
    const MIN_WEIGHT: f64 = 1e-10;

    let eta = x.dot(&beta);
    let mu = eta.mapv(sigmoid);
    let residual = &mu - &design.y;
    let irls_weights = (&mu * &(1.0 - &mu)).mapv(|v| v.max(MIN_WEIGHT)) * &design.sample_weights;

    let mut gradient = x.t().dot(&(&residual * &design.sample_weights)) * c;
    let weighted_x = &x * &irls_weights.view().insert_axis(Axis(1));
    let mut hessian = x.t().dot(&weighted_x) * c;

    // Ridge on the slopes only.
    for j in 1..beta.len() {
        gradient[j] += beta[j];
        hessian[[j, j]] += 1.0;
    }
    (gradient, hessian)
}

/// Fits the weights of the three detectors from a histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightLearner {
    config: FitConfig,
}

impl WeightLearner {
    pub fn new(config: FitConfig) -> Self {
        Self { config }
    }

    pub fn fit(&self, histogram: &Histogram) -> Result<FitReport, FitError> {
        fit_weights(histogram, &self.config)
    }
}

impl Default for WeightLearner {
    fn default() -> Self {
        Self::new(FitConfig::default())
    }
}

/// Fits, clips and normalises the detector weights.
pub fn fit_weights(histogram: &Histogram, config: &FitConfig) -> Result<FitReport, FitError> {
    const MAX_HALVINGS: usize = 40;

    if histogram.is_empty() {
        return Err(FitError::EmptyHistogram);
    }

    let design = build_weighted_design(histogram);
    let c = config.inverse_regularization;
    let mut beta = Array1::<f64>::zeros(NUM_DETECTORS + 1);
    let mut current = objective(beta.view(), &design, c);
    let mut status = FitStatus::MaxIterationsReached;
    let mut iterations = 0;

    log::debug!(
        "Fitting detector weights on {} weighted rows (C = {c}).",
        design.nrows()
    );

    for iter in 1..=config.max_iterations {
        iterations = iter;
        let (gradient, hessian) = newton_system(beta.view(), design.x.view(), &design, c);
        let direction = hessian
            .solve_into(gradient)
            .map_err(FitError::LinearSystemSolveFailed)?;

        let mut step = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_HALVINGS {
            let candidate = &beta - &(&direction * step);
            let value = objective(candidate.view(), &design, c);
            if !value.is_finite() {
                return Err(FitError::NonFiniteObjective { iteration: iter });
            }
            if value <= current {
                accepted = Some((candidate, value));
                break;
            }
            step *= 0.5;
        }

        let Some((next, value)) = accepted else {
            status = FitStatus::StalledAtMinimum;
            break;
        };

        let change = current - value;
        beta = next;
        current = value;
        log::debug!("Newton iteration {iter}: objective {current:.9e}, step {step}");

        if change <= config.tolerance * (1.0 + current.abs()) {
            status = FitStatus::Converged;
            break;
        }
    }

    if status == FitStatus::MaxIterationsReached {
        log::warn!(
            "Weight fit did not converge within {} iterations (objective {current:.6e}); using the last iterate.",
            config.max_iterations
        );
    }

    let coefficients = [beta[1], beta[2], beta[3]];
    let (weights, uniform_fallback) = WeightVector::from_coefficients(coefficients);
    if uniform_fallback {
        log::warn!(
            "All fitted coefficients {coefficients:?} are non-positive; falling back to uniform weights."
        );
    }

    let total = histogram.total() as f64;
    let report = FitReport {
        weights: weights.as_array(),
        coefficients,
        intercept: beta[0],
        iterations,
        status,
        converged: status.converged(),
        objective: current,
        design_rows: design.nrows(),
        patterns_present: histogram.patterns_present(),
        positive_rate: histogram.total_positives() as f64 / total,
        uniform_fallback,
    };
    log::info!(
        "Fitted weights {:?} after {} iterations ({:?}).",
        weights.named(),
        report.iterations,
        report.status
    );
    Ok(report)
}
