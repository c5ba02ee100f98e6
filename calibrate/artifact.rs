//! # Persisted artifacts
//!
//! Two TOML files leave a calibration run:
//!
//! - [`HistogramArtifact`]: the aggregated 8×2 table (and optional per-family
//!   tables) together with the taus that produced it. Fitting and evaluation can
//!   start from it without rescanning the comparison data.
//! - [`CalibrationModel`]: the final operating point for production scoring,
//!   i.e. taus, named weights, threshold, and the metadata of the run.
//!
//! Weights and taus are stored by detector name so the files do not depend on
//! the in-memory bit order.

use crate::calibrate::histogram::{Aggregation, DropTally, GroupedHistograms, Histogram};
use crate::calibrate::metrics::OperatingPointRecord;
use crate::calibrate::pattern::{Binarizer, Detector, NUM_DETECTORS};
use crate::calibrate::threshold::{OperatingPoint, SelectionMode};
use crate::calibrate::weights::{FitError, FitReport, WeightVector};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Version written into every artifact.
pub const ARTIFACT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read or write artifact file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML artifact file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize artifact to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Unsupported artifact version {found}; this build reads version {expected}.")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("The artifact has no tau for detector {0}.")]
    MissingTau(Detector),
    #[error("The artifact carries an invalid weight vector: {0}")]
    InvalidWeights(#[from] FitError),
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ArtifactError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn check_version(found: u32) -> Result<(), ArtifactError> {
    if found != ARTIFACT_VERSION {
        return Err(ArtifactError::UnsupportedVersion {
            found,
            expected: ARTIFACT_VERSION,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorTau {
    pub detector: Detector,
    pub tau: f64,
}

fn named_taus(binarizer: &Binarizer) -> Vec<DetectorTau> {
    Detector::ALL
        .iter()
        .map(|&detector| DetectorTau {
            detector,
            tau: binarizer.tau(detector),
        })
        .collect()
}

fn binarizer_from(taus: &[DetectorTau]) -> Result<Binarizer, ArtifactError> {
    let mut values = [None; NUM_DETECTORS];
    for entry in taus {
        values[entry.detector.bit()] = Some(entry.tau);
    }
    let mut resolved = [0.0; NUM_DETECTORS];
    for detector in Detector::ALL {
        resolved[detector.bit()] =
            values[detector.bit()].ok_or(ArtifactError::MissingTau(detector))?;
    }
    Ok(Binarizer::new(resolved))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedWeight {
    pub detector: String,
    pub weight: f64,
}

/// The aggregated histogram of a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramArtifact {
    pub version: u32,
    pub rows_seen: u64,
    pub rows_kept: u64,
    pub taus: Vec<DetectorTau>,
    pub drops: DropTally,
    pub histogram: Histogram,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<GroupedHistograms>,
}

impl HistogramArtifact {
    pub fn new(binarizer: &Binarizer, aggregation: &Aggregation) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            rows_seen: aggregation.seen,
            rows_kept: aggregation.kept,
            taus: named_taus(binarizer),
            drops: aggregation.drops,
            histogram: aggregation.histogram,
            groups: aggregation.groups.clone(),
        }
    }

    pub fn binarizer(&self) -> Result<Binarizer, ArtifactError> {
        binarizer_from(&self.taus)
    }

    /// Rebuilds the aggregation the artifact was written from.
    pub fn into_aggregation(self) -> Aggregation {
        Aggregation {
            histogram: self.histogram,
            groups: self.groups,
            seen: self.rows_seen,
            kept: self.rows_kept,
            drops: self.drops,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        save_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let toml_string = fs::read_to_string(path)?;
        let artifact: Self = toml::from_str(&toml_string)?;
        check_version(artifact.version)?;
        Ok(artifact)
    }
}

/// The production operating point and how it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModel {
    pub version: u32,
    pub rows_seen: u64,
    pub rows_kept: u64,
    /// Anchor families the calibration was restricted to; empty means all.
    #[serde(default)]
    pub families: Vec<String>,
    pub taus: Vec<DetectorTau>,
    /// Ordered `(detector, weight)` pairs, summing to one.
    pub weights: Vec<NamedWeight>,
    pub selection: SelectionMode,
    /// Absent when the selection criterion could not be met.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_point: Option<OperatingPointRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fit: Option<FitReport>,
    pub drops: DropTally,
}

impl CalibrationModel {
    pub fn new(
        binarizer: &Binarizer,
        weights: &WeightVector,
        selection: SelectionMode,
        operating_point: Option<&OperatingPoint>,
    ) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            rows_seen: 0,
            rows_kept: 0,
            families: Vec::new(),
            taus: named_taus(binarizer),
            weights: weights
                .named()
                .into_iter()
                .map(|(detector, weight)| NamedWeight { detector, weight })
                .collect(),
            selection,
            operating_point: operating_point.map(OperatingPoint::record),
            fit: None,
            drops: DropTally::default(),
        }
    }

    /// The production defaults: offline taus, production weights and threshold.
    pub fn production_default() -> Self {
        let mut model = Self::new(
            &Binarizer::default(),
            &WeightVector::production_default(),
            SelectionMode::YoudenJ,
            None,
        );
        model.operating_point = Some(OperatingPointRecord::new(
            DEFAULT_PRODUCTION_THRESHOLD,
            Default::default(),
        ));
        model
    }

    pub fn with_fit(mut self, fit: FitReport) -> Self {
        self.fit = Some(fit);
        self
    }

    pub fn with_scan(mut self, aggregation: &Aggregation) -> Self {
        self.rows_seen = aggregation.seen;
        self.rows_kept = aggregation.kept;
        self.drops = aggregation.drops;
        self
    }

    pub fn with_families(mut self, families: Vec<String>) -> Self {
        self.families = families;
        self
    }

    pub fn weights(&self) -> Result<WeightVector, ArtifactError> {
        let pairs: Vec<(&str, f64)> = self
            .weights
            .iter()
            .map(|w| (w.detector.as_str(), w.weight))
            .collect();
        Ok(WeightVector::from_named(&pairs)?)
    }

    pub fn binarizer(&self) -> Result<Binarizer, ArtifactError> {
        binarizer_from(&self.taus)
    }

    pub fn threshold(&self) -> Option<f64> {
        self.operating_point.as_ref().map(|p| p.threshold)
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        save_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        check_version(model.version)?;
        // Fail early on a model that cannot be used for scoring.
        model.weights()?;
        model.binarizer()?;
        Ok(model)
    }
}

/// Threshold paired with the production weights.
pub const DEFAULT_PRODUCTION_THRESHOLD: f64 = 0.6170;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::config::FitConfig;
    use crate::calibrate::threshold::select_threshold;
    use crate::calibrate::weights::fit_weights;
    use tempfile::tempdir;

    #[test]
    fn model_round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");

        let histogram = Histogram::from_entries(&[(0, 900, 3), (1, 40, 60), (3, 5, 200), (7, 1, 300)]);
        let fit = fit_weights(&histogram, &FitConfig::default()).unwrap();
        let weights = fit.weight_vector();
        let mode = SelectionMode::recall_floor(0.95).unwrap();
        let selection = select_threshold(&histogram, &weights, mode).unwrap();
        let model = CalibrationModel::new(&Binarizer::default(), &weights, mode, selection.operating_point())
            .with_fit(fit)
            .with_families(vec!["busybox".to_string()]);
        model.save(&path).unwrap();

        let loaded = CalibrationModel::load(&path).unwrap();
        assert_eq!(loaded, model);
        assert_eq!(loaded.weights().unwrap(), weights);
        assert_eq!(loaded.binarizer().unwrap(), Binarizer::default());
        assert_eq!(loaded.threshold(), selection.operating_point().map(|p| p.threshold));
    }

    #[test]
    fn weights_are_stored_by_name() {
        let model = CalibrationModel::production_default();
        let text = toml::to_string_pretty(&model).unwrap();
        assert!(text.contains("STRING_MINHASH"));
        assert!(text.contains("criterion = \"youden_j\""));

        // Reordered entries still resolve by name.
        let mut reordered = model.clone();
        reordered.weights.reverse();
        reordered.taus.reverse();
        assert_eq!(reordered.weights().unwrap(), WeightVector::production_default());
        assert_eq!(reordered.binarizer().unwrap(), Binarizer::default());
    }

    #[test]
    fn missing_tau_is_rejected() {
        let mut model = CalibrationModel::production_default();
        model.taus.pop();
        assert!(matches!(
            model.binarizer(),
            Err(ArtifactError::MissingTau(Detector::ProgramHeader))
        ));
    }

    #[test]
    fn histogram_artifact_round_trips_with_groups() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hist.toml");
        let mut groups = GroupedHistograms::new();
        groups.insert("libcrypto.so", Histogram::from_entries(&[(7, 1, 2)]));
        groups.insert("ip", Histogram::from_entries(&[(0, 3, 0)]));
        let aggregation = Aggregation {
            histogram: groups.total(),
            groups: Some(groups),
            seen: 7,
            kept: 6,
            drops: DropTally {
                invalid_label: 1,
                ..DropTally::default()
            },
        };

        let artifact = HistogramArtifact::new(&Binarizer::default(), &aggregation);
        artifact.save(&path).unwrap();
        let loaded = HistogramArtifact::load(&path).unwrap();
        assert_eq!(loaded, artifact);
        assert_eq!(loaded.into_aggregation(), aggregation);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");
        let mut model = CalibrationModel::production_default();
        model.version = 99;
        model.save(&path).unwrap();
        assert!(matches!(
            CalibrationModel::load(&path),
            Err(ArtifactError::UnsupportedVersion { found: 99, .. })
        ));
    }
}
