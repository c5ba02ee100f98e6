//! # Calibration Configuration
//!
//! All tunables of a calibration run live in one [`CalibrationConfig`] value that
//! is passed to each component at construction time. There is no process-wide
//! state, so several runs with different thresholds can coexist in one process
//! (and in one test binary).
//!
//! The configuration is a human-editable TOML file. Every section is optional;
//! missing sections fall back to the offline-calibrated defaults.

use crate::calibrate::pattern::{Binarizer, Detector, NUM_DETECTORS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Errors raised while reading, writing or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Detector '{0}' is configured more than once.")]
    DuplicateDetector(Detector),
    #[error("Detector '{0}' is missing from the configuration. All three detectors are required.")]
    MissingDetector(Detector),
    #[error("Threshold (tau) for detector '{detector}' must be finite, found {value}.")]
    InvalidTau { detector: Detector, value: f64 },
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Per-detector binarization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub detector: Detector,
    /// Values `>= tau` binarize to 1.
    pub tau: f64,
    /// Column holding the raw similarity value.
    pub score_column: String,
    /// Column holding the pre-binarized flag.
    pub flag_column: String,
}

impl DetectorConfig {
    pub fn for_detector(detector: Detector) -> Self {
        Self {
            detector,
            tau: detector.default_tau(),
            score_column: detector.score_column().to_string(),
            flag_column: detector.flag_column().to_string(),
        }
    }
}

/// Settings for the weighted logistic-regression fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Inverse L2 regularization strength (`C`). Larger means weaker penalty.
    pub inverse_regularization: f64,
    /// Iteration ceiling for the Newton/IRLS loop.
    pub max_iterations: usize,
    /// Relative objective change below which the fit counts as converged.
    pub tolerance: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            inverse_regularization: 1.0,
            max_iterations: 400,
            tolerance: 1e-8,
        }
    }
}

/// Settings for operating-point selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Recall floors reported alongside the Youden-J operating point.
    pub recall_targets: Vec<f64>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            recall_targets: vec![0.95, 0.99],
        }
    }
}

/// Whether detector columns hold raw similarities or 0/1 flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    #[default]
    Raw,
    Flags,
}

/// Column names and scan settings for tabular inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Records per batch handed to the aggregator.
    pub batch_rows: usize,
    pub score_source: ScoreSource,
    pub label_column: String,
    pub group_column: String,
    pub candidate_group_column: String,
    pub anchor_column: String,
    pub candidate_column: String,
    /// Skip comparisons of a file with itself (case-insensitive name match).
    pub drop_self_matches: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            batch_rows: 256_000,
            score_source: ScoreSource::Raw,
            label_column: "label_same_family".to_string(),
            group_column: "src_family".to_string(),
            candidate_group_column: "dst_family".to_string(),
            anchor_column: "anchor".to_string(),
            candidate_column: "candidate".to_string(),
            drop_self_matches: false,
        }
    }
}

/// The complete configuration of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub detectors: Vec<DetectorConfig>,
    pub fit: FitConfig,
    pub selection: SelectionConfig,
    pub input: InputConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            detectors: Detector::ALL.map(DetectorConfig::for_detector).to_vec(),
            fit: FitConfig::default(),
            selection: SelectionConfig::default(),
            input: InputConfig::default(),
        }
    }
}

impl CalibrationConfig {
    /// Loads and validates a configuration file. Detector entries may appear in
    /// any order; they are stored in canonical bit order afterwards.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let mut config: CalibrationConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        config.detectors.sort_by_key(|d| d.detector.bit());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = [false; NUM_DETECTORS];
        for entry in &self.detectors {
            let slot = &mut seen[entry.detector.bit()];
            if *slot {
                return Err(ConfigError::DuplicateDetector(entry.detector));
            }
            *slot = true;
            if !entry.tau.is_finite() {
                return Err(ConfigError::InvalidTau {
                    detector: entry.detector,
                    value: entry.tau,
                });
            }
        }
        if let Some(detector) = Detector::ALL.into_iter().find(|d| !seen[d.bit()]) {
            return Err(ConfigError::MissingDetector(detector));
        }

        if !(self.fit.inverse_regularization.is_finite() && self.fit.inverse_regularization > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "fit.inverse_regularization",
                reason: format!("must be positive, found {}", self.fit.inverse_regularization),
            });
        }
        if self.fit.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fit.max_iterations",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.fit.tolerance.is_finite() && self.fit.tolerance > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "fit.tolerance",
                reason: format!("must be positive, found {}", self.fit.tolerance),
            });
        }
        if let Some(bad) = self
            .selection
            .recall_targets
            .iter()
            .find(|t| !(**t > 0.0 && **t <= 1.0))
        {
            return Err(ConfigError::InvalidValue {
                field: "selection.recall_targets",
                reason: format!("targets must lie in (0, 1], found {bad}"),
            });
        }
        if self.input.batch_rows == 0 {
            return Err(ConfigError::InvalidValue {
                field: "input.batch_rows",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Settings for one detector. Falls back to the defaults if the entry is
    /// absent, which only happens for configurations that skipped validation.
    pub fn detector(&self, detector: Detector) -> DetectorConfig {
        self.detectors
            .iter()
            .find(|d| d.detector == detector)
            .cloned()
            .unwrap_or_else(|| DetectorConfig::for_detector(detector))
    }

    /// Taus in canonical bit order.
    pub fn taus(&self) -> [f64; NUM_DETECTORS] {
        Detector::ALL.map(|d| self.detector(d).tau)
    }

    /// The binarizer built from the detector taus. This is what models and
    /// histogram artifacts record, whatever the score source.
    pub fn detector_binarizer(&self) -> Binarizer {
        Binarizer::new(self.taus())
    }

    /// The binarizer used to read input rows under the configured score source.
    pub fn binarizer(&self) -> Binarizer {
        match self.input.score_source {
            ScoreSource::Raw => self.detector_binarizer(),
            ScoreSource::Flags => Binarizer::for_flags(),
        }
    }

    /// The input column feeding each detector, in canonical bit order.
    pub fn input_columns(&self) -> [String; NUM_DETECTORS] {
        Detector::ALL.map(|d| {
            let entry = self.detector(d);
            match self.input.score_source {
                ScoreSource::Raw => entry.score_column,
                ScoreSource::Flags => entry.flag_column,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_offline_calibration() {
        let config = CalibrationConfig::default();
        config.validate().unwrap();
        let taus = config.taus();
        assert_abs_diff_eq!(taus[0], 0.146484375);
        assert_abs_diff_eq!(taus[1], 0.3988839387893677);
        assert_abs_diff_eq!(taus[2], 0.8291192054748535);
        assert_eq!(config.fit.max_iterations, 400);
        assert_eq!(config.selection.recall_targets, vec![0.95, 0.99]);
    }

    #[test]
    fn partial_file_reorders_detectors_canonically() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[detectors]]
detector = "PROGRAM_HEADER_VECTOR"
tau = 0.8
score_column = "ph"
flag_column = "ph_bin"

[[detectors]]
detector = "STRING_MINHASH"
tau = 0.1
score_column = "sm"
flag_column = "sm_bin"

[[detectors]]
detector = "CODE_REGION_LIST"
tau = 0.4
score_column = "cr"
flag_column = "cr_bin"

[fit]
max_iterations = 50
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = CalibrationConfig::load(file.path()).unwrap();
        assert_eq!(config.taus(), [0.1, 0.4, 0.8]);
        assert_eq!(config.input_columns(), ["sm", "cr", "ph"].map(String::from));
        assert_eq!(config.fit.max_iterations, 50);
        assert_abs_diff_eq!(config.fit.inverse_regularization, 1.0);
    }

    #[test]
    fn duplicate_and_missing_detectors_are_rejected() {
        let mut config = CalibrationConfig::default();
        config.detectors[2] = DetectorConfig::for_detector(Detector::StringMinhash);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateDetector(Detector::StringMinhash))
        ));

        config.detectors.truncate(2);
        config.detectors[1] = DetectorConfig::for_detector(Detector::CodeRegions);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingDetector(Detector::ProgramHeader))
        ));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let mut config = CalibrationConfig::default();
        config.detectors[0].tau = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTau { .. })));

        let mut config = CalibrationConfig::default();
        config.selection.recall_targets = vec![0.9, 1.5];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "selection.recall_targets", .. })
        ));

        let mut config = CalibrationConfig::default();
        config.fit.inverse_regularization = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn flag_source_uses_flag_columns_and_half_tau() {
        let mut config = CalibrationConfig::default();
        config.input.score_source = ScoreSource::Flags;
        assert_eq!(config.binarizer().taus(), [0.5; NUM_DETECTORS]);
        assert_eq!(config.detector_binarizer().taus(), config.taus());
        assert_eq!(config.input_columns()[0], "bin_string_minhash");
    }

    #[test]
    fn save_then_load_preserves_configuration() {
        let file = NamedTempFile::new().unwrap();
        let mut config = CalibrationConfig::default();
        config.input.drop_self_matches = true;
        config.save(file.path()).unwrap();
        let loaded = CalibrationConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
