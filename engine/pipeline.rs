//! # Calibration pipeline
//!
//! Orchestrates the engine stages over an input path: streaming scan into a
//! histogram, weight fit, operating-point selection, threshold sweeps, the
//! per-detector tau search and the false-positive pair tally. Every stage reads
//! its settings from one [`CalibrationConfig`]; nothing here is global.

use crate::calibrate::artifact::{ArtifactError, CalibrationModel, HistogramArtifact};
use crate::calibrate::config::{CalibrationConfig, ConfigError, ScoreSource};
use crate::calibrate::data::{DataError, FamilyMap, InputSettings, RecordBatches, open_records};
use crate::calibrate::histogram::{Aggregation, ComparisonRecord, GroupedHistograms, aggregate_parallel};
use crate::calibrate::metrics::{OperatingPointRecord, PatternScores, evaluate_thresholds, sweep_thresholds};
use crate::calibrate::pattern::{Binarizer, Detector};
use crate::calibrate::report::{FalsePositiveTally, FamilyRecord, ReportError, family_records};
use crate::calibrate::roc::{RocCurve, RocError, TauReport, TauSampler};
use crate::calibrate::threshold::{Selection, SelectionError, SelectionMode, ThresholdSelector};
use crate::calibrate::weights::{FitError, FitReport, WeightLearner, WeightVector};
use ahash::AHashSet;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Input error: {0}")]
    Data(#[from] DataError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Weight fitting failed: {0}")]
    Fit(#[from] FitError),
    #[error("Threshold selection failed: {0}")]
    Selection(#[from] SelectionError),
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("Report error: {0}")]
    Report(#[from] ReportError),
    #[error("ROC analysis failed: {0}")]
    Roc(#[from] RocError),
    #[error("No usable comparison records were found in '{0}'.")]
    NoRecords(PathBuf),
    #[error(
        "The model has no operating point. Re-run calibration with a criterion that can be met."
    )]
    NoOperatingPoint,
    #[error(
        "The tau search needs raw detector scores, but the input is configured for pre-binarized flags."
    )]
    RawScoresRequired,
    #[error(
        "'{0}' holds no per-family histograms, so a family filter cannot be applied. Re-run aggregate with --by-family."
    )]
    UngroupedArtifact(PathBuf),
}

// --- Scanning ---

/// Restricts a scan to comparisons whose anchor family is listed.
#[derive(Debug, Clone)]
struct FamilyFilter(AHashSet<String>);

impl FamilyFilter {
    fn new(families: &[String]) -> Self {
        Self(
            families
                .iter()
                .map(|f| f.trim().to_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
        )
    }

    fn accepts_group(&self, group: &str) -> bool {
        self.0.contains(&group.trim().to_lowercase())
    }

    fn accepts(&self, record: &ComparisonRecord) -> bool {
        record.group.as_deref().is_some_and(|g| self.accepts_group(g))
    }

    /// Keeps only the listed families of a grouped aggregation. Per-family drop
    /// counts are not stored, so `seen` collapses to `kept`.
    fn restrict(&self, aggregation: &Aggregation) -> Option<Aggregation> {
        let groups = aggregation.groups.as_ref()?;
        let mut kept = GroupedHistograms::new();
        for (name, histogram) in groups.sorted() {
            if self.accepts_group(name) {
                kept.insert(name, *histogram);
            }
        }
        let histogram = kept.total();
        Some(Aggregation {
            histogram,
            groups: Some(kept),
            seen: histogram.total(),
            kept: histogram.total(),
            drops: Default::default(),
        })
    }
}

fn accepts(filter: Option<&FamilyFilter>, record: &ComparisonRecord) -> bool {
    filter.is_none_or(|f| f.accepts(record))
}

/// A spinner with a running record count. Drawn to stderr, hidden when not a TTY.
fn scan_progress(input: &Path) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.cyan} {msg} {human_pos} records ({per_sec}, {elapsed})")
    {
        pb.set_style(style);
    }
    pb.set_message(format!("Scanning {}", input.display()));
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

/// Options shared by every stage that streams the input.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Keep one histogram per anchor family alongside the global one.
    pub by_group: bool,
    /// Explicit `filename -> family` overrides.
    pub families: Option<FamilyMap>,
    /// Only comparisons whose anchor family is listed are considered.
    pub family_filter: Option<Vec<String>>,
}

/// The outcome of a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub aggregation: Aggregation,
    /// Detector taus behind the patterns. For flag inputs these are the taus
    /// that produced the flags, not the 0.5 cut used to read them.
    pub binarizer: Binarizer,
    /// Anchor-equals-candidate comparisons removed before aggregation.
    pub self_matches: u64,
    /// Export files that could not be read.
    pub skipped_files: usize,
}

/// Streams `input` through the binarizer into an [`Aggregation`].
pub fn scan(input: &Path, config: &CalibrationConfig, options: ScanOptions) -> Result<Scan, PipelineError> {
    let settings = InputSettings::from_config(config);
    let reader = config.binarizer();
    let filter = options.family_filter.as_deref().map(FamilyFilter::new);
    let mut source = open_records(input, &settings, options.families)?;

    let progress = scan_progress(input);
    let records = source
        .by_ref()
        .filter(|item| item.as_ref().map_or(true, |r| accepts(filter.as_ref(), r)));
    let batches = RecordBatches::new(records, settings.batch_rows).inspect(|batch| {
        if let Ok(batch) = batch {
            progress.inc(batch.len() as u64);
        }
    });
    let result = aggregate_parallel(reader, batches, options.by_group);
    progress.finish_and_clear();
    let aggregation = result?;

    let scan = Scan {
        aggregation,
        binarizer: config.detector_binarizer(),
        self_matches: source.self_matches(),
        skipped_files: source.skipped_files(),
    };
    log_scan(input, &scan);
    if scan.aggregation.kept == 0 {
        return Err(PipelineError::NoRecords(input.to_path_buf()));
    }
    Ok(scan)
}

fn log_scan(input: &Path, scan: &Scan) {
    let a = &scan.aggregation;
    log::info!(
        "Scanned {}: {} records seen, {} kept ({} positive, {} negative), {} dropped",
        input.display(),
        a.seen,
        a.kept,
        a.histogram.total_positives(),
        a.histogram.total_negatives(),
        a.drops.total()
    );
    if a.drops.total() > 0 {
        log::info!(
            "Dropped records: missing score {:?}, non-finite score {:?} (sm, cr, ph), {} invalid label",
            a.drops.missing_score,
            a.drops.non_finite_score,
            a.drops.invalid_label
        );
    }
    if scan.self_matches > 0 {
        log::info!("Skipped {} self-comparisons", scan.self_matches);
    }
    if scan.skipped_files > 0 {
        log::warn!("{} export files could not be read and were skipped", scan.skipped_files);
    }
    if let Some(groups) = &a.groups {
        log::info!("Collected histograms for {} anchor families", groups.len());
    }
}

/// Loads a saved histogram artifact (`.toml`) or scans comparison data.
pub fn load_or_scan(input: &Path, config: &CalibrationConfig, options: ScanOptions) -> Result<Scan, PipelineError> {
    if input.extension().is_some_and(|ext| ext == "toml") {
        let artifact = HistogramArtifact::load(input)?;
        let binarizer = artifact.binarizer()?;
        let mut aggregation = artifact.into_aggregation();
        if let Some(families) = options.family_filter.as_deref() {
            aggregation = FamilyFilter::new(families)
                .restrict(&aggregation)
                .ok_or_else(|| PipelineError::UngroupedArtifact(input.to_path_buf()))?;
        }
        if options.by_group && aggregation.groups.is_none() {
            log::warn!(
                "{} holds no per-family histograms; re-run aggregate with --by-family",
                input.display()
            );
        }
        log::info!(
            "Loaded histogram from {} ({} records kept)",
            input.display(),
            aggregation.kept
        );
        if aggregation.kept == 0 {
            return Err(PipelineError::NoRecords(input.to_path_buf()));
        }
        return Ok(Scan {
            aggregation,
            binarizer,
            self_matches: 0,
            skipped_files: 0,
        });
    }
    scan(input, config, options)
}

// --- Fit & Selection ---

/// Fitted weights plus every operating point of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub fit: FitReport,
    /// Youden-J followed by each configured recall floor.
    pub selections: Vec<(SelectionMode, Selection)>,
    /// The selection stored in the model.
    pub chosen: Selection,
    pub model: CalibrationModel,
}

/// Fits weights on the scanned histogram and selects the operating point.
pub fn calibrate(scan: &Scan, config: &CalibrationConfig, mode: SelectionMode) -> Result<Calibration, PipelineError> {
    let histogram = &scan.aggregation.histogram;
    let fit = WeightLearner::new(config.fit).fit(histogram)?;
    let weights = fit.weight_vector();

    let selector = ThresholdSelector::new(weights);
    let selections = selector.select_all(histogram, &config.selection.recall_targets)?;
    for (mode, selection) in &selections {
        match selection {
            Selection::Reached(point) => log::info!(
                "{mode}: threshold {:.6} (tpr {:.4}, fpr {:.4})",
                point.threshold,
                point.metrics.tpr,
                point.metrics.fpr
            ),
            Selection::NotReachable { target, best_tpr } => log::warn!(
                "Recall target {target} is not reachable; best achievable recall is {best_tpr:.4}"
            ),
        }
    }

    let chosen = selections
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, s)| Ok(*s))
        .unwrap_or_else(|| selector.select(histogram, mode))?;

    let model = CalibrationModel::new(&scan.binarizer, &weights, mode, chosen.operating_point())
        .with_fit(fit.clone())
        .with_scan(&scan.aggregation);
    Ok(Calibration {
        fit,
        selections,
        chosen,
        model,
    })
}

// --- Evaluation ---

/// Metrics for a fixed weight vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub sweep: Vec<OperatingPointRecord>,
    /// Per-family rows, present when the scan kept grouped histograms.
    pub families: Option<Vec<FamilyRecord>>,
    /// `None` when the histogram holds only one class.
    pub auc: Option<f64>,
}

/// Sweeps the achievable levels plus `thresholds`, and reports per-family rows
/// at each of `family_thresholds`.
pub fn evaluate(
    aggregation: &Aggregation,
    weights: &WeightVector,
    thresholds: &[f64],
    family_thresholds: &[f64],
    family_filter: Option<&[String]>,
) -> Evaluation {
    let scores = PatternScores::from_weights(weights);
    let histogram = &aggregation.histogram;
    let sweep = evaluate_thresholds(histogram, &scores, &sweep_thresholds(&scores, thresholds))
        .iter()
        .map(|e| e.record())
        .collect();

    let families = aggregation.groups.as_ref().map(|groups| {
        family_thresholds
            .iter()
            .flat_map(|&t| family_records(groups, &scores, t, family_filter))
            .collect()
    });

    let auc = match RocCurve::from_histogram(histogram, &scores) {
        Ok(curve) => {
            log::info!("AUC over pattern scores: {:.6}", curve.auc);
            Some(curve.auc)
        }
        Err(e) => {
            log::warn!("AUC not available: {e}");
            None
        }
    };

    Evaluation { sweep, families, auc }
}

// --- Tau search ---

/// Sampling settings for the per-detector tau search.
#[derive(Debug, Clone, Default)]
pub struct TauSearch {
    /// Negatives kept per positive; 0 keeps every negative.
    pub neg_pos_ratio: f64,
    /// Stop after this many pairs per detector.
    pub max_rows: Option<usize>,
    pub scan: ScanOptions,
}

/// Runs the tau search for all three detectors in one pass over `input`.
pub fn search_taus(input: &Path, config: &CalibrationConfig, search: TauSearch) -> Result<Vec<TauReport>, PipelineError> {
    if config.input.score_source == ScoreSource::Flags {
        return Err(PipelineError::RawScoresRequired);
    }
    let settings = InputSettings::from_config(config);
    let filter = search.scan.family_filter.as_deref().map(FamilyFilter::new);
    let mut samplers = Detector::ALL.map(|d| TauSampler::new(d, search.neg_pos_ratio, search.max_rows));
    let source = open_records(input, &settings, search.scan.families)?;

    let progress = scan_progress(input);
    for item in source {
        let record = item?;
        progress.inc(1);
        if !accepts(filter.as_ref(), &record) {
            continue;
        }
        let positive = match record.label {
            Some(1) => true,
            Some(0) => false,
            _ => continue,
        };
        for sampler in samplers.iter_mut() {
            sampler.offer(record.score(sampler.detector()), positive);
        }
        if samplers.iter().all(TauSampler::is_full) {
            break;
        }
    }
    progress.finish_and_clear();

    samplers
        .into_iter()
        .map(|sampler| {
            log::info!(
                "{}: sampled {} positive and {} negative pairs",
                sampler.detector(),
                sampler.positives(),
                sampler.negatives()
            );
            Ok(sampler.finish(&config.selection.recall_targets)?)
        })
        .collect()
}

// --- False positives ---

/// Options for the false-positive tally.
#[derive(Debug, Clone, Default)]
pub struct FalsePositiveSearch {
    /// Count label-0 hits without a candidate family under `__unknown__`.
    pub include_unknown: bool,
    pub scan: ScanOptions,
}

/// Tallies false positives per family pair at the model's operating point.
pub fn tally_false_positives(
    input: &Path,
    config: &CalibrationConfig,
    model: &CalibrationModel,
    search: FalsePositiveSearch,
) -> Result<FalsePositiveTally, PipelineError> {
    let threshold = model.threshold().ok_or(PipelineError::NoOperatingPoint)?;
    let binarizer = match config.input.score_source {
        ScoreSource::Raw => model.binarizer()?,
        ScoreSource::Flags => Binarizer::for_flags(),
    };
    let scores = PatternScores::from_weights(&model.weights()?);
    let settings = InputSettings::from_config(config);
    let include_unknown = search.include_unknown;
    let mut source = open_records(input, &settings, search.scan.families)?;

    let progress = scan_progress(input);
    let batches = RecordBatches::new(source.by_ref(), settings.batch_rows).inspect(|batch| {
        if let Ok(batch) = batch {
            progress.inc(batch.len() as u64);
        }
    });
    let result = batches
        .par_bridge()
        .try_fold(FalsePositiveTally::new, |mut tally, batch| {
            for record in &batch? {
                tally.observe(&binarizer, &scores, threshold, include_unknown, record);
            }
            Ok::<_, DataError>(tally)
        })
        .try_reduce(FalsePositiveTally::new, |a, b| Ok(a.merge(b)));
    progress.finish_and_clear();
    let mut tally = result?;

    if let Some(families) = search.scan.family_filter.as_deref() {
        tally.retain_families(families);
    }
    log::info!(
        "{} false positives at threshold {threshold} ({} dropped, {} without a family)",
        tally.total(),
        tally.dropped,
        tally.unattributed
    );
    if source.skipped_files() > 0 {
        log::warn!("{} export files could not be read and were skipped", source.skipped_files());
    }
    Ok(tally)
}
