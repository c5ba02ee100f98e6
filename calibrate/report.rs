//! # Tabular reports
//!
//! CSV exports of operating points, histograms, per-family evaluations, tau
//! searches and false-positive family pairs. Everything here is computed from
//! histograms and tallies; no report re-reads the comparison data.

use crate::calibrate::histogram::{ComparisonRecord, GroupedHistograms, Histogram, classify};
use crate::calibrate::metrics::{OperatingPointRecord, PatternScores, ThresholdEvaluation};
use crate::calibrate::pattern::{Binarizer, Detector};
use crate::calibrate::roc::TauReport;
use crate::calibrate::threshold::{Selection, SelectionMode};
use ahash::RandomState;
use natord::compare;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Name of the summary row appended to per-family reports.
pub const TOTAL_ROW: &str = "TOTAL";

/// Destination family used for candidates whose family is unknown.
pub const UNKNOWN_FAMILY: &str = "__unknown__";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to create report file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write CSV report: {0}")]
    CsvError(#[from] csv::Error),
}

fn csv_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>, ReportError> {
    let file = File::create(path)?;
    Ok(csv::Writer::from_writer(BufWriter::new(file)))
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), ReportError> {
    let mut writer = csv_writer(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes a threshold sweep, one operating-point record per row.
pub fn write_operating_points(path: &Path, records: &[OperatingPointRecord]) -> Result<(), ReportError> {
    write_rows(path, records)
}

/// Operating point of one family, or of the [`TOTAL_ROW`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilyRecord {
    pub src_family: String,
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

impl FamilyRecord {
    pub fn new(src_family: impl Into<String>, record: OperatingPointRecord) -> Self {
        Self {
            src_family: src_family.into(),
            threshold: record.threshold,
            tp: record.tp,
            fp: record.fp,
            tn: record.tn,
            fn_: record.fn_,
            tpr: record.tpr,
            fpr: record.fpr,
            precision: record.precision,
            specificity: record.specificity,
            accuracy: record.accuracy,
            f1: record.f1,
            youden_j: record.youden_j,
            sample_pos: record.sample_pos,
            sample_neg: record.sample_neg,
        }
    }
}

/// Per-family rows at `threshold` plus a [`TOTAL_ROW`] over the reported families.
///
/// Without a filter every group is reported in natural order. With a filter the
/// families are reported in filter order, including those with no data.
pub fn family_records(
    groups: &GroupedHistograms,
    scores: &PatternScores,
    threshold: f64,
    filter: Option<&[String]>,
) -> Vec<FamilyRecord> {
    let selected: Vec<(String, Histogram)> = match filter {
        Some(families) => families
            .iter()
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .map(|f| {
                let histogram = groups.get(&f).copied().unwrap_or_default();
                (f, histogram)
            })
            .collect(),
        None => groups
            .sorted()
            .into_iter()
            .map(|(name, histogram)| (name.to_string(), *histogram))
            .collect(),
    };

    let mut total = Histogram::new();
    let mut rows = Vec::with_capacity(selected.len() + 1);
    for (family, histogram) in selected {
        total += &histogram;
        let confusion = scores.confusion_at(&histogram, threshold);
        rows.push(FamilyRecord::new(family, OperatingPointRecord::new(threshold, confusion)));
    }
    let confusion = scores.confusion_at(&total, threshold);
    rows.push(FamilyRecord::new(TOTAL_ROW, OperatingPointRecord::new(threshold, confusion)));
    rows
}

pub fn write_family_records(path: &Path, rows: &[FamilyRecord]) -> Result<(), ReportError> {
    write_rows(path, rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct HistogramRow {
    pattern: u8,
    bit_string_minhash: u8,
    bit_code_regions: u8,
    bit_program_header: u8,
    count_neg: u64,
    count_pos: u64,
}

fn histogram_rows(histogram: &Histogram) -> impl Iterator<Item = HistogramRow> + '_ {
    histogram.iter().map(|(pattern, counts)| HistogramRow {
        pattern: pattern.value(),
        bit_string_minhash: pattern.bit(Detector::StringMinhash) as u8,
        bit_code_regions: pattern.bit(Detector::CodeRegions) as u8,
        bit_program_header: pattern.bit(Detector::ProgramHeader) as u8,
        count_neg: counts.negatives,
        count_pos: counts.positives,
    })
}

/// Writes the 8×2 table, one row per pattern.
pub fn write_histogram(path: &Path, histogram: &Histogram) -> Result<(), ReportError> {
    write_rows(path, &histogram_rows(histogram).collect::<Vec<_>>())
}

/// Writes one block of eight rows per family, families in natural order.
pub fn write_grouped_histograms(path: &Path, groups: &GroupedHistograms) -> Result<(), ReportError> {
    #[derive(Serialize)]
    struct GroupRow<'a> {
        src_family: &'a str,
        pattern: u8,
        bit_string_minhash: u8,
        bit_code_regions: u8,
        bit_program_header: u8,
        count_neg: u64,
        count_pos: u64,
    }

    let mut writer = csv_writer(path)?;
    for (family, histogram) in groups.sorted() {
        for row in histogram_rows(histogram) {
            writer.serialize(GroupRow {
                src_family: family,
                pattern: row.pattern,
                bit_string_minhash: row.bit_string_minhash,
                bit_code_regions: row.bit_code_regions,
                bit_program_header: row.bit_program_header,
                count_neg: row.count_neg,
                count_pos: row.count_pos,
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct CriterionRow {
    criterion: String,
    reachable: bool,
    threshold: Option<f64>,
    tp: Option<u64>,
    fp: Option<u64>,
    tn: Option<u64>,
    #[serde(rename = "fn")]
    fn_: Option<u64>,
    tpr: Option<f64>,
    fpr: Option<f64>,
    precision: Option<f64>,
    specificity: Option<f64>,
    accuracy: Option<f64>,
    f1: Option<f64>,
    #[serde(rename = "youdenJ")]
    youden_j: Option<f64>,
}

impl CriterionRow {
    fn unreachable(criterion: String) -> Self {
        Self {
            criterion,
            reachable: false,
            threshold: None,
            tp: None,
            fp: None,
            tn: None,
            fn_: None,
            tpr: None,
            fpr: None,
            precision: None,
            specificity: None,
            accuracy: None,
            f1: None,
            youden_j: None,
        }
    }

    fn reached(criterion: String, evaluation: &ThresholdEvaluation) -> Self {
        let c = evaluation.confusion;
        let m = evaluation.metrics;
        Self {
            criterion,
            reachable: true,
            threshold: Some(evaluation.threshold),
            tp: Some(c.tp),
            fp: Some(c.fp),
            tn: Some(c.tn),
            fn_: Some(c.fn_),
            tpr: Some(m.tpr),
            fpr: Some(m.fpr),
            precision: Some(m.precision),
            specificity: Some(m.specificity),
            accuracy: Some(m.accuracy),
            f1: Some(m.f1),
            youden_j: Some(m.youden_j),
        }
    }
}

/// Writes one row per selection criterion. Unreachable targets leave the
/// metric columns empty.
pub fn write_selections(path: &Path, selections: &[(SelectionMode, Selection)]) -> Result<(), ReportError> {
    let rows: Vec<CriterionRow> = selections
        .iter()
        .map(|(mode, selection)| match selection {
            Selection::Reached(point) => CriterionRow::reached(
                mode.to_string(),
                &ThresholdEvaluation::new(point.threshold, point.confusion),
            ),
            Selection::NotReachable { .. } => CriterionRow::unreachable(mode.to_string()),
        })
        .collect();
    write_rows(path, &rows)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct TauRow {
    detector: &'static str,
    criterion: String,
    auc: f64,
    threshold: Option<f64>,
    tp: Option<u64>,
    fp: Option<u64>,
    tn: Option<u64>,
    #[serde(rename = "fn")]
    fn_: Option<u64>,
    tpr: Option<f64>,
    fpr: Option<f64>,
    precision: Option<f64>,
    sample_pos: u64,
    sample_neg: u64,
}

impl TauRow {
    fn new(report: &TauReport, criterion: String, evaluation: Option<&ThresholdEvaluation>) -> Self {
        Self {
            detector: report.detector.name(),
            criterion,
            auc: report.auc,
            threshold: evaluation.map(|e| e.threshold),
            tp: evaluation.map(|e| e.confusion.tp),
            fp: evaluation.map(|e| e.confusion.fp),
            tn: evaluation.map(|e| e.confusion.tn),
            fn_: evaluation.map(|e| e.confusion.fn_),
            tpr: evaluation.map(|e| e.metrics.tpr),
            fpr: evaluation.map(|e| e.metrics.fpr),
            precision: evaluation.map(|e| e.metrics.precision),
            sample_pos: report.sample_pos,
            sample_neg: report.sample_neg,
        }
    }
}

/// Writes the tau search results, one row per detector and criterion.
pub fn write_tau_reports(path: &Path, reports: &[TauReport]) -> Result<(), ReportError> {
    let mut rows = Vec::new();
    for report in reports {
        rows.push(TauRow::new(report, SelectionMode::YoudenJ.to_string(), Some(&report.youden)));
        for choice in &report.recall {
            let criterion = SelectionMode::RecallFloor {
                target: choice.target,
            }
            .to_string();
            rows.push(TauRow::new(report, criterion, choice.evaluation.as_ref()));
        }
    }
    write_rows(path, &rows)
}

/// One (anchor family, candidate family) false-positive count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FalsePositivePair {
    pub src_family: String,
    pub dst_family: String,
    pub fp_count: u64,
}

/// Counts predicted-positive, label-0 comparisons per family pair at a fixed
/// operating point.
#[derive(Debug, Clone, Default)]
pub struct FalsePositiveTally {
    pairs: HashMap<(String, String), u64, RandomState>,
    /// Records that could not be scored.
    pub dropped: u64,
    /// Label-0 records that were predicted positive but had no usable family.
    pub unattributed: u64,
}

impl FalsePositiveTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scores one record and counts it if it is a false positive.
    ///
    /// Records without an anchor family are not attributable and are counted in
    /// `unattributed`. Records without a candidate family are counted under
    /// [`UNKNOWN_FAMILY`] when `include_unknown` is set.
    pub fn observe(
        &mut self,
        binarizer: &Binarizer,
        scores: &PatternScores,
        threshold: f64,
        include_unknown: bool,
        record: &ComparisonRecord,
    ) {
        let Ok(observation) = classify(binarizer, record) else {
            self.dropped += 1;
            return;
        };
        if observation.positive || scores.score(observation.pattern) < threshold {
            return;
        }
        let src = record.group.as_deref().filter(|g| !g.is_empty());
        let dst = match record.candidate_group.as_deref().filter(|g| !g.is_empty()) {
            Some(dst) => Some(dst),
            None if include_unknown => Some(UNKNOWN_FAMILY),
            None => None,
        };
        match (src, dst) {
            (Some(src), Some(dst)) => self.add(src, dst, 1),
            _ => self.unattributed += 1,
        }
    }

    pub fn add(&mut self, src: &str, dst: &str, n: u64) {
        *self.pairs.entry((src.to_string(), dst.to_string())).or_default() += n;
    }

    pub fn merge(mut self, other: FalsePositiveTally) -> Self {
        for ((src, dst), n) in other.pairs {
            *self.pairs.entry((src, dst)).or_default() += n;
        }
        self.dropped += other.dropped;
        self.unattributed += other.unattributed;
        self
    }

    /// Restricts the tally to the given anchor families.
    pub fn retain_families(&mut self, families: &[String]) {
        let wanted: BTreeSet<String> = families.iter().map(|f| f.trim().to_lowercase()).collect();
        self.pairs.retain(|(src, _), _| wanted.contains(src));
    }

    pub fn total(&self) -> u64 {
        self.pairs.values().sum()
    }

    pub fn get(&self, src: &str, dst: &str) -> u64 {
        self.pairs
            .get(&(src.to_string(), dst.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Pairs by descending count, then anchor family, then candidate family.
    pub fn sorted_pairs(&self) -> Vec<FalsePositivePair> {
        let mut pairs: Vec<FalsePositivePair> = self
            .pairs
            .iter()
            .map(|((src, dst), &n)| FalsePositivePair {
                src_family: src.clone(),
                dst_family: dst.clone(),
                fp_count: n,
            })
            .collect();
        pairs.sort_by(|a, b| {
            b.fp_count
                .cmp(&a.fp_count)
                .then_with(|| a.src_family.cmp(&b.src_family))
                .then_with(|| a.dst_family.cmp(&b.dst_family))
        });
        pairs
    }

    /// Writes the pairs in [`sorted_pairs`](Self::sorted_pairs) order. The header
    /// is written even when there are no false positives.
    pub fn write_pairs(&self, path: &Path, threshold: f64) -> Result<(), ReportError> {
        let mut writer = csv_writer(path)?;
        writer.write_record(["src_family", "dst_family", "fp_count", "threshold"])?;
        let threshold = threshold.to_string();
        for pair in self.sorted_pairs() {
            writer.write_record([
                pair.src_family.as_str(),
                pair.dst_family.as_str(),
                &pair.fp_count.to_string(),
                &threshold,
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Writes the candidate × anchor pivot, families in natural order.
    pub fn write_matrix(&self, path: &Path) -> Result<(), ReportError> {
        let mut srcs: Vec<&str> = self.pairs.keys().map(|(s, _)| s.as_str()).collect();
        let mut dsts: Vec<&str> = self.pairs.keys().map(|(_, d)| d.as_str()).collect();
        for names in [&mut srcs, &mut dsts] {
            names.sort_by(|a, b| compare(a, b));
            names.dedup();
        }

        let mut writer = csv_writer(path)?;
        writer.write_record(std::iter::once("dst \\ src").chain(srcs.iter().copied()))?;
        for dst in &dsts {
            let mut row = vec![dst.to_string()];
            row.extend(srcs.iter().map(|src| self.get(src, dst).to_string()));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Prints the pattern table the way the CLI shows it.
pub fn print_histogram(out: &mut impl Write, histogram: &Histogram) -> std::io::Result<()> {
    writeln!(out, "pattern  sm cr ph  {:>12}  {:>12}", "negatives", "positives")?;
    for (pattern, counts) in histogram.iter() {
        let bit = |d: Detector| if pattern.bit(d) { '1' } else { '0' };
        writeln!(
            out,
            "{:>7}  {:>2} {:>2} {:>2}  {:>12}  {:>12}",
            pattern.value(),
            bit(Detector::StringMinhash),
            bit(Detector::CodeRegions),
            bit(Detector::ProgramHeader),
            counts.negatives,
            counts.positives
        )?;
    }
    writeln!(
        out,
        "  total           {:>12}  {:>12}",
        histogram.total_negatives(),
        histogram.total_positives()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::histogram::Observation;
    use crate::calibrate::pattern::Pattern;
    use crate::calibrate::weights::WeightVector;
    use tempfile::tempdir;

    fn obs(pattern: u8, positive: bool) -> Observation {
        Observation {
            pattern: Pattern::new(pattern).unwrap(),
            positive,
        }
    }

    #[test]
    fn operating_point_csv_has_the_reporting_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.csv");
        let histogram = Histogram::from_entries(&[(0, 100, 0), (7, 0, 50)]);
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        let record = OperatingPointRecord::new(0.5, scores.confusion_at(&histogram, 0.5));
        write_operating_points(&path, &[record]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "threshold,tp,fp,tn,fn,tpr,fpr,precision,specificity,accuracy,f1,youdenJ,sample_pos,sample_neg"
        );
        assert_eq!(lines.next().unwrap(), "0.5,50,0,100,0,1.0,0.0,1.0,1.0,1.0,1.0,1.0,50,100");
    }

    #[test]
    fn family_rows_are_natural_ordered_and_totalled() {
        let mut groups = GroupedHistograms::new();
        groups.record("lib10", obs(7, true));
        groups.record("lib2", obs(0, false));
        groups.record("lib2", obs(7, false));
        let scores = PatternScores::from_weights(&WeightVector::uniform());

        let rows = family_records(&groups, &scores, 0.5, None);
        let names: Vec<&str> = rows.iter().map(|r| r.src_family.as_str()).collect();
        assert_eq!(names, vec!["lib2", "lib10", TOTAL_ROW]);
        let total = rows.last().unwrap();
        assert_eq!((total.tp, total.fp, total.tn, total.fn_), (1, 1, 1, 0));

        let filtered = family_records(&groups, &scores, 0.5, Some(&["LIB10".to_string(), "absent".to_string()]));
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered[1].src_family, "absent");
        assert_eq!(filtered[1].sample_pos + filtered[1].sample_neg, 0);
        assert_eq!(filtered[2].tp, 1);
        assert_eq!(filtered[2].fp, 0);
    }

    #[test]
    fn histogram_csv_lists_all_patterns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hist.csv");
        write_histogram(&path, &Histogram::from_entries(&[(5, 3, 4)])).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 9);
        assert_eq!(lines[0], "pattern,bit_string_minhash,bit_code_regions,bit_program_header,count_neg,count_pos");
        assert_eq!(lines[6], "5,1,0,1,3,4");
    }

    #[test]
    fn false_positive_tally_counts_pairs_and_unknowns() {
        let binarizer = Binarizer::for_flags();
        let scores = PatternScores::from_weights(&WeightVector::uniform());
        let fired = [Some(1.0), Some(1.0), Some(0.0)];
        let records = vec![
            ComparisonRecord::new(fired, Some(0)).with_group("ip").with_candidate_group("tar"),
            ComparisonRecord::new(fired, Some(0)).with_group("ip").with_candidate_group("tar"),
            ComparisonRecord::new(fired, Some(0)).with_group("ip"),
            ComparisonRecord::new(fired, Some(1)).with_group("ip").with_candidate_group("ip"),
            ComparisonRecord::new([Some(0.0); 3], Some(0)).with_group("uci").with_candidate_group("tar"),
            ComparisonRecord::new([None; 3], Some(0)).with_group("uci").with_candidate_group("tar"),
        ];

        let mut with_unknown = FalsePositiveTally::new();
        let mut without_unknown = FalsePositiveTally::new();
        for r in &records {
            with_unknown.observe(&binarizer, &scores, 0.5, true, r);
            without_unknown.observe(&binarizer, &scores, 0.5, false, r);
        }
        assert_eq!(with_unknown.get("ip", "tar"), 2);
        assert_eq!(with_unknown.get("ip", UNKNOWN_FAMILY), 1);
        assert_eq!(with_unknown.dropped, 1);
        assert_eq!(without_unknown.total(), 2);
        assert_eq!(without_unknown.unattributed, 1);

        let pairs = with_unknown.sorted_pairs();
        assert_eq!(pairs[0].dst_family, "tar");
        assert_eq!(pairs[1].dst_family, UNKNOWN_FAMILY);

        let merged = with_unknown.clone().merge(without_unknown);
        assert_eq!(merged.get("ip", "tar"), 4);
    }

    #[test]
    fn false_positive_matrix_pivots_candidates_by_anchor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.csv");
        let mut tally = FalsePositiveTally::new();
        tally.add("ip", "tar", 3);
        tally.add("uci", "tar", 1);
        tally.add("uci", "ubus", 2);
        tally.write_matrix(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["dst \\ src,ip,uci", "tar,3,1", "ubus,0,2"]);
    }

    #[test]
    fn printed_histogram_has_a_row_per_pattern() {
        let mut out = Vec::new();
        print_histogram(&mut out, &Histogram::from_entries(&[(1, 2, 3)])).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 10);
    }

    #[test]
    fn empty_pair_report_still_has_a_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairs.csv");
        FalsePositiveTally::new().write_pairs(&path, 0.617).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "src_family,dst_family,fp_count,threshold\n"
        );

        let mut tally = FalsePositiveTally::new();
        tally.add("ip", "tar", 2);
        tally.write_pairs(&path, 0.617).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().nth(1), Some("ip,tar,2,0.617"));
    }
}
