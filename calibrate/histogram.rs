//! # Histogram Aggregator
//!
//! Compresses an arbitrarily long stream of comparison records into an 8×2
//! table of label-conditioned pattern counts. Every record that shares a pattern
//! receives the same combined score under any additive weighting, so this table
//! is a sufficient statistic for every confusion-matrix metric downstream.
//!
//! Records that cannot be binarized, or whose label is not 0/1, are dropped and
//! tallied by reason. Dropping never aborts a scan.
//!
//! Partial aggregations are merged by elementwise addition, which makes the
//! parallel path a plain fold/reduce over batches.

use crate::calibrate::pattern::{
    Binarizer, Detector, DropReason, NUM_DETECTORS, NUM_PATTERNS, Pattern,
};
use ahash::RandomState;
use natord::compare;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Add, AddAssign};

/// One (anchor, candidate) comparison as delivered by the input layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComparisonRecord {
    pub anchor: String,
    pub candidate: String,
    /// The anchor's family; the key used for per-group histograms.
    pub group: Option<String>,
    /// The candidate's family, used by false-positive pair analysis.
    pub candidate_group: Option<String>,
    /// Raw detector values in canonical bit order.
    pub scores: [Option<f64>; NUM_DETECTORS],
    /// 1 if anchor and candidate share a family, 0 otherwise.
    pub label: Option<u8>,
}

impl ComparisonRecord {
    pub fn new(scores: [Option<f64>; NUM_DETECTORS], label: Option<u8>) -> Self {
        Self {
            scores,
            label,
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_candidate_group(mut self, group: impl Into<String>) -> Self {
        self.candidate_group = Some(group.into());
        self
    }

    pub fn score(&self, detector: Detector) -> Option<f64> {
        self.scores[detector.bit()]
    }
}

/// The kept form of a record: its pattern and whether it is a same-family pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub pattern: Pattern,
    pub positive: bool,
}

/// Binarizes and encodes one record, or explains why it must be dropped.
pub fn classify(binarizer: &Binarizer, record: &ComparisonRecord) -> Result<Observation, DropReason> {
    let flags = binarizer.flags(&record.scores)?;
    let positive = match record.label {
        Some(0) => false,
        Some(1) => true,
        _ => return Err(DropReason::InvalidLabel),
    };
    Ok(Observation {
        pattern: Pattern::encode(flags),
        positive,
    })
}

/// Counts for a single pattern, split by label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternCounts {
    pub negatives: u64,
    pub positives: u64,
}

impl PatternCounts {
    pub fn total(&self) -> u64 {
        self.negatives + self.positives
    }
}

/// The 8×2 sufficient-statistic table. Row = pattern, column = label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    counts: [[u64; 2]; NUM_PATTERNS],
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(counts: [[u64; 2]; NUM_PATTERNS]) -> Self {
        Self { counts }
    }

    /// Convenience constructor from `(pattern, negatives, positives)` triples.
    /// Patterns outside `[0, 8)` are ignored.
    pub fn from_entries(entries: &[(u8, u64, u64)]) -> Self {
        let mut histogram = Self::new();
        for &(value, negatives, positives) in entries {
            if let Some(pattern) = Pattern::new(value) {
                Histogram::add(&mut histogram, pattern, false, negatives);
                Histogram::add(&mut histogram, pattern, true, positives);
            }
        }
        histogram
    }

    /// Adds `n` observations of `pattern`; column 1 holds the positives.
    pub fn add(&mut self, pattern: Pattern, positive: bool, n: u64) {
        self.counts[pattern.index()][usize::from(positive)] += n;
    }

    pub fn record(&mut self, observation: Observation) {
        self.add(observation.pattern, observation.positive, 1);
    }

    pub fn counts(&self, pattern: Pattern) -> PatternCounts {
        let [negatives, positives] = self.counts[pattern.index()];
        PatternCounts {
            negatives,
            positives,
        }
    }

    pub fn table(&self) -> [[u64; 2]; NUM_PATTERNS] {
        self.counts
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pattern, PatternCounts)> + '_ {
        Pattern::ALL.into_iter().map(move |p| (p, self.counts(p)))
    }

    pub fn total_negatives(&self) -> u64 {
        self.counts.iter().map(|row| row[0]).sum()
    }

    pub fn total_positives(&self) -> u64 {
        self.counts.iter().map(|row| row[1]).sum()
    }

    pub fn total(&self) -> u64 {
        self.total_negatives() + self.total_positives()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Number of patterns with at least one observation.
    pub fn patterns_present(&self) -> usize {
        self.counts.iter().filter(|row| row[0] + row[1] > 0).count()
    }
}

impl AddAssign<&Histogram> for Histogram {
    fn add_assign(&mut self, other: &Histogram) {
        for (row, other_row) in self.counts.iter_mut().zip(other.counts.iter()) {
            row[0] += other_row[0];
            row[1] += other_row[1];
        }
    }
}

impl AddAssign for Histogram {
    fn add_assign(&mut self, other: Histogram) {
        *self += &other;
    }
}

impl Add for Histogram {
    type Output = Histogram;

    fn add(mut self, other: Histogram) -> Histogram {
        self += &other;
        self
    }
}

/// Histograms keyed by group (the anchor's family).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedHistograms {
    groups: HashMap<String, Histogram, RandomState>,
}

impl GroupedHistograms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, group: &str, observation: Observation) {
        match self.groups.get_mut(group) {
            Some(histogram) => histogram.record(observation),
            None => {
                let mut histogram = Histogram::new();
                histogram.record(observation);
                self.groups.insert(group.to_string(), histogram);
            }
        }
    }

    pub fn insert(&mut self, group: impl Into<String>, histogram: Histogram) {
        *self.groups.entry(group.into()).or_default() += &histogram;
    }

    pub fn get(&self, group: &str) -> Option<&Histogram> {
        self.groups.get(group)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Groups in natural order of their names (`lib2` before `lib10`).
    pub fn sorted(&self) -> Vec<(&str, &Histogram)> {
        let mut entries: Vec<(&str, &Histogram)> =
            self.groups.iter().map(|(k, v)| (k.as_str(), v)).collect();
        entries.sort_by(|a, b| compare(a.0, b.0));
        entries
    }

    /// Sum over all groups.
    pub fn total(&self) -> Histogram {
        self.groups.values().fold(Histogram::new(), |mut acc, h| {
            acc += h;
            acc
        })
    }

    pub fn merge(&mut self, other: GroupedHistograms) {
        for (group, histogram) in other.groups {
            self.insert(group, histogram);
        }
    }
}

/// Dropped-record counts, one slot per reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropTally {
    pub missing_score: [u64; NUM_DETECTORS],
    pub non_finite_score: [u64; NUM_DETECTORS],
    pub invalid_label: u64,
}

impl DropTally {
    pub fn count(&mut self, reason: DropReason) {
        match reason {
            DropReason::MissingScore(d) => self.missing_score[d.bit()] += 1,
            DropReason::NonFiniteScore(d) => self.non_finite_score[d.bit()] += 1,
            DropReason::InvalidLabel => self.invalid_label += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.missing_score.iter().sum::<u64>()
            + self.non_finite_score.iter().sum::<u64>()
            + self.invalid_label
    }

    pub fn merge(&mut self, other: &DropTally) {
        for i in 0..NUM_DETECTORS {
            self.missing_score[i] += other.missing_score[i];
            self.non_finite_score[i] += other.non_finite_score[i];
        }
        self.invalid_label += other.invalid_label;
    }
}

/// The result of a scan: the global histogram, the optional per-group
/// histograms and the seen/kept/dropped bookkeeping.
///
/// Invariants: `seen == kept + drops.total()` and `histogram.total() == kept`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub histogram: Histogram,
    pub groups: Option<GroupedHistograms>,
    pub seen: u64,
    pub kept: u64,
    pub drops: DropTally,
}

impl Aggregation {
    pub fn new(by_group: bool) -> Self {
        Self {
            groups: by_group.then(GroupedHistograms::new),
            ..Self::default()
        }
    }

    /// Combines two partial aggregations. Commutative and associative.
    pub fn merge(mut self, other: Aggregation) -> Aggregation {
        self.histogram += &other.histogram;
        self.seen += other.seen;
        self.kept += other.kept;
        self.drops.merge(&other.drops);
        self.groups = match (self.groups, other.groups) {
            (Some(mut a), Some(b)) => {
                a.merge(b);
                Some(a)
            }
            (a, b) => a.or(b),
        };
        self
    }
}

/// Exclusive owner of an [`Aggregation`] while records are being consumed.
#[derive(Debug, Clone)]
pub struct Aggregator {
    binarizer: Binarizer,
    state: Aggregation,
}

impl Aggregator {
    pub fn new(binarizer: Binarizer, by_group: bool) -> Self {
        Self {
            binarizer,
            state: Aggregation::new(by_group),
        }
    }

    /// Consumes one record. The outcome is returned for callers that want to
    /// inspect it; the tally is updated either way.
    pub fn observe(&mut self, record: &ComparisonRecord) -> Result<Observation, DropReason> {
        self.state.seen += 1;
        match classify(&self.binarizer, record) {
            Ok(observation) => {
                self.state.kept += 1;
                self.state.histogram.record(observation);
                if let (Some(groups), Some(group)) = (self.state.groups.as_mut(), &record.group) {
                    groups.record(group, observation);
                }
                Ok(observation)
            }
            Err(reason) => {
                self.state.drops.count(reason);
                Err(reason)
            }
        }
    }

    pub fn observe_all<'a, I>(&mut self, records: I)
    where
        I: IntoIterator<Item = &'a ComparisonRecord>,
    {
        for record in records {
            // Drops are already tallied inside `observe`.
            let _ = self.observe(record);
        }
    }

    pub fn seen(&self) -> u64 {
        self.state.seen
    }

    pub fn finish(self) -> Aggregation {
        self.state
    }
}

/// Sequential aggregation over any record stream.
pub fn aggregate<I>(binarizer: Binarizer, records: I, by_group: bool) -> Aggregation
where
    I: IntoIterator<Item = ComparisonRecord>,
{
    let mut aggregator = Aggregator::new(binarizer, by_group);
    for record in records {
        let _ = aggregator.observe(&record);
    }
    aggregator.finish()
}

/// Parallel aggregation over a stream of record batches.
///
/// Each Rayon worker folds batches into its own [`Aggregation`]; the partial
/// results are then reduced by addition. The first batch error aborts the scan
/// and is returned.
pub fn aggregate_parallel<I, E>(binarizer: Binarizer, batches: I, by_group: bool) -> Result<Aggregation, E>
where
    I: Iterator<Item = Result<Vec<ComparisonRecord>, E>> + Send,
    E: Send,
{
    batches
        .par_bridge()
        .try_fold(
            || Aggregator::new(binarizer, by_group),
            |mut aggregator, batch| {
                let batch = batch?;
                aggregator.observe_all(&batch);
                Ok::<_, E>(aggregator)
            },
        )
        .map(|partial| partial.map(Aggregator::finish))
        .try_reduce(
            || Aggregation::new(by_group),
            |a, b| Ok(a.merge(b)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sm: f64, cr: f64, ph: f64, label: u8, group: &str) -> ComparisonRecord {
        ComparisonRecord::new([Some(sm), Some(cr), Some(ph)], Some(label)).with_group(group)
    }

    #[test]
    fn aggregation_counts_patterns_per_label() {
        let records = vec![
            record(0.9, 0.9, 0.9, 1, "busybox"),
            record(0.9, 0.9, 0.9, 1, "busybox"),
            record(0.0, 0.0, 0.0, 0, "busybox"),
            record(0.9, 0.0, 0.0, 0, "openssl"),
        ];
        let agg = aggregate(Binarizer::default(), records, true);

        assert_eq!(agg.seen, 4);
        assert_eq!(agg.kept, 4);
        assert_eq!(agg.histogram.counts(Pattern::new(7).unwrap()).positives, 2);
        assert_eq!(agg.histogram.counts(Pattern::new(0).unwrap()).negatives, 1);
        assert_eq!(agg.histogram.counts(Pattern::new(1).unwrap()).negatives, 1);

        let groups = agg.groups.expect("group histograms requested");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.get("busybox").unwrap().total(), 3);
        assert_eq!(groups.total(), agg.histogram);
    }

    #[test]
    fn malformed_records_are_dropped_and_tallied() {
        let records = vec![
            ComparisonRecord::new([None, Some(0.5), Some(0.5)], Some(1)),
            ComparisonRecord::new([Some(0.5), Some(f64::NAN), Some(0.5)], Some(0)),
            ComparisonRecord::new([Some(0.5), Some(0.5), Some(0.5)], Some(2)),
            ComparisonRecord::new([Some(0.5), Some(0.5), Some(0.5)], None),
            ComparisonRecord::new([Some(0.5), Some(0.5), Some(0.5)], Some(1)),
        ];
        let agg = aggregate(Binarizer::default(), records, false);

        assert_eq!(agg.seen, 5);
        assert_eq!(agg.kept, 1);
        assert_eq!(agg.drops.missing_score[Detector::StringMinhash.bit()], 1);
        assert_eq!(agg.drops.non_finite_score[Detector::CodeRegions.bit()], 1);
        assert_eq!(agg.drops.invalid_label, 2);
        assert_eq!(agg.seen, agg.kept + agg.drops.total());
        assert_eq!(agg.histogram.total(), agg.kept);
        assert!(agg.groups.is_none());
    }

    #[test]
    fn label_flag_selects_the_column() {
        let pattern = Pattern::new(6).unwrap();
        let mut histogram = Histogram::new();
        Histogram::add(&mut histogram, pattern, true, 4);
        Histogram::add(&mut histogram, pattern, false, 1);
        assert_eq!(histogram.counts(pattern), PatternCounts { negatives: 1, positives: 4 });

        let binarizer = Binarizer::default();
        let positive = classify(&binarizer, &record(0.0, 0.9, 0.9, 1, "ip")).unwrap();
        let negative = classify(&binarizer, &record(0.0, 0.9, 0.9, 0, "ip")).unwrap();
        assert!(positive.positive);
        assert!(!negative.positive);
        assert_eq!(
            classify(&binarizer, &record(0.0, 0.9, 0.9, 7, "ip")),
            Err(DropReason::InvalidLabel)
        );
    }

    #[test]
    fn records_without_group_only_reach_the_global_histogram() {
        let records = vec![
            ComparisonRecord::new([Some(0.9), Some(0.9), Some(0.9)], Some(1)),
            record(0.9, 0.9, 0.9, 1, "uci"),
        ];
        let agg = aggregate(Binarizer::default(), records, true);
        assert_eq!(agg.histogram.total(), 2);
        assert_eq!(agg.groups.unwrap().total().total(), 1);
    }

    #[test]
    fn parallel_aggregation_matches_sequential() {
        let records: Vec<ComparisonRecord> = (0..1000)
            .map(|i| {
                let v = (i % 17) as f64 / 17.0;
                let w = (i % 5) as f64 / 5.0;
                let label = (i % 3 == 0) as u8;
                record(v, w, 1.0 - v, label, if i % 2 == 0 { "ip" } else { "pppd" })
            })
            .collect();

        let sequential = aggregate(Binarizer::default(), records.clone(), true);
        let batches = records
            .chunks(64)
            .map(|chunk| Ok::<_, std::convert::Infallible>(chunk.to_vec()))
            .collect::<Vec<_>>();
        let parallel =
            aggregate_parallel(Binarizer::default(), batches.into_iter(), true).unwrap();

        assert_eq!(parallel.histogram, sequential.histogram);
        assert_eq!(parallel.seen, sequential.seen);
        assert_eq!(parallel.kept, sequential.kept);
        assert_eq!(parallel.groups, sequential.groups);
    }

    #[test]
    fn parallel_aggregation_propagates_batch_errors() {
        let batches = vec![Ok(vec![record(0.9, 0.9, 0.9, 1, "ip")]), Err("disk gone")];
        let result = aggregate_parallel(Binarizer::default(), batches.into_iter(), false);
        assert_eq!(result.unwrap_err(), "disk gone");
    }

    #[test]
    fn grouped_histograms_sort_naturally() {
        let mut groups = GroupedHistograms::new();
        let obs = Observation {
            pattern: Pattern::new(3).unwrap(),
            positive: true,
        };
        for name in ["lib10", "lib2", "busybox"] {
            groups.record(name, obs);
        }
        let names: Vec<&str> = groups.sorted().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["busybox", "lib2", "lib10"]);
    }

    #[test]
    fn histogram_addition_is_elementwise() {
        let a = Histogram::from_entries(&[(0, 3, 1), (5, 0, 2)]);
        let b = Histogram::from_entries(&[(0, 1, 0), (7, 4, 4)]);
        let sum = a + b;
        assert_eq!(sum.counts(Pattern::new(0).unwrap()), PatternCounts { negatives: 4, positives: 1 });
        assert_eq!(sum.counts(Pattern::new(7).unwrap()).total(), 8);
        assert_eq!(sum.total(), a.total() + b.total());
        assert_eq!(sum.patterns_present(), 3);
    }
}
