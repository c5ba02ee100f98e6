//! # Comparison Record Input
//!
//! This module is the only place that touches user-provided comparison data.
//! Two layouts are understood:
//!
//! - Tabular exports (TSV by default, CSV when the file name says so, either
//!   optionally gzip-compressed). One row per comparison, one column per
//!   detector, plus a label or family columns from which the label is derived.
//! - A directory of JSON comparison exports, each file an array of objects with
//!   `fileName`, `secondFileName` and a `comparisonDetails` map keyed by
//!   detector name.
//!
//! Structural problems (missing file, missing required column, broken CSV
//! framing) are errors. Problems with individual values are not: unparseable
//! numbers become missing values and the aggregator drops the record.
//!
//! Records are produced lazily and grouped into bounded batches, so memory use
//! does not depend on the size of the input.

use crate::calibrate::config::{CalibrationConfig, ScoreSource};
use crate::calibrate::histogram::ComparisonRecord;
use crate::calibrate::pattern::{Detector, NUM_DETECTORS};
use ahash::RandomState;
use flate2::read::MultiGzDecoder;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::vec;
use thiserror::Error;

/// Separator between the family name and the rest of a file name.
pub const FAMILY_SEPARATOR: &str = "___";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error while reading '{path}': {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Error from the CSV reader: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The input file has no label column '{label}' and no family or file-name columns to derive it from."
    )]
    NoLabelSource { label: String },
    #[error("No JSON comparison exports were found in '{0}'.")]
    NoInputFiles(PathBuf),
    #[error("The families file '{path}' is malformed: {source}")]
    FamiliesFile {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DataError + '_ {
    move |source| DataError::IoError {
        path: path.to_path_buf(),
        source,
    }
}

/// The family encoded in a file name: the lower-cased prefix before the first
/// `___`. Empty when the separator is missing or leads the name.
pub fn family_from_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    match name.split_once(FAMILY_SEPARATOR) {
        Some((family, _)) if !family.is_empty() => family.to_string(),
        _ => String::new(),
    }
}

/// `1` when both families are known and equal, `0` otherwise.
pub fn same_family_label(a: &str, b: &str) -> u8 {
    (!a.is_empty() && !b.is_empty() && a == b) as u8
}

/// Explicit file-name to family assignments that override name inference.
#[derive(Debug, Clone, Default)]
pub struct FamilyMap {
    families: HashMap<String, String, RandomState>,
}

#[derive(Debug, Deserialize)]
struct FamilyRow {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    family: String,
}

impl FamilyMap {
    /// Reads a `filename,family` CSV. Rows with an empty file name are ignored.
    pub fn load(path: &Path) -> Result<Self, DataError> {
        let file = File::open(path).map_err(io_error(path))?;
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
        let mut families = HashMap::default();
        for row in reader.deserialize::<FamilyRow>() {
            let row = row.map_err(|source| DataError::FamiliesFile {
                path: path.to_path_buf(),
                source,
            })?;
            let filename = row.filename.trim();
            if !filename.is_empty() {
                families.insert(filename.to_string(), row.family.trim().to_lowercase());
            }
        }
        log::info!("Loaded {} family assignments from {}", families.len(), path.display());
        Ok(Self { families })
    }

    pub fn insert(&mut self, filename: impl Into<String>, family: impl Into<String>) {
        self.families.insert(filename.into(), family.into());
    }

    /// The override for `name` if one exists, else the family inferred from it.
    pub fn family_of(&self, name: &str) -> String {
        match self.families.get(name) {
            Some(family) => family.clone(),
            None => family_from_name(name),
        }
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

/// Lenient numeric field parsing: empty, `NaN`, `null` and garbage are missing.
pub fn parse_score(field: Option<&str>) -> Option<f64> {
    let field = field?.trim();
    match field.parse::<f64>() {
        Ok(v) if v.is_nan() => None,
        Ok(v) => Some(v),
        Err(_) => None,
    }
}

/// `1`/`0` in integer, float or boolean spelling. Anything else is invalid.
pub fn parse_label(field: Option<&str>) -> Option<u8> {
    match field?.trim().to_ascii_lowercase().as_str() {
        "1" | "1.0" | "true" => Some(1),
        "0" | "0.0" | "false" => Some(0),
        _ => None,
    }
}

/// Column settings shared by both input layouts.
#[derive(Debug, Clone)]
pub struct InputSettings {
    pub score_source: ScoreSource,
    /// Column per detector, canonical bit order.
    pub detector_columns: [String; NUM_DETECTORS],
    pub label_column: String,
    pub group_column: String,
    pub candidate_group_column: String,
    pub anchor_column: String,
    pub candidate_column: String,
    pub drop_self_matches: bool,
    pub batch_rows: usize,
}

impl InputSettings {
    pub fn from_config(config: &CalibrationConfig) -> Self {
        let input = &config.input;
        Self {
            score_source: input.score_source,
            detector_columns: config.input_columns(),
            label_column: input.label_column.clone(),
            group_column: input.group_column.clone(),
            candidate_group_column: input.candidate_group_column.clone(),
            anchor_column: input.anchor_column.clone(),
            candidate_column: input.candidate_column.clone(),
            drop_self_matches: input.drop_self_matches,
            batch_rows: input.batch_rows.max(1),
        }
    }
}

impl Default for InputSettings {
    fn default() -> Self {
        Self::from_config(&CalibrationConfig::default())
    }
}

/// Where the label of a tabular row comes from.
#[derive(Debug, Clone, Copy)]
enum LabelSource {
    Column(usize),
    FamilyColumns { src: usize, dst: usize },
    FileNames { anchor: usize, candidate: usize },
}

#[derive(Debug, Clone)]
struct ColumnLayout {
    detectors: [usize; NUM_DETECTORS],
    label: LabelSource,
    group: Option<usize>,
    candidate_group: Option<usize>,
    anchor: Option<usize>,
    candidate: Option<usize>,
}

impl ColumnLayout {
    fn resolve(headers: &csv::StringRecord, settings: &InputSettings) -> Result<Self, DataError> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);

        let mut detectors = [0usize; NUM_DETECTORS];
        for (slot, column) in detectors.iter_mut().zip(settings.detector_columns.iter()) {
            *slot = find(column).ok_or_else(|| DataError::ColumnNotFound(column.clone()))?;
        }

        let group = find(&settings.group_column);
        let candidate_group = find(&settings.candidate_group_column);
        let anchor = find(&settings.anchor_column);
        let candidate = find(&settings.candidate_column);

        let label = match (find(&settings.label_column), group, candidate_group, anchor, candidate) {
            (Some(idx), ..) => LabelSource::Column(idx),
            (None, Some(src), Some(dst), ..) => LabelSource::FamilyColumns { src, dst },
            (None, _, _, Some(anchor), Some(candidate)) => LabelSource::FileNames { anchor, candidate },
            _ => {
                return Err(DataError::NoLabelSource {
                    label: settings.label_column.clone(),
                });
            }
        };

        Ok(Self {
            detectors,
            label,
            group,
            candidate_group,
            anchor,
            candidate,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn is_csv(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.ends_with(".csv") || name.ends_with(".csv.gz")
}

/// Streaming reader over a delimited comparison table.
pub struct TableReader {
    rows: csv::StringRecordsIntoIter<Box<dyn Read + Send>>,
    layout: ColumnLayout,
    families: FamilyMap,
}

impl TableReader {
    pub fn open(path: &Path, settings: &InputSettings, families: FamilyMap) -> Result<Self, DataError> {
        let file = File::open(path).map_err(io_error(path))?;
        let source: Box<dyn Read + Send> = if path.extension().is_some_and(|ext| ext == "gz") {
            Box::new(MultiGzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Self::from_reader(source, if is_csv(path) { b',' } else { b'\t' }, settings, families)
    }

    pub fn from_reader(
        source: Box<dyn Read + Send>,
        delimiter: u8,
        settings: &InputSettings,
        families: FamilyMap,
    ) -> Result<Self, DataError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .has_headers(true)
            .from_reader(source);
        let headers = reader.headers()?.clone();
        let layout = ColumnLayout::resolve(&headers, settings)?;
        Ok(Self {
            rows: reader.into_records(),
            layout,
            families,
        })
    }

    fn record(&self, row: &csv::StringRecord) -> ComparisonRecord {
        let layout = &self.layout;
        let field = |idx: Option<usize>| idx.and_then(|i| row.get(i));

        let anchor = field(layout.anchor).map(str::trim).unwrap_or_default().to_string();
        let candidate = field(layout.candidate).map(str::trim).unwrap_or_default().to_string();
        let group = non_empty(field(layout.group))
            .or_else(|| layout.anchor.map(|_| self.families.family_of(&anchor)))
            .filter(|g| !g.is_empty());
        let candidate_group = non_empty(field(layout.candidate_group))
            .or_else(|| layout.candidate.map(|_| self.families.family_of(&candidate)))
            .filter(|g| !g.is_empty());

        let label = match layout.label {
            LabelSource::Column(idx) => parse_label(row.get(idx)),
            LabelSource::FamilyColumns { src, dst } => Some(same_family_label(
                row.get(src).map(str::trim).unwrap_or_default(),
                row.get(dst).map(str::trim).unwrap_or_default(),
            )),
            LabelSource::FileNames { anchor, candidate } => {
                let name = |i: usize| row.get(i).map(str::trim).unwrap_or_default();
                Some(same_family_label(
                    &self.families.family_of(name(anchor)),
                    &self.families.family_of(name(candidate)),
                ))
            }
        };

        ComparisonRecord {
            anchor,
            candidate,
            group,
            candidate_group,
            scores: layout.detectors.map(|i| parse_score(row.get(i))),
            label,
        }
    }
}

impl Iterator for TableReader {
    type Item = Result<ComparisonRecord, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.next()?;
        Some(row.map(|row| self.record(&row)).map_err(DataError::from))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonComparison {
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    second_file_name: Option<String>,
    #[serde(default)]
    comparison_details: Option<HashMap<String, Value>>,
    #[serde(default)]
    binary: Option<HashMap<String, Value>>,
}

fn json_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_score(Some(s.as_str())),
        Value::Bool(b) => Some(*b as u8 as f64),
        _ => None,
    }
}

/// Reader over a directory of JSON comparison exports.
///
/// The second file of each comparison is the anchor, the first the candidate.
/// Files that cannot be opened or parsed are skipped with a warning.
pub struct JsonExportReader {
    files: vec::IntoIter<PathBuf>,
    current: vec::IntoIter<ComparisonRecord>,
    score_source: ScoreSource,
    families: FamilyMap,
    skipped_files: usize,
}

impl JsonExportReader {
    pub fn open(dir: &Path, settings: &InputSettings, families: FamilyMap) -> Result<Self, DataError> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(io_error(dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        if files.is_empty() {
            return Err(DataError::NoInputFiles(dir.to_path_buf()));
        }
        files.sort();
        log::info!("Found {} JSON comparison exports in {}", files.len(), dir.display());
        Ok(Self {
            files: files.into_iter(),
            current: Vec::new().into_iter(),
            score_source: settings.score_source,
            families,
            skipped_files: 0,
        })
    }

    pub fn skipped_files(&self) -> usize {
        self.skipped_files
    }

    fn load(&self, path: &Path) -> Result<Vec<ComparisonRecord>, String> {
        let file = File::open(path).map_err(|e| e.to_string())?;
        let entries: Vec<JsonComparison> =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| e.to_string())?;
        Ok(entries.into_iter().map(|e| self.record(e)).collect())
    }

    fn record(&self, entry: JsonComparison) -> ComparisonRecord {
        let anchor = entry.second_file_name.unwrap_or_default();
        let candidate = entry.file_name.unwrap_or_default();
        let src = self.families.family_of(&anchor);
        let dst = self.families.family_of(&candidate);

        let mut scores = [None; NUM_DETECTORS];
        match self.score_source {
            ScoreSource::Raw => {
                for (name, value) in entry.comparison_details.iter().flatten() {
                    if let Some(detector) = Detector::from_name(name) {
                        scores[detector.bit()] = json_number(Some(value));
                    }
                }
            }
            ScoreSource::Flags => {
                if let Some(flags) = &entry.binary {
                    for detector in Detector::ALL {
                        scores[detector.bit()] = json_number(flags.get(detector.flag_column()));
                    }
                }
            }
        }

        ComparisonRecord {
            label: Some(same_family_label(&src, &dst)),
            group: Some(src).filter(|f| !f.is_empty()),
            candidate_group: Some(dst).filter(|f| !f.is_empty()),
            anchor,
            candidate,
            scores,
        }
    }
}

impl Iterator for JsonExportReader {
    type Item = Result<ComparisonRecord, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            let path = self.files.next()?;
            match self.load(&path) {
                Ok(records) => self.current = records.into_iter(),
                Err(reason) => {
                    self.skipped_files += 1;
                    log::warn!("Skipping unreadable export {}: {reason}", path.display());
                }
            }
        }
    }
}

enum Reader {
    Table(TableReader),
    Json(JsonExportReader),
}

/// A lazy stream of comparison records from a file or an export directory.
pub struct RecordSource {
    reader: Reader,
    drop_self_matches: bool,
    self_matches: u64,
}

impl RecordSource {
    pub fn self_matches(&self) -> u64 {
        self.self_matches
    }

    pub fn skipped_files(&self) -> usize {
        match &self.reader {
            Reader::Table(_) => 0,
            Reader::Json(json) => json.skipped_files(),
        }
    }

    pub fn batches(self, batch_rows: usize) -> RecordBatches<Self> {
        RecordBatches::new(self, batch_rows)
    }
}

impl Iterator for RecordSource {
    type Item = Result<ComparisonRecord, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = match &mut self.reader {
                Reader::Table(table) => table.next()?,
                Reader::Json(json) => json.next()?,
            };
            if let Ok(record) = &item {
                if self.drop_self_matches
                    && !record.anchor.is_empty()
                    && record.anchor.to_lowercase() == record.candidate.to_lowercase()
                {
                    self.self_matches += 1;
                    continue;
                }
            }
            return Some(item);
        }
    }
}

/// Opens `path` as an export directory or a comparison table.
pub fn open_records(
    path: &Path,
    settings: &InputSettings,
    families: Option<FamilyMap>,
) -> Result<RecordSource, DataError> {
    let families = families.unwrap_or_default();
    let reader = if path.is_dir() {
        Reader::Json(JsonExportReader::open(path, settings, families)?)
    } else {
        Reader::Table(TableReader::open(path, settings, families)?)
    };
    Ok(RecordSource {
        reader,
        drop_self_matches: settings.drop_self_matches,
        self_matches: 0,
    })
}

/// Groups a record stream into batches of at most `batch_rows` records.
pub struct RecordBatches<I> {
    inner: I,
    batch_rows: usize,
}

impl<I> RecordBatches<I> {
    pub fn new(inner: I, batch_rows: usize) -> Self {
        Self {
            inner,
            batch_rows: batch_rows.max(1),
        }
    }
}

impl<I> Iterator for RecordBatches<I>
where
    I: Iterator<Item = Result<ComparisonRecord, DataError>>,
{
    type Item = Result<Vec<ComparisonRecord>, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_rows.min(65_536));
        while batch.len() < self.batch_rows {
            match self.inner.next() {
                Some(Ok(record)) => batch.push(record),
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        (!batch.is_empty()).then_some(Ok(batch))
    }
}
