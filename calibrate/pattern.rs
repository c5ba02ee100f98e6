//! # Detectors, Binarizer and Pattern Encoder
//!
//! Every comparison record carries one raw similarity value per detector. The
//! binarizer turns each value into a single flag using a fixed, per-detector
//! threshold (tau), and the encoder packs the three flags into a 3-bit pattern.
//!
//! The bit order is fixed once, here, and every other module goes through
//! [`Detector::bit`] rather than hard-coding positions:
//!
//! | bit | detector                |
//! |-----|-------------------------|
//! | 0   | `STRING_MINHASH`        |
//! | 1   | `CODE_REGION_LIST`      |
//! | 2   | `PROGRAM_HEADER_VECTOR` |
//!
//! so `pattern = (ph << 2) | (cr << 1) | sm`. Sources that list the detectors in
//! another order must be converted by name with [`Detector::from_name`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of binary sub-detectors feeding the combined score.
pub const NUM_DETECTORS: usize = 3;

/// Number of distinct flag patterns (`2^NUM_DETECTORS`).
pub const NUM_PATTERNS: usize = 1 << NUM_DETECTORS;

/// One of the three binary-similarity sub-detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Detector {
    /// MinHash similarity over the printable strings of both files.
    #[serde(rename = "STRING_MINHASH")]
    StringMinhash,
    /// Alignment similarity of the detected code regions.
    #[serde(rename = "CODE_REGION_LIST")]
    CodeRegions,
    /// Vector similarity of the ELF program headers.
    #[serde(rename = "PROGRAM_HEADER_VECTOR")]
    ProgramHeader,
}

impl Detector {
    /// All detectors in canonical bit order.
    pub const ALL: [Detector; NUM_DETECTORS] = [
        Detector::StringMinhash,
        Detector::CodeRegions,
        Detector::ProgramHeader,
    ];

    /// Bit position of this detector inside a [`Pattern`].
    pub const fn bit(self) -> usize {
        match self {
            Detector::StringMinhash => 0,
            Detector::CodeRegions => 1,
            Detector::ProgramHeader => 2,
        }
    }

    /// The canonical upper-case name used in exports and model files.
    pub const fn name(self) -> &'static str {
        match self {
            Detector::StringMinhash => "STRING_MINHASH",
            Detector::CodeRegions => "CODE_REGION_LIST",
            Detector::ProgramHeader => "PROGRAM_HEADER_VECTOR",
        }
    }

    /// Resolves a detector from its canonical name or a short alias
    /// (`sm`, `cr`, `ph`). Matching is case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "STRING_MINHASH" | "SM" => Some(Detector::StringMinhash),
            "CODE_REGION_LIST" | "CODE_REGIONS" | "CR" => Some(Detector::CodeRegions),
            "PROGRAM_HEADER_VECTOR" | "PROGRAM_HEADER" | "PH" => Some(Detector::ProgramHeader),
            _ => None,
        }
    }

    /// Column holding the raw similarity value in preprocessed tables.
    pub const fn score_column(self) -> &'static str {
        match self {
            Detector::StringMinhash => "rep_string_minhash",
            Detector::CodeRegions => "rep_code_regions",
            Detector::ProgramHeader => "rep_program_header",
        }
    }

    /// Column holding the already-binarized flag in preprocessed tables.
    pub const fn flag_column(self) -> &'static str {
        match self {
            Detector::StringMinhash => "bin_string_minhash",
            Detector::CodeRegions => "bin_code_regions",
            Detector::ProgramHeader => "bin_program_header",
        }
    }

    /// Offline-calibrated tau used when no configuration overrides it.
    pub const fn default_tau(self) -> f64 {
        match self {
            Detector::StringMinhash => 0.146484375,
            Detector::CodeRegions => 0.3988839387893677,
            Detector::ProgramHeader => 0.8291192054748535,
        }
    }
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a record was excluded from aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The detector value was absent.
    MissingScore(Detector),
    /// The detector value was NaN or infinite.
    NonFiniteScore(Detector),
    /// The label was absent or not in {0, 1}.
    InvalidLabel,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::MissingScore(d) => write!(f, "missing {d} value"),
            DropReason::NonFiniteScore(d) => write!(f, "non-finite {d} value"),
            DropReason::InvalidLabel => f.write_str("invalid label"),
        }
    }
}

/// Maps a raw value to a flag. `None` means the value cannot be binarized
/// (missing or not finite) and the record has to be dropped.
pub fn binarize(value: Option<f64>, tau: f64) -> Option<bool> {
    match value {
        Some(v) if v.is_finite() => Some(v >= tau),
        _ => None,
    }
}

/// Per-detector binarizer. Thresholds are fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Binarizer {
    taus: [f64; NUM_DETECTORS],
}

impl Binarizer {
    /// Tau used for columns that already hold 0/1 flags.
    pub const FLAG_TAU: f64 = 0.5;

    /// Creates a binarizer from taus listed in canonical bit order.
    pub fn new(taus: [f64; NUM_DETECTORS]) -> Self {
        Self { taus }
    }

    /// A binarizer for inputs that are already 0/1 flags.
    pub fn for_flags() -> Self {
        Self::new([Self::FLAG_TAU; NUM_DETECTORS])
    }

    pub fn tau(&self, detector: Detector) -> f64 {
        self.taus[detector.bit()]
    }

    pub fn taus(&self) -> [f64; NUM_DETECTORS] {
        self.taus
    }

    /// Binarizes all three detector values, reporting the first detector that
    /// could not be binarized.
    pub fn flags(&self, scores: &[Option<f64>; NUM_DETECTORS]) -> Result<FlagTriple, DropReason> {
        let mut bits = [false; NUM_DETECTORS];
        for detector in Detector::ALL {
            let i = detector.bit();
            bits[i] = match scores[i] {
                None => return Err(DropReason::MissingScore(detector)),
                Some(v) if !v.is_finite() => return Err(DropReason::NonFiniteScore(detector)),
                Some(v) => v >= self.taus[i],
            };
        }
        Ok(FlagTriple(bits))
    }
}

impl Default for Binarizer {
    fn default() -> Self {
        Self::new(Detector::ALL.map(Detector::default_tau))
    }
}

/// Three binarized detector outcomes, indexed by [`Detector::bit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlagTriple([bool; NUM_DETECTORS]);

impl FlagTriple {
    pub fn new(string_minhash: bool, code_regions: bool, program_header: bool) -> Self {
        Self([string_minhash, code_regions, program_header])
    }

    pub fn get(&self, detector: Detector) -> bool {
        self.0[detector.bit()]
    }

    pub fn as_array(&self) -> [bool; NUM_DETECTORS] {
        self.0
    }
}

/// A 3-bit pattern in `[0, 8)`. Construction is only possible through
/// [`Pattern::new`] or the encoder, so out-of-range values cannot exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Pattern(u8);

impl Pattern {
    /// All eight patterns in ascending order.
    pub const ALL: [Pattern; NUM_PATTERNS] = [
        Pattern(0),
        Pattern(1),
        Pattern(2),
        Pattern(3),
        Pattern(4),
        Pattern(5),
        Pattern(6),
        Pattern(7),
    ];

    pub fn new(value: u8) -> Option<Self> {
        ((value as usize) < NUM_PATTERNS).then_some(Pattern(value))
    }

    pub fn encode(flags: FlagTriple) -> Self {
        let [b0, b1, b2] = flags.as_array();
        Pattern(((b2 as u8) << 2) | ((b1 as u8) << 1) | (b0 as u8))
    }

    pub fn decode(self) -> FlagTriple {
        FlagTriple([self.0 & 1 == 1, (self.0 >> 1) & 1 == 1, (self.0 >> 2) & 1 == 1])
    }

    /// Whether the given detector fired in this pattern.
    pub fn bit(self, detector: Detector) -> bool {
        (self.0 >> detector.bit()) & 1 == 1
    }

    /// The pattern as a feature row in canonical detector order.
    pub fn features(self) -> [f64; NUM_DETECTORS] {
        Detector::ALL.map(|d| if self.bit(d) { 1.0 } else { 0.0 })
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Pattern {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Pattern::new(value).ok_or_else(|| format!("pattern {value} is outside [0, {NUM_PATTERNS})"))
    }
}

impl From<Pattern> for u8 {
    fn from(pattern: Pattern) -> Self {
        pattern.0
    }
}

impl fmt::Display for Pattern {
    /// Formats as the three bits, most significant (program header) first.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03b}", self.0)
    }
}

/// Packs three flags into a pattern: `(b2 << 2) | (b1 << 1) | b0`.
pub fn encode(b0: bool, b1: bool, b2: bool) -> Pattern {
    Pattern::encode(FlagTriple::new(b0, b1, b2))
}

/// Exact inverse of [`encode`].
pub fn decode(pattern: Pattern) -> (bool, bool, bool) {
    let [b0, b1, b2] = pattern.decode().as_array();
    (b0, b1, b2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_covers_all_patterns() {
        for pattern in Pattern::ALL {
            let (b0, b1, b2) = decode(pattern);
            assert_eq!(encode(b0, b1, b2), pattern);
        }
    }

    #[test]
    fn bit_order_puts_string_minhash_lowest() {
        assert_eq!(encode(true, false, false).value(), 1);
        assert_eq!(encode(false, true, false).value(), 2);
        assert_eq!(encode(false, false, true).value(), 4);
        let p = Pattern::new(5).unwrap();
        assert!(p.bit(Detector::StringMinhash));
        assert!(!p.bit(Detector::CodeRegions));
        assert!(p.bit(Detector::ProgramHeader));
        assert_eq!(p.features(), [1.0, 0.0, 1.0]);
        assert_eq!(p.to_string(), "101");
    }

    #[test]
    fn pattern_rejects_out_of_range_values() {
        assert!(Pattern::new(8).is_none());
        assert!(Pattern::try_from(200u8).is_err());
    }

    #[test]
    fn binarize_uses_inclusive_threshold_and_drops_non_finite() {
        assert_eq!(binarize(Some(0.5), 0.5), Some(true));
        assert_eq!(binarize(Some(0.49), 0.5), Some(false));
        assert_eq!(binarize(Some(f64::NAN), 0.5), None);
        assert_eq!(binarize(Some(f64::INFINITY), 0.5), None);
        assert_eq!(binarize(None, 0.5), None);
    }

    #[test]
    fn binarizer_reports_first_failing_detector() {
        let binarizer = Binarizer::default();
        let err = binarizer
            .flags(&[Some(0.9), None, Some(f64::NAN)])
            .unwrap_err();
        assert_eq!(err, DropReason::MissingScore(Detector::CodeRegions));

        let err = binarizer
            .flags(&[Some(0.9), Some(0.9), Some(f64::NAN)])
            .unwrap_err();
        assert_eq!(err, DropReason::NonFiniteScore(Detector::ProgramHeader));

        let flags = binarizer
            .flags(&[Some(0.146484375), Some(0.1), Some(0.9)])
            .unwrap();
        assert_eq!(Pattern::encode(flags).value(), 0b101);
    }

    #[test]
    fn detector_names_resolve_by_name_not_position() {
        for detector in Detector::ALL {
            assert_eq!(Detector::from_name(detector.name()), Some(detector));
        }
        assert_eq!(Detector::from_name("ph"), Some(Detector::ProgramHeader));
        assert_eq!(Detector::from_name("elf_header_vector"), None);
    }
}
