#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

// ========================================================================================
//
//                      famcal: detector-pattern calibration toolkit
//
// ========================================================================================

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use famcal::calibrate::artifact::{CalibrationModel, DEFAULT_PRODUCTION_THRESHOLD, HistogramArtifact};
use famcal::calibrate::config::CalibrationConfig;
use famcal::calibrate::data::FamilyMap;
use famcal::calibrate::metrics::OperatingPointRecord;
use famcal::calibrate::report::{
    print_histogram, write_family_records, write_grouped_histograms, write_histogram,
    write_operating_points, write_selections, write_tau_reports,
};
use famcal::calibrate::threshold::{Selection, SelectionMode};
use famcal::pipeline::{
    self, FalsePositiveSearch, ScanOptions, TauSearch, calibrate, evaluate, load_or_scan, search_taus,
    tally_false_positives,
};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Clone, Copy, ValueEnum)]
pub enum CriterionCli {
    /// Maximise TPR - FPR.
    Youden,
    /// Minimise FPR subject to TPR >= --recall-target.
    Recall,
}

/// Input options shared by every subcommand that reads comparisons.
#[derive(Args)]
pub struct InputArgs {
    /// Comparison table (TSV, CSV, optionally .gz), a directory of JSON exports,
    /// or (for fit-weights and evaluate) a histogram artifact
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// CSV with `filename,family` rows overriding name-derived families
    #[arg(long, value_name = "PATH")]
    pub families_file: Option<PathBuf>,

    /// Restrict to these anchor families (comma separated)
    #[arg(long, value_name = "FAMILY", value_delimiter = ',')]
    pub families: Vec<String>,
}

impl InputArgs {
    fn scan_options(&self, by_group: bool) -> Result<ScanOptions, Box<dyn Error>> {
        let families = match &self.families_file {
            Some(path) => {
                let map = FamilyMap::load(path)?;
                println!("Loaded {} family overrides from {}", map.len(), path.display());
                Some(map)
            }
            None => None,
        };
        Ok(ScanOptions {
            by_group,
            families,
            family_filter: self.family_filter().map(<[String]>::to_vec),
        })
    }

    fn family_filter(&self) -> Option<&[String]> {
        (!self.families.is_empty()).then_some(self.families.as_slice())
    }
}

#[derive(Args)]
pub struct AggregateArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Where to write the histogram artifact
    #[arg(long, value_name = "PATH", default_value = "histogram.toml")]
    pub output: PathBuf,

    /// Also write the histogram as CSV
    #[arg(long, value_name = "PATH")]
    pub csv: Option<PathBuf>,

    /// Keep one histogram per anchor family
    #[arg(long)]
    pub by_family: bool,

    /// Write the per-family histograms as CSV (requires --by-family)
    #[arg(long, value_name = "PATH", requires = "by_family")]
    pub family_csv: Option<PathBuf>,
}

#[derive(Args)]
pub struct FitArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Where to write the model
    #[arg(long, value_name = "PATH", default_value = "model.toml")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Model to evaluate; the production weights are used when omitted
    #[arg(long, value_name = "PATH")]
    pub model: Option<PathBuf>,

    /// Additional threshold to evaluate (repeatable)
    #[arg(long = "threshold", value_name = "T")]
    pub thresholds: Vec<f64>,

    /// Where to write the threshold sweep
    #[arg(long, value_name = "PATH", default_value = "sweep.csv")]
    pub output: PathBuf,

    /// Write per-family metrics to this CSV
    #[arg(long, value_name = "PATH")]
    pub by_family: Option<PathBuf>,
}

#[derive(Args)]
pub struct CalibrateArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Operating-point criterion stored in the model
    #[arg(long, value_enum, default_value_t = CriterionCli::Youden)]
    pub criterion: CriterionCli,

    /// Recall floor for `--criterion recall`
    #[arg(long, value_name = "TPR", default_value = "0.95")]
    pub recall_target: f64,

    /// Where to write the model
    #[arg(long, value_name = "PATH", default_value = "model.toml")]
    pub output: PathBuf,

    /// Write the selected operating points as CSV
    #[arg(long, value_name = "PATH")]
    pub selections: Option<PathBuf>,

    /// Write the threshold sweep of the fitted weights as CSV
    #[arg(long, value_name = "PATH")]
    pub sweep: Option<PathBuf>,

    /// Also save the scanned histogram artifact
    #[arg(long, value_name = "PATH")]
    pub histogram: Option<PathBuf>,
}

#[derive(Args)]
pub struct TausArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Negatives kept per positive; 0 keeps all negatives
    #[arg(long, value_name = "RATIO", default_value = "0")]
    pub neg_pos_ratio: f64,

    /// Stop after this many pairs per detector
    #[arg(long, value_name = "N")]
    pub max_rows: Option<usize>,

    /// Where to write the tau report
    #[arg(long, value_name = "PATH", default_value = "taus.csv")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct FalsePositivesArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Model providing taus, weights and threshold
    #[arg(long, value_name = "PATH")]
    pub model: Option<PathBuf>,

    /// Count hits whose candidate family is unknown as `__unknown__`
    #[arg(long)]
    pub include_unknown: bool,

    /// Where to write the family pairs
    #[arg(long, value_name = "PATH", default_value = "false_positives.csv")]
    pub output: PathBuf,

    /// Also write a candidate x anchor pivot matrix
    #[arg(long, value_name = "PATH")]
    pub matrix: Option<PathBuf>,

    /// Number of pairs printed to the terminal
    #[arg(long, value_name = "N", default_value = "20")]
    pub top: usize,
}

#[derive(Parser)]
#[command(
    name = "famcal",
    about = "Calibrate binary-similarity detectors by aggregating detector patterns",
    long_about = "Aggregates labelled comparisons into an 8-pattern histogram, fits per-detector \
                 weights and selects the production operating point."
)]
struct Cli {
    /// Calibration configuration (TOML); defaults are used when omitted
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate comparisons into a pattern histogram
    #[command(about = "Aggregate comparisons (outputs: histogram.toml)")]
    Aggregate(AggregateArgs),

    /// Fit detector weights from comparisons or a saved histogram
    #[command(about = "Fit detector weights (outputs: model.toml)")]
    FitWeights(FitArgs),

    /// Evaluate weights over a threshold sweep
    #[command(about = "Evaluate weights over thresholds (outputs: sweep.csv)")]
    Evaluate(EvaluateArgs),

    /// Aggregate, fit and select the operating point in one run
    #[command(about = "Run the full calibration (outputs: model.toml)")]
    Calibrate(CalibrateArgs),

    /// Search per-detector taus over raw similarity values
    #[command(about = "Search per-detector taus (outputs: taus.csv)")]
    Taus(TausArgs),

    /// Tally false positives per family pair at the model's operating point
    #[command(about = "Tally false positives (outputs: false_positives.csv)")]
    FalsePositives(FalsePositivesArgs),

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { config, command } = Cli::parse();

    let result = match command {
        Some(Commands::Aggregate(args)) => with_config(config.as_deref(), |c| run_aggregate(c, args)),
        Some(Commands::FitWeights(args)) => with_config(config.as_deref(), |c| run_fit(c, args)),
        Some(Commands::Evaluate(args)) => with_config(config.as_deref(), |c| run_evaluate(c, args)),
        Some(Commands::Calibrate(args)) => with_config(config.as_deref(), |c| run_calibrate(c, args)),
        Some(Commands::Taus(args)) => with_config(config.as_deref(), |c| run_taus(c, args)),
        Some(Commands::FalsePositives(args)) => {
            with_config(config.as_deref(), |c| run_false_positives(c, args))
        }
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn with_config(path: Option<&Path>, run: impl FnOnce(&CalibrationConfig) -> CliResult) -> CliResult {
    let config = match path {
        Some(path) => {
            let config = CalibrationConfig::load(path)?;
            log::info!("Loaded configuration from {}", path.display());
            config
        }
        None => CalibrationConfig::default(),
    };
    run(&config)
}

fn load_model(path: Option<&Path>) -> Result<CalibrationModel, Box<dyn Error>> {
    match path {
        Some(path) => {
            let model = CalibrationModel::load(path)?;
            println!("Loaded model from {}", path.display());
            Ok(model)
        }
        None => {
            println!("No model given; using the production weights and threshold.");
            Ok(CalibrationModel::production_default())
        }
    }
}

fn print_operating_point(label: &str, record: &OperatingPointRecord) {
    println!(
        "{label:<14} thr={:.6}  tp={} fp={} tn={} fn={}  tpr={:.4} fpr={:.6} precision={:.4} J={:.4}",
        record.threshold,
        record.tp,
        record.fp,
        record.tn,
        record.fn_,
        record.tpr,
        record.fpr,
        record.precision,
        record.youden_j
    );
}

fn print_selections(selections: &[(SelectionMode, Selection)]) {
    for (mode, selection) in selections {
        match selection {
            Selection::Reached(point) => print_operating_point(&mode.to_string(), &point.record()),
            Selection::NotReachable { target, best_tpr } => {
                println!("{:<14} not reachable (target {target}, best tpr {best_tpr:.4})", mode.to_string())
            }
        }
    }
}

// --- Subcommands ---

fn run_aggregate(config: &CalibrationConfig, args: AggregateArgs) -> CliResult {
    let scan = pipeline::scan(&args.input.input, config, args.input.scan_options(args.by_family)?)?;
    let aggregation = &scan.aggregation;

    print_histogram(&mut io::stdout().lock(), &aggregation.histogram)?;

    HistogramArtifact::new(&scan.binarizer, aggregation).save(&args.output)?;
    println!("Histogram written to {}", args.output.display());
    if let Some(path) = &args.csv {
        write_histogram(path, &aggregation.histogram)?;
        println!("Histogram CSV written to {}", path.display());
    }
    if let (Some(path), Some(groups)) = (&args.family_csv, &aggregation.groups) {
        write_grouped_histograms(path, groups)?;
        println!("Per-family histograms written to {}", path.display());
    }
    Ok(())
}

fn run_fit(config: &CalibrationConfig, args: FitArgs) -> CliResult {
    let scan = load_or_scan(&args.input.input, config, args.input.scan_options(false)?)?;
    let calibration = calibrate(&scan, config, SelectionMode::YoudenJ)?;
    let fit = &calibration.fit;

    println!("Detector weights:");
    for (name, weight) in fit.weight_vector().named() {
        println!("  {name:<22} {weight:.4}");
    }
    println!(
        "Intercept {:.4}, {} iterations, {:?}, {} patterns present",
        fit.intercept, fit.iterations, fit.status, fit.patterns_present
    );
    print_selections(&calibration.selections);

    let model = calibration
        .model
        .with_families(args.input.families.clone());
    model.save(&args.output)?;
    println!("Model written to {}", args.output.display());
    Ok(())
}

fn run_evaluate(config: &CalibrationConfig, args: EvaluateArgs) -> CliResult {
    let model = load_model(args.model.as_deref())?;
    let weights = model.weights()?;
    let scan = load_or_scan(
        &args.input.input,
        config,
        args.input.scan_options(args.by_family.is_some())?,
    )?;

    let family_thresholds = if args.thresholds.is_empty() {
        vec![model.threshold().unwrap_or(DEFAULT_PRODUCTION_THRESHOLD)]
    } else {
        args.thresholds.clone()
    };
    let evaluation = evaluate(
        &scan.aggregation,
        &weights,
        &args.thresholds,
        &family_thresholds,
        args.input.family_filter(),
    );

    for record in evaluation
        .sweep
        .iter()
        .filter(|r| args.thresholds.contains(&r.threshold))
    {
        print_operating_point("threshold", record);
    }
    if let Some(auc) = evaluation.auc {
        println!("AUC {auc:.6}");
    }

    write_operating_points(&args.output, &evaluation.sweep)?;
    println!("Sweep of {} thresholds written to {}", evaluation.sweep.len(), args.output.display());
    if let Some(path) = &args.by_family {
        match &evaluation.families {
            Some(rows) => {
                write_family_records(path, rows)?;
                println!("Per-family metrics written to {}", path.display());
            }
            None => log::warn!("No per-family histograms available; {} not written", path.display()),
        }
    }
    Ok(())
}

fn run_calibrate(config: &CalibrationConfig, args: CalibrateArgs) -> CliResult {
    let mode = match args.criterion {
        CriterionCli::Youden => SelectionMode::YoudenJ,
        CriterionCli::Recall => SelectionMode::recall_floor(args.recall_target)?,
    };
    let scan = pipeline::scan(&args.input.input, config, args.input.scan_options(false)?)?;
    print_histogram(&mut io::stdout().lock(), &scan.aggregation.histogram)?;
    if let Some(path) = &args.histogram {
        HistogramArtifact::new(&scan.binarizer, &scan.aggregation).save(path)?;
        println!("Histogram written to {}", path.display());
    }

    let calibration = calibrate(&scan, config, mode)?;
    println!("Detector weights:");
    for (name, weight) in calibration.fit.weight_vector().named() {
        println!("  {name:<22} {weight:.4}");
    }
    print_selections(&calibration.selections);
    match &calibration.chosen {
        Selection::Reached(point) => print_operating_point("chosen", &point.record()),
        Selection::NotReachable { target, best_tpr } => println!(
            "Criterion {mode} cannot be met (target {target}, best tpr {best_tpr:.4}); the model has no operating point."
        ),
    }

    if let Some(path) = &args.selections {
        write_selections(path, &calibration.selections)?;
        println!("Selections written to {}", path.display());
    }
    if let Some(path) = &args.sweep {
        let evaluation = evaluate(&scan.aggregation, &calibration.fit.weight_vector(), &[], &[], None);
        write_operating_points(path, &evaluation.sweep)?;
        println!("Sweep written to {}", path.display());
    }

    let model = calibration
        .model
        .with_families(args.input.families.clone());
    model.save(&args.output)?;
    println!("Model written to {}", args.output.display());
    Ok(())
}

fn run_taus(config: &CalibrationConfig, args: TausArgs) -> CliResult {
    let reports = search_taus(
        &args.input.input,
        config,
        TauSearch {
            neg_pos_ratio: args.neg_pos_ratio,
            max_rows: args.max_rows,
            scan: args.input.scan_options(false)?,
        },
    )?;

    for report in &reports {
        println!(
            "{:<22} auc={:.4}  youden tau={:.6} (tpr {:.4}, fpr {:.4})",
            report.detector.name(),
            report.auc,
            report.youden.threshold,
            report.youden.metrics.tpr,
            report.youden.metrics.fpr
        );
        for choice in &report.recall {
            match &choice.evaluation {
                Some(e) => println!(
                    "  recall>={:<6} tau={:.6} (tpr {:.4}, fpr {:.4})",
                    choice.target, e.threshold, e.metrics.tpr, e.metrics.fpr
                ),
                None => println!("  recall>={:<6} not reachable", choice.target),
            }
        }
    }

    write_tau_reports(&args.output, &reports)?;
    println!("Tau report written to {}", args.output.display());
    Ok(())
}

fn run_false_positives(config: &CalibrationConfig, args: FalsePositivesArgs) -> CliResult {
    let model = load_model(args.model.as_deref())?;
    let threshold = model.threshold().unwrap_or(DEFAULT_PRODUCTION_THRESHOLD);
    let tally = tally_false_positives(
        &args.input.input,
        config,
        &model,
        FalsePositiveSearch {
            include_unknown: args.include_unknown,
            scan: args.input.scan_options(false)?,
        },
    )?;

    let pairs = tally.sorted_pairs();
    let mut out = io::stdout().lock();
    writeln!(out, "{} false positives at threshold {threshold}", tally.total())?;
    for pair in pairs.iter().take(args.top) {
        writeln!(out, "  {:>8}  {} -> {}", pair.fp_count, pair.src_family, pair.dst_family)?;
    }
    drop(out);

    tally.write_pairs(&args.output, threshold)?;
    println!("Family pairs written to {}", args.output.display());
    if let Some(path) = &args.matrix {
        tally.write_matrix(path)?;
        println!("Pair matrix written to {}", path.display());
    }
    Ok(())
}

fn print_version_info() {
    println!("famcal {}", env!("CARGO_PKG_VERSION"));
    match option_env!("FAMCAL_RELEASE_TAG") {
        Some(tag) => println!("Release: {tag}"),
        None => println!("Release: development build"),
    }
}
