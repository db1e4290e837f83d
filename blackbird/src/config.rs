//! Configuration layer separating CLI arguments from the internal run configurations.
//!
//! - `GlobalArgs`: options shared by every command
//! - `AnalyzeCommand` / `ThresholdCommand`: command-specific arguments
//! - `AnalysisConfig` / `ThresholdConfig`: validated internal configurations

use crate::catalog::REPORT_DIR_NAME;
use crate::report::Thresholds;
use crate::result_store::ResultStore;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Parse and validate a probability value in [0.0, 1.0]
pub fn parse_probability(s: &str) -> Result<f32, String> {
    let val = s
        .parse::<f32>()
        .map_err(|_| format!("Invalid number: '{s}'"))?;
    if !(0.0..=1.0).contains(&val) {
        return Err(format!("Must be between 0.0 and 1.0, got {val}"));
    }
    Ok(val)
}

/// Global CLI arguments that apply to all blackbird commands
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Verbosity level (-q/--quiet, -v/-vv/-vvv/-vvvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Disable colored output (also respects NO_COLOR and BLACKBIRD_NO_COLOR env vars)
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Allow overwriting existing results and report files
    #[arg(long, global = true)]
    pub force: bool,
}

/// Analyze every sample of an experiment folder
#[derive(Parser, Debug, Clone)]
pub struct AnalyzeCommand {
    /// Experiment folder containing one sub-folder per timepoint
    #[arg(value_name = "EXPERIMENT_DIR")]
    pub experiment_dir: PathBuf,

    /// Path to the ONNX classification model
    #[arg(long, env = "BLACKBIRD_MODEL", value_name = "ONNX")]
    pub model: PathBuf,

    /// Results file (default: <EXPERIMENT_DIR>/results.json)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Keep the samples analyzed so far when the run is cancelled
    #[arg(long)]
    pub keep_partial_on_cancel: bool,

    /// Scan the experiment and report what would be analyzed, without loading the model
    #[arg(long)]
    pub dry_run: bool,
}

/// Output format of a threshold report
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// One CSV file per tray
    Csv,
    Json,
    Markdown,
}

/// Threshold stored results into a per-tray report
#[derive(Parser, Debug, Clone)]
pub struct ThresholdCommand {
    /// Results file written by `blackbird analyze`
    #[arg(value_name = "RESULTS_JSON")]
    pub results: PathBuf,

    /// Tiles below this probability count as clear
    #[arg(long, default_value = "0.5", value_parser = parse_probability)]
    pub low: f32,

    /// Tiles at or above this probability count as infected
    #[arg(long, default_value = "0.5", value_parser = parse_probability)]
    pub high: f32,

    /// Report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Csv)]
    pub format: ReportFormat,

    /// Output path: a directory for csv, a file otherwise (default: next to the results file)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

/// Internal configuration for an analysis run
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisConfig {
    pub experiment_dir: PathBuf,
    pub model_path: PathBuf,
    /// Resolved results file path
    pub output: PathBuf,
    pub keep_partial_on_cancel: bool,
    pub dry_run: bool,
    pub force: bool,
}

impl AnalysisConfig {
    /// Create configuration from global args and command-specific args
    pub fn from_args(global: GlobalArgs, cmd: AnalyzeCommand) -> Result<Self, String> {
        if !cmd.experiment_dir.is_dir() {
            return Err(format!(
                "Experiment folder {} does not exist",
                cmd.experiment_dir.display()
            ));
        }

        let output = cmd
            .output
            .unwrap_or_else(|| ResultStore::default_path(&cmd.experiment_dir));

        Ok(Self {
            experiment_dir: cmd.experiment_dir,
            model_path: cmd.model,
            output,
            keep_partial_on_cancel: cmd.keep_partial_on_cancel,
            dry_run: cmd.dry_run,
            force: global.force,
        })
    }
}

/// Internal configuration for report generation
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdConfig {
    pub results: PathBuf,
    pub thresholds: Thresholds,
    pub format: ReportFormat,
    /// Resolved output location
    pub output: PathBuf,
    pub force: bool,
}

fn default_report_output(results: &Path, format: ReportFormat) -> PathBuf {
    let dir = results.parent().unwrap_or(Path::new("."));
    match format {
        ReportFormat::Csv => dir.join(REPORT_DIR_NAME),
        ReportFormat::Json => dir.join("report.json"),
        ReportFormat::Markdown => dir.join("report.md"),
    }
}

impl ThresholdConfig {
    /// Create configuration from global args and command-specific args
    pub fn from_args(global: GlobalArgs, cmd: ThresholdCommand) -> Result<Self, String> {
        let thresholds = Thresholds::new(cmd.low, cmd.high).map_err(|e| e.to_string())?;

        if !cmd.results.is_file() {
            return Err(format!(
                "Specified results path {} does not exist",
                cmd.results.display()
            ));
        }

        let output = cmd
            .output
            .unwrap_or_else(|| default_report_output(&cmd.results, cmd.format));

        Ok(Self {
            results: cmd.results,
            thresholds,
            format: cmd.format,
            output,
            force: global.force,
        })
    }
}
