use anyhow::{Context, Result};
use blackbird::batch::{run_analysis, RunOptions, RunOutcome};
use blackbird::catalog::scan_experiment;
use blackbird::color_utils::{colors, init_color_config, progress, symbols};
use blackbird::config::{
    AnalysisConfig, AnalyzeCommand, GlobalArgs, ReportFormat, ThresholdCommand, ThresholdConfig,
};
use blackbird::masking::FocusMasker;
use blackbird::onnx_session::{check_model_path, OnnxClassifier};
use blackbird::progress::ProcessingEvent;
use blackbird::report::build_report;
use blackbird::report_output::{
    CsvReportSink, JsonReportSink, MarkdownReportSink, ReportSink,
};
use blackbird::result_store::ResultStore;
use clap::Parser;
use env_logger::Builder;
use env_logger::Env;
use log::{error, info, Level};
use std::io::{stdin, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Exit code of a run that was cancelled before completion.
const EXIT_CANCELLED: i32 = 2;

/// How often the supervisory loop polls the worker's event channel.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Score every sample image of an experiment with an ONNX classifier
    Analyze(AnalyzeCommand),

    /// Turn stored results into per-tray infection reports
    Threshold(ThresholdCommand),

    /// Show version information
    Version,
}

#[derive(Parser)]
#[command(name = "blackbird")]
#[command(about = "Plant-tray infection analysis toolkit")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn get_log_level_from_verbosity(
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    let base_level = verbosity.log_level_filter();
    let adjusted_level = match base_level {
        log::LevelFilter::Off => log::LevelFilter::Off, // -qq -> OFF
        log::LevelFilter::Error => log::LevelFilter::Warn, // default -> WARN
        log::LevelFilter::Warn => log::LevelFilter::Info, // -v -> INFO
        log::LevelFilter::Info => log::LevelFilter::Debug, // -vv -> DEBUG
        log::LevelFilter::Debug => log::LevelFilter::Trace, // -vvv -> TRACE
        log::LevelFilter::Trace => log::LevelFilter::Trace, // -vvvv -> TRACE (max)
    };

    // clap-verbosity-flag reports a single -q like the default, check it directly
    if verbosity.is_silent() {
        log::LevelFilter::Error
    } else {
        adjusted_level
    }
}

fn init_logging(global: &GlobalArgs) {
    // If user didn't pass -v/-q and RUST_LOG is set, honor the env var.
    let use_env = !global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(get_log_level_from_verbosity(global.verbosity.clone()));
        b
    };

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => colors::error_level("ERROR"),
                Level::Warn => colors::warning_level("WARN"),
                Level::Info => colors::info_level("INFO"),
                Level::Debug => colors::debug_level("DEBUG"),
                Level::Trace => colors::trace_level("TRACE"),
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .init();
}

/// Let an interactive user cancel the run by typing `q` and Enter.
fn spawn_cancel_listener(cancel_flag: Arc<AtomicBool>) {
    if !stdin().is_terminal() {
        return;
    }
    info!("   Type 'q' and press Enter to cancel");
    thread::spawn(move || {
        for line in stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().eq_ignore_ascii_case("q") {
                cancel_flag.store(true, Ordering::SeqCst);
                break;
            }
        }
    });
}

fn run_analyze(config: AnalysisConfig) -> Result<i32> {
    let experiment = scan_experiment(&config.experiment_dir)?;
    info!("{}{}", symbols::resources_found(), experiment.summary());

    if config.dry_run {
        for timepoint in &experiment.timepoints {
            info!("   {} ({})", timepoint.name, timepoint.date);
            for tray in &timepoint.trays {
                info!("      {}: {} sample(s)", tray.name, tray.populated());
            }
        }
        println!("{}", experiment.summary());
        return Ok(0);
    }

    // Fail before the long run rather than after it.
    if config.output.exists() && !config.force {
        anyhow::bail!(
            "Results file {} already exists (use --force to overwrite)",
            config.output.display()
        );
    }
    check_model_path(&config.model_path)?;

    let (classifier, load_time_ms) = OnnxClassifier::from_path(&config.model_path)?;
    info!(
        "{}Loaded model {} in {:.1}ms",
        symbols::system_setup(),
        classifier.model_path().display(),
        load_time_ms
    );

    let options = RunOptions {
        keep_partial_on_cancel: config.keep_partial_on_cancel,
        model_description: config.model_path.display().to_string(),
    };
    let (tx, rx) = channel();
    let cancel_flag = Arc::new(AtomicBool::new(false));
    spawn_cancel_listener(Arc::clone(&cancel_flag));

    let progress_bar = progress::create_analysis_progress_bar(experiment.image_count);
    let worker_experiment = experiment.clone();
    let worker_cancel = Arc::clone(&cancel_flag);
    let worker = thread::spawn(move || {
        run_analysis(
            &worker_experiment,
            classifier,
            FocusMasker::default(),
            &options,
            Some(tx),
            Some(worker_cancel),
        )
    });

    // Supervisory loop: the worker drops its sender when it returns.
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                let Some(pb) = &progress_bar else {
                    continue;
                };
                match event {
                    ProcessingEvent::SampleStarted { index, total, .. } => {
                        pb.set_message(format!("{index}/{total}"));
                    }
                    ProcessingEvent::SampleFinished {
                        index,
                        total,
                        progress,
                        eta,
                        ..
                    } => {
                        pb.set_position((progress * 1000.0).round() as u64);
                        pb.set_message(format!(
                            "{index}/{total} ({:.0}%) ETA {eta}",
                            progress * 100.0
                        ));
                    }
                    _ => {}
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if let Some(pb) = &progress_bar {
        pb.finish_and_clear();
    }

    let outcome = worker
        .join()
        .map_err(|_| anyhow::anyhow!("Analysis worker panicked"))??;

    match outcome {
        RunOutcome::Completed(store) => {
            store
                .save(&config.output, config.force)
                .with_context(|| format!("Failed to save results to {}", config.output.display()))?;
            info!(
                "{}Results saved to {}",
                symbols::completed_successfully(),
                config.output.display()
            );
            Ok(0)
        }
        RunOutcome::Cancelled { counters, partial } => {
            if let Some(store) = partial {
                store.save(&config.output, config.force).with_context(|| {
                    format!("Failed to save partial results to {}", config.output.display())
                })?;
                info!(
                    "{}Partial results ({} sample(s)) saved to {}",
                    symbols::completed_partially_successfully(),
                    counters.processed,
                    config.output.display()
                );
            } else {
                info!("{}No results were saved", symbols::cancelled());
            }
            Ok(EXIT_CANCELLED)
        }
    }
}

fn run_threshold(config: ThresholdConfig) -> Result<()> {
    let store = ResultStore::load(&config.results)
        .with_context(|| format!("Failed to load results from {}", config.results.display()))?;

    let report = build_report(&store, config.thresholds);

    let sink: Box<dyn ReportSink> = match config.format {
        ReportFormat::Csv => {
            if !config.force {
                if let Some(existing) = report
                    .trays
                    .iter()
                    .map(|t| config.output.join(format!("{}.csv", t.name)))
                    .find(|p| p.exists())
                {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        existing.display()
                    );
                }
            }
            Box::new(CsvReportSink {
                dir: config.output.clone(),
            })
        }
        ReportFormat::Json | ReportFormat::Markdown => {
            if config.output.exists() && !config.force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config.output.display()
                );
            }
            if config.format == ReportFormat::Json {
                Box::new(JsonReportSink {
                    path: config.output.clone(),
                })
            } else {
                Box::new(MarkdownReportSink {
                    path: config.output.clone(),
                })
            }
        }
    };

    let written = sink.write(&report)?;
    info!(
        "{}{} samples processed",
        symbols::completed_successfully(),
        report.samples_processed()
    );
    for path in written {
        info!("   Wrote {}", path.display());
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    init_color_config(cli.global.no_color);
    init_logging(&cli.global);

    match &cli.command {
        Some(Commands::Analyze(analyze_cmd)) => {
            info!(
                "{}Analysis: {} | model: {}",
                symbols::analysis_start(),
                analyze_cmd.experiment_dir.display(),
                analyze_cmd.model.display()
            );

            let internal_config =
                match AnalysisConfig::from_args(cli.global.clone(), analyze_cmd.clone()) {
                    Ok(config) => config,
                    Err(e) => {
                        error!("{}Invalid arguments: {e}", symbols::operation_failed());
                        std::process::exit(1);
                    }
                };
            match run_analyze(internal_config) {
                Ok(code) => std::process::exit(code),
                Err(e) => {
                    error!("{}Analysis failed: {e:#}", symbols::operation_failed());
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Threshold(threshold_cmd)) => {
            info!(
                "{}Thresholding {} | low: {} | high: {}",
                symbols::report_start(),
                threshold_cmd.results.display(),
                threshold_cmd.low,
                threshold_cmd.high
            );

            let internal_config =
                match ThresholdConfig::from_args(cli.global.clone(), threshold_cmd.clone()) {
                    Ok(config) => config,
                    Err(e) => {
                        error!("{}Invalid arguments: {e}", symbols::operation_failed());
                        std::process::exit(1);
                    }
                };
            if let Err(e) = run_threshold(internal_config) {
                error!("{}Report failed: {e:#}", symbols::operation_failed());
                std::process::exit(1);
            }
        }
        Some(Commands::Version) => {
            println!("blackbird v{}", env!("CARGO_PKG_VERSION"));
            println!("Repository: {}", env!("CARGO_PKG_REPOSITORY"));
        }
        None => {
            // Show help if no command specified
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            if let Err(e) = cmd.print_help() {
                error!("Failed to print help: {e}");
            }
        }
    }
}
