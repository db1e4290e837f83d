//! Batch runner: drives the sample analyzer over every populated slot of an
//! experiment, reporting progress and honoring cooperative cancellation.

use crate::analyzer::SampleAnalyzer;
use crate::catalog::Experiment;
use crate::classifier::{calibrate_infected_index, Classifier};
use crate::color_utils::symbols;
use crate::error::AnalysisError;
use crate::masking::Masker;
use crate::progress::{EtaTracker, ProcessingEvent, SampleOutcome};
use crate::result_store::{ResultEntry, ResultStore, RunCounters, RunMetadata};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Return the results gathered so far when a run is cancelled instead of
    /// discarding them.
    pub keep_partial_on_cancel: bool,
    /// Recorded in the store metadata.
    pub model_description: String,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(ResultStore),
    Cancelled {
        counters: RunCounters,
        /// Only set with [`RunOptions::keep_partial_on_cancel`].
        partial: Option<ResultStore>,
    },
}

impl RunOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled { .. })
    }

    pub fn counters(&self) -> RunCounters {
        match self {
            RunOutcome::Completed(store) => store.metadata.counters,
            RunOutcome::Cancelled { counters, .. } => *counters,
        }
    }

    /// The store to hand downstream. A cancelled run without partial results
    /// yields an empty store.
    pub fn into_store(self) -> ResultStore {
        match self {
            RunOutcome::Completed(store) => store,
            RunOutcome::Cancelled { partial, .. } => partial.unwrap_or_default(),
        }
    }
}

fn emit(progress_tx: &Option<Sender<ProcessingEvent>>, event: ProcessingEvent) {
    if let Some(tx) = progress_tx {
        // A closed channel only means nobody is watching.
        let _ = tx.send(event);
    }
}

/// Take the cancel request, clearing the flag so a later run starts fresh.
fn take_cancel(cancel_flag: &Option<Arc<AtomicBool>>) -> bool {
    cancel_flag
        .as_ref()
        .is_some_and(|flag| flag.swap(false, Ordering::SeqCst))
}

/// Analyze every populated slot of `experiment`.
///
/// The classifier is owned by the run and dropped when it returns. Only a
/// calibration failure aborts the run; per-sample failures are logged and
/// leave their slot empty.
pub fn run_analysis<C: Classifier, M: Masker>(
    experiment: &Experiment,
    mut classifier: C,
    masker: M,
    options: &RunOptions,
    progress_tx: Option<Sender<ProcessingEvent>>,
    cancel_flag: Option<Arc<AtomicBool>>,
) -> Result<RunOutcome, AnalysisError> {
    let run_start = Instant::now();

    let infected = calibrate_infected_index(&mut classifier)?;
    log::debug!(
        "{}Infected class index calibrated to {}",
        symbols::system_setup(),
        infected.0
    );

    let mut metadata = RunMetadata::new(&experiment.name, &options.model_description);
    metadata.infected_index = Some(infected);
    let mut store = ResultStore::from_experiment(experiment, metadata);

    let total = experiment.image_count;
    let analyzer = SampleAnalyzer::new(masker);
    let mut tracker = EtaTracker::new(total);
    let mut counters = RunCounters::default();

    log::info!("{}Found {} image(s) to process", symbols::resources_found(), total);
    emit(&progress_tx, ProcessingEvent::RunStarted { total });

    for (ti, timepoint) in experiment.timepoints.iter().enumerate() {
        for (ri, tray) in timepoint.trays.iter().enumerate() {
            for (slot, file_name) in tray.slots.iter().enumerate() {
                let Some(file_name) = file_name else {
                    continue;
                };

                if take_cancel(&cancel_flag) {
                    log::warn!(
                        "{}Analysis cancelled after {}/{} sample(s)",
                        symbols::cancelled(),
                        counters.processed,
                        total
                    );
                    emit(
                        &progress_tx,
                        ProcessingEvent::RunCancelled {
                            processed: counters.processed,
                        },
                    );
                    let partial = options.keep_partial_on_cancel.then(|| {
                        store.metadata.counters = counters;
                        store
                    });
                    return Ok(RunOutcome::Cancelled { counters, partial });
                }

                let index = counters.processed + 1;
                let path = experiment.image_path(timepoint, tray, file_name);
                emit(
                    &progress_tx,
                    ProcessingEvent::SampleStarted {
                        path: path.clone(),
                        timepoint: timepoint.name.clone(),
                        tray: tray.name.clone(),
                        slot: slot + 1,
                        index,
                        total,
                    },
                );

                let sample_start = Instant::now();
                let outcome = match analyzer.analyze(&path, &mut classifier, infected) {
                    Ok(Some(score_map)) => {
                        log::debug!(
                            "Scored {}/{} tile(s) of {}",
                            score_map.evaluated_count(),
                            score_map.len(),
                            file_name
                        );
                        store.set(ti, ri, slot, ResultEntry::for_file(file_name, Some(score_map)));
                        counters.scored += 1;
                        SampleOutcome::Scored
                    }
                    Ok(None) => {
                        store.set(ti, ri, slot, ResultEntry::for_file(file_name, None));
                        counters.no_sample += 1;
                        SampleOutcome::NoSample
                    }
                    Err(e) => {
                        log::warn!(
                            "{}Failed to process {} ({}/{}): {}",
                            symbols::warning(),
                            path.display(),
                            index,
                            total,
                            e
                        );
                        // A failed sample keeps its id without a score map.
                        store.set(ti, ri, slot, ResultEntry::for_file(file_name, None));
                        counters.failed += 1;
                        SampleOutcome::Failed(e.to_string())
                    }
                };
                counters.processed += 1;

                let elapsed = sample_start.elapsed();
                tracker.record(elapsed);
                if !matches!(outcome, SampleOutcome::Failed(_)) {
                    log::info!(
                        "{}Processed {} ({}/{}) in {:.1}ms",
                        symbols::completed_successfully(),
                        path.display(),
                        index,
                        total,
                        elapsed.as_secs_f64() * 1000.0
                    );
                }

                emit(
                    &progress_tx,
                    ProcessingEvent::SampleFinished {
                        path,
                        index,
                        total,
                        outcome,
                        progress: tracker.progress(),
                        eta: tracker.eta(),
                    },
                );
            }
        }
    }

    store.metadata.counters = counters;

    let total_time = run_start.elapsed();
    if counters.failed > 0 {
        log::warn!(
            "{}{} of {} sample(s) failed to process",
            symbols::completed_partially_successfully(),
            counters.failed,
            total
        );
    }
    log::info!(
        "{}Processed {} sample(s) in {:.1}s ({} scored, {} without sample)",
        symbols::completed_successfully(),
        counters.processed,
        total_time.as_secs_f64(),
        counters.scored,
        counters.no_sample
    );
    emit(
        &progress_tx,
        ProcessingEvent::RunFinished {
            processed: counters.processed,
        },
    );

    Ok(RunOutcome::Completed(store))
}
