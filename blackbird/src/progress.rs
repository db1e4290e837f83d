//! Progress events and ETA tracking for batch runs.
//!
//! The runner emits [`ProcessingEvent`]s over an `mpsc` channel; front-ends
//! (the CLI progress bar, tests) consume them on another thread.

use std::path::PathBuf;
use std::time::Duration;

/// What happened to a single sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// A score map was produced.
    Scored,
    /// The masker found no sample in the image.
    NoSample,
    /// Decoding, masking or inference failed; the slot keeps the sample id
    /// without a score map.
    Failed(String),
}

/// Events emitted during a batch run.
#[derive(Debug, Clone)]
pub enum ProcessingEvent {
    /// Calibration is done and `total` samples are about to be processed.
    RunStarted { total: usize },

    /// A sample is about to be analyzed.
    SampleStarted {
        path: PathBuf,
        timepoint: String,
        tray: String,
        slot: usize,
        index: usize,
        total: usize,
    },

    /// A sample finished, whatever its outcome.
    SampleFinished {
        path: PathBuf,
        index: usize,
        total: usize,
        outcome: SampleOutcome,
        /// Fraction of samples done, in `[0, 1]`.
        progress: f64,
        /// Estimated remaining time, `HH:MM:SS`.
        eta: String,
    },

    /// The cancel flag was observed; `processed` samples had finished.
    RunCancelled { processed: usize },

    RunFinished { processed: usize },
}

/// Running mean of per-sample durations.
#[derive(Debug, Clone)]
pub struct EtaTracker {
    total: usize,
    done: usize,
    elapsed: Duration,
}

impl EtaTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            done: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Record one finished sample.
    pub fn record(&mut self, duration: Duration) {
        self.done += 1;
        self.elapsed += duration;
    }

    pub fn done(&self) -> usize {
        self.done
    }

    /// `done / total`; an empty run counts as complete.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.done as f64 / self.total as f64).min(1.0)
        }
    }

    pub fn mean_duration(&self) -> Duration {
        if self.done == 0 {
            Duration::ZERO
        } else {
            self.elapsed / self.done as u32
        }
    }

    /// Mean duration times the samples left.
    pub fn remaining(&self) -> Duration {
        let left = self.total.saturating_sub(self.done);
        self.mean_duration().mul_f64(left as f64)
    }

    pub fn eta(&self) -> String {
        format_eta(self.remaining())
    }
}

/// Render a duration as `HH:MM:SS`. Hours are not wrapped at 24.
pub fn format_eta(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
