//! Error types for the analysis pipeline.
//!
//! Each stage has its own error enum so callers can tell fatal structural
//! problems (catalog scan, threshold validation) from per-sample failures that
//! the batch runner isolates and logs.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while scanning an experiment directory. All of them are fatal
/// to the run and are reported before any sample is processed.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The experiment root contains no subdirectories at all.
    #[error("experiment folder {} does not have any timepoint sub-folder", .0.display())]
    NoTimepoints(PathBuf),

    /// A timepoint folder name does not start with a `MM-DD-YYYY` date.
    #[error("cannot parse a MM-DD-YYYY date from timepoint folder '{folder}' (prefix '{prefix}')")]
    DateParse { folder: String, prefix: String },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-sample analysis failures. The batch runner logs these and moves on.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("image {} could not be decoded: {source}", path.display())]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("masking failed: {0}")]
    Mask(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Threshold validation errors, checked before any report output is produced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("low threshold {low} is greater than high threshold {high}")]
    InvalidRange { low: f32, high: f32 },

    #[error("threshold {0} is outside [0, 1]")]
    OutOfBounds(f32),
}

/// Persistence errors for the result store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed results file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("results file is structurally invalid: {0}")]
    Format(String),

    #[error("{} already exists (use --force to overwrite)", .0.display())]
    AlreadyExists(PathBuf),
}
