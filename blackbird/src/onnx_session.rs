use crate::classifier::Classifier;
use crate::color_utils::symbols;
use crate::error::AnalysisError;
use anyhow::{Context, Result};
use log::Level;
use ndarray::Array4;
use ort::{
    execution_providers::CPUExecutionProvider, logging::LogLevel, session::Session, value::Value,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

fn ort_level_from_log(level: Level) -> LogLevel {
    match level {
        // ONNX's info output is closer to our trace
        Level::Trace => LogLevel::Verbose,
        Level::Debug => LogLevel::Warning,
        Level::Info => LogLevel::Error,
        Level::Warn => LogLevel::Error,
        Level::Error => LogLevel::Fatal,
    }
}

/// Validate a model path before any experiment processing starts.
pub fn check_model_path(path: &Path) -> Result<()> {
    if !path.is_file() {
        anyhow::bail!("Specified model path {} does not exist", path.display());
    }
    let is_onnx = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
    if !is_onnx {
        anyhow::bail!("The specified model {} is not in ONNX format", path.display());
    }
    Ok(())
}

/// Classifier backed by an ONNX Runtime session on the CPU execution provider.
pub struct OnnxClassifier {
    session: Session,
    input_name: String,
    output_name: String,
    model_path: PathBuf,
}

impl OnnxClassifier {
    /// Load a model from disk. Returns the classifier and the load time in ms.
    pub fn from_path(model_path: &Path) -> Result<(Self, f64)> {
        check_model_path(model_path)?;

        let bytes = fs::read(model_path)
            .with_context(|| format!("Failed to read model file {}", model_path.display()))?;

        // Choose the ORT log level based on what is enabled for us
        let ort_log_level = [
            Level::Trace,
            Level::Debug,
            Level::Info,
            Level::Warn,
            Level::Error,
        ]
        .into_iter()
        .find(|&lvl| log::log_enabled!(lvl))
        .map(ort_level_from_log)
        .unwrap_or(LogLevel::Fatal);

        let session_start = Instant::now();
        let session = Session::builder()
            .map_err(|e| anyhow::anyhow!("Failed to create session builder: {}", e))?
            .with_log_level(ort_log_level)
            .map_err(|e| anyhow::anyhow!("Failed to set log level: {}", e))?
            .with_execution_providers(vec![CPUExecutionProvider::default().build()])
            .map_err(|e| anyhow::anyhow!("Failed to set execution providers: {}", e))?
            .commit_from_memory(&bytes)
            .map_err(|e| anyhow::anyhow!("Failed to load model from memory: {}", e))?;
        let load_time_ms = session_start.elapsed().as_secs_f64() * 1000.0;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("Model has no inputs")?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .context("Model has no outputs")?;

        log::debug!(
            "{}Loaded {} ({} bytes) in {:.1}ms: input '{}', output '{}'",
            symbols::system_setup(),
            model_path.display(),
            bytes.len(),
            load_time_ms,
            input_name,
            output_name
        );

        Ok((
            Self {
                session,
                input_name,
                output_name,
                model_path: model_path.to_path_buf(),
            },
            load_time_ms,
        ))
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&mut self, tile: &Array4<f32>) -> Result<Vec<f32>, AnalysisError> {
        let input_value = Value::from_array(tile.clone()).map_err(|e| {
            AnalysisError::Inference(format!("Failed to create input value: {e}"))
        })?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_value])
            .map_err(|e| AnalysisError::Inference(format!("Failed to run inference: {e}")))?;

        let output_view = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| {
                AnalysisError::Inference(format!("Failed to extract output array: {e}"))
            })?;

        // Output is [1, n_classes]; flatten the batch axis away.
        Ok(output_view.iter().copied().collect())
    }
}
