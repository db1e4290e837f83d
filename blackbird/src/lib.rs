pub mod analyzer;
pub mod batch;
pub mod catalog;
pub mod classifier;
pub mod color_utils;
pub mod config;
pub mod error;
pub mod masking;
pub mod onnx_session;
pub mod progress;
pub mod report;
pub mod report_output;
pub mod result_store;
pub mod score_map;
