use std::io;
use std::path::PathBuf;

use crate::model_manager::ModelError;

/// Errors produced anywhere in the pipeline.
///
/// Variants that concern user input carry the offending path, column,
/// label or device so the message alone is enough to fix the problem.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unsupported file format: {path:?} (expected .csv or .parquet)")]
    UnsupportedFormat { path: PathBuf },

    #[error("Column '{column}' not found in {path:?}")]
    MissingColumn { column: String, path: PathBuf },

    #[error("Invalid label '{value}': expected an integer or '<digit>_<description>'")]
    InvalidLabel { value: String },

    #[error("Label {label} is outside the range [0, {num_labels})")]
    LabelOutOfRange { label: i64, num_labels: i64 },

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Augmentation failed: {0}")]
    Augmentation(String),

    #[error("Weights file not found: {path:?}")]
    WeightsNotFound { path: PathBuf },

    #[error("Invalid device '{device}'")]
    InvalidDevice { device: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read config {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Graph export failed: {0}")]
    Export(String),

    #[error("Invalid ONNX graph: {0}")]
    InvalidGraph(String),

    #[error(
        "Quantized model regressed: accuracy drop {accuracy_drop:.4}, f1 drop {f1_drop:.4}, \
         prediction agreement {agreement:.4}"
    )]
    QuantizationRegression {
        accuracy_drop: f64,
        f1_drop: f64,
        agreement: f64,
    },

    #[error("Trial pruned at step {step}")]
    TrialPruned { step: usize },

    #[error("Search failed: {0}")]
    Search(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),

    #[error("rust-bert error: {0}")]
    RustBert(#[from] rust_bert::RustBertError),

    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Model download error: {0}")]
    Download(#[from] ModelError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
