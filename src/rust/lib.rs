//! Fine-tuning, evaluation and quantization pipeline for an 8-class
//! climate disinformation classifier built on DistilBERT.
//!
//! # Basic Usage
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use climate_debunk::{pipeline, PipelineConfig};
//!
//! let config = PipelineConfig::from_file("configs/config.yaml")?;
//! let outcome = pipeline::run_training(&config)?;
//! println!("best validation accuracy: {:.4}", outcome.history.best_val_accuracy());
//! # Ok(())
//! # }
//! ```
//!
//! The stages are also usable on their own: [`data`] reads and encodes
//! labelled quotes, [`augment`] balances classes fold by fold, [`model`]
//! builds partially frozen classifiers, [`train`] runs the epoch loops,
//! [`search`] drives the hyperparameter study and [`export`] writes,
//! quantizes and re-validates ONNX graphs.

use std::fs::File;
use std::io;
use std::path::Path;

pub mod augment;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod metrics;
pub mod model;
pub mod model_manager;
pub mod models;
pub mod pipeline;
mod runtime;
pub mod search;
pub mod train;

pub use config::{AugmentationConfig, PipelineConfig, QuantizationConfig, SearchSpaceConfig};
pub use error::{PipelineError, Result};
pub use model_manager::{ModelError, ModelManager};
pub use models::{BuiltinModel, ModelInfo};
pub use runtime::{create_session_builder, OptimizationLevel, RuntimeSettings};

pub fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Initializes logging at `level` (overridden by `RUST_LOG`), writing to
/// `file` instead of stderr when given.
///
/// Fails with `AlreadyExists` when a logger is already installed and a
/// `file` was requested, since that file would never receive output.
pub fn init_logger_with(level: Option<&str>, file: Option<&Path>) -> io::Result<()> {
    let level = level.unwrap_or("info").to_ascii_lowercase();
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if let Some(path) = file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        builder.target(env_logger::Target::Pipe(Box::new(File::create(path)?)));
    }
    match (builder.try_init(), file) {
        (Ok(()), _) => Ok(()),
        (Err(e), Some(path)) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("cannot log to {:?}: {}", path, e),
        )),
        (Err(e), None) => {
            log::warn!("Keeping the existing logger: {}", e);
            Ok(())
        }
    }
}
