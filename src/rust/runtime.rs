use std::sync::Mutex;

use lazy_static::lazy_static;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::Result as OrtResult;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref ENVIRONMENT_READY: Mutex<bool> = Mutex::new(false);
}

/// Graph optimization level applied when a session is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    Disable,
    Level1,
    Level2,
    Level3,
}

impl From<OptimizationLevel> for GraphOptimizationLevel {
    fn from(level: OptimizationLevel) -> Self {
        match level {
            OptimizationLevel::Disable => GraphOptimizationLevel::Disable,
            OptimizationLevel::Level1 => GraphOptimizationLevel::Level1,
            OptimizationLevel::Level2 => GraphOptimizationLevel::Level2,
            OptimizationLevel::Level3 => GraphOptimizationLevel::Level3,
        }
    }
}

/// ONNX Runtime session settings used when validating exported graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub inter_threads: usize,
    #[serde(default)]
    pub intra_threads: usize,
    #[serde(default = "default_level")]
    pub optimization_level: OptimizationLevel,
}

fn default_level() -> OptimizationLevel {
    OptimizationLevel::Level3
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            inter_threads: 0, // Let ONNX Runtime decide
            intra_threads: 0, // Let ONNX Runtime decide
            optimization_level: default_level(),
        }
    }
}

pub fn ensure_initialized() -> OrtResult<()> {
    let mut ready = ENVIRONMENT_READY
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if !*ready {
        ort::init().with_name("climate-debunk").commit()?;
        *ready = true;
    }
    Ok(())
}

pub fn create_session_builder(settings: &RuntimeSettings) -> OrtResult<SessionBuilder> {
    ensure_initialized()?;
    let mut builder = Session::builder()?;

    if settings.inter_threads > 0 {
        builder = builder.with_inter_threads(settings.inter_threads)?;
    }
    if settings.intra_threads > 0 {
        builder = builder.with_intra_threads(settings.intra_threads)?;
    }

    builder = builder.with_optimization_level(settings.optimization_level.into())?;

    Ok(builder)
}
