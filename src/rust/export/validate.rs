//! Scoring exported graphs with ONNX Runtime.

use std::collections::HashMap;
use std::path::Path;

use log::{error, info};
use ndarray::{Array2, Ix2};
use ort::session::Session;
use ort::value::Tensor;

use super::graph::{ExportSummary, ATTENTION_MASK, INPUT_IDS, LOGITS};
use crate::config::QuantizationTolerance;
use crate::data::DataLoader;
use crate::error::{PipelineError, Result};
use crate::metrics::{agreement, argmax};
use crate::runtime::{create_session_builder, RuntimeSettings};
use crate::train::EvalOutcome;

pub fn load_session<P: AsRef<Path>>(path: P, settings: &RuntimeSettings) -> Result<Session> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PipelineError::InvalidGraph(format!("{:?} does not exist", path)));
    }
    Ok(create_session_builder(settings)?.commit_from_file(path)?)
}

/// Runs one `(rows, seq_len)` batch and returns its logits, row-major.
pub fn run_logits(session: &Session, input_ids: Vec<i64>, attention_mask: Vec<i64>, rows: usize) -> Result<Vec<Vec<f32>>> {
    let seq_len = if rows == 0 { 0 } else { input_ids.len() / rows };
    let shape_error = |e: ndarray::ShapeError| PipelineError::InvalidGraph(e.to_string());
    let ids = Array2::from_shape_vec((rows, seq_len), input_ids).map_err(shape_error)?;
    let mask = Array2::from_shape_vec((rows, seq_len), attention_mask).map_err(shape_error)?;

    let mut inputs = HashMap::new();
    inputs.insert(INPUT_IDS, Tensor::from_array(ids)?);
    inputs.insert(ATTENTION_MASK, Tensor::from_array(mask)?);

    let outputs = session.run(inputs)?;
    let logits = outputs[LOGITS]
        .try_extract_tensor::<f32>()?
        .into_dimensionality::<Ix2>()
        .map_err(shape_error)?;
    Ok(logits.rows().into_iter().map(|row| row.to_vec()).collect())
}

/// Labels and logits of every example in `loader`, in loader order.
pub fn graph_logits(session: &Session, loader: &DataLoader) -> Result<(Vec<i64>, Vec<Vec<f32>>)> {
    let mut labels = Vec::with_capacity(loader.num_examples());
    let mut logits = Vec::with_capacity(loader.num_examples());
    for batch in loader {
        let rows = batch.len();
        logits.extend(run_logits(session, batch.input_ids, batch.attention_mask, rows)?);
        labels.extend(batch.labels);
    }
    Ok((labels, logits))
}

/// Accuracy and weighted F1 of the graph at `path` over `loader`.
pub fn validate_graph<P: AsRef<Path>>(path: P, loader: &DataLoader, settings: &RuntimeSettings) -> Result<EvalOutcome> {
    let path = path.as_ref();
    let session = load_session(path, settings)?;
    let (labels, logits) = graph_logits(&session, loader)?;
    let predictions = logits.iter().map(|row| argmax(row)).collect();
    let outcome = EvalOutcome::new(labels, predictions);
    info!(
        "{:?}: accuracy {:.4}, weighted f1 {:.4} over {} examples",
        path,
        outcome.accuracy,
        outcome.f1,
        outcome.labels.len()
    );
    Ok(outcome)
}

/// Runs the exported graph on the dummy input and compares with the logits
/// the source model produced. Returns the largest absolute difference.
pub fn verify_export(summary: &ExportSummary, settings: &RuntimeSettings, atol: f32) -> Result<f32> {
    let session = load_session(&summary.path, settings)?;
    let logits = run_logits(
        &session,
        summary.dummy_input_ids.clone(),
        summary.dummy_attention_mask.clone(),
        1,
    )?;
    let exported = logits.into_iter().next().unwrap_or_default();
    if exported.len() != summary.reference_logits.len() {
        return Err(PipelineError::Export(format!(
            "graph produced {} logits, model produced {}",
            exported.len(),
            summary.reference_logits.len()
        )));
    }
    let max_diff = exported
        .iter()
        .zip(&summary.reference_logits)
        .map(|(a, b)| (a - b).abs())
        .fold(0f32, f32::max);
    if max_diff > atol {
        error!("Exported graph differs from the model by {} (tolerance {})", max_diff, atol);
        return Err(PipelineError::Export(format!(
            "exported logits differ by {} (tolerance {})",
            max_diff, atol
        )));
    }
    info!("Exported graph matches the model within {}", max_diff);
    Ok(max_diff)
}

/// Full-precision versus quantized scores on the same data.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationReport {
    pub reference: EvalOutcome,
    pub quantized: EvalOutcome,
    pub accuracy_drop: f64,
    pub f1_drop: f64,
    /// Fraction of examples where both graphs predict the same class.
    pub agreement: f64,
}

impl QuantizationReport {
    pub fn new(reference: EvalOutcome, quantized: EvalOutcome) -> Self {
        Self {
            accuracy_drop: reference.accuracy - quantized.accuracy,
            f1_drop: reference.f1 - quantized.f1,
            agreement: agreement(&reference.predictions, &quantized.predictions),
            reference,
            quantized,
        }
    }

    /// Fails with `QuantizationRegression` when any bound is exceeded.
    pub fn enforce(&self, tolerance: &QuantizationTolerance) -> Result<()> {
        let within = self.accuracy_drop <= tolerance.max_accuracy_drop
            && self.f1_drop <= tolerance.max_f1_drop
            && self.agreement >= tolerance.min_agreement;
        if within {
            info!(
                "Quantized graph accepted: accuracy drop {:.4}, f1 drop {:.4}, agreement {:.4}",
                self.accuracy_drop, self.f1_drop, self.agreement
            );
            return Ok(());
        }
        error!(
            "Quantized graph rejected: accuracy drop {:.4} (max {}), f1 drop {:.4} (max {}), agreement {:.4} (min {})",
            self.accuracy_drop,
            tolerance.max_accuracy_drop,
            self.f1_drop,
            tolerance.max_f1_drop,
            self.agreement,
            tolerance.min_agreement
        );
        Err(PipelineError::QuantizationRegression {
            accuracy_drop: self.accuracy_drop,
            f1_drop: self.f1_drop,
            agreement: self.agreement,
        })
    }
}
