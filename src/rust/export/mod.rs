//! ONNX export, dynamic quantization and re-validation of trained models.

mod graph;
pub mod proto;
mod quantize;
mod validate;

pub use graph::{build_graph, export_to_graph, ExportSummary, ATTENTION_MASK, BATCH_AXIS, DUMMY_TEXT, INPUT_IDS, LOGITS};
pub use quantize::{
    quantize, quantize_graph, quantize_symmetric, quantize_with, QuantizationSummary, QuantizeOptions, QuantizedGraph,
};
pub use validate::{graph_logits, load_session, run_logits, validate_graph, verify_export, QuantizationReport};
