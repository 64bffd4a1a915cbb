//! Post-training dynamic int8 quantization of exported graphs.
//!
//! Weights are quantized once, symmetrically per tensor. Activations are
//! quantized at run time by `DynamicQuantizeLinear`, so no calibration data
//! is needed.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use super::proto::{data_type, AttributeProto, GraphProto, ModelProto, NodeProto, TensorProto};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizeOptions {
    /// Also store `Gather` embedding tables as int8.
    pub quantize_embeddings: bool,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self { quantize_embeddings: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationSummary {
    pub source: PathBuf,
    pub path: PathBuf,
    pub quantized_matmuls: usize,
    pub quantized_gathers: usize,
    pub source_bytes: u64,
    pub quantized_bytes: u64,
}

impl QuantizationSummary {
    pub fn size_ratio(&self) -> f64 {
        if self.source_bytes == 0 {
            return 0.0;
        }
        self.quantized_bytes as f64 / self.source_bytes as f64
    }
}

/// Symmetric per-tensor int8 quantization: `q = round(w / scale)` with
/// `scale = max|w| / 127`, clamped to `[-127, 127]`. An all-zero tensor
/// gets scale 1.
pub fn quantize_symmetric(values: &[f32]) -> (Vec<i8>, f32) {
    let max = values.iter().fold(0f32, |m, v| m.max(v.abs()));
    let scale = if max > 0.0 { max / 127.0 } else { 1.0 };
    let quantized = values
        .iter()
        .map(|v| (v / scale).round().clamp(-127.0, 127.0) as i8)
        .collect();
    (quantized, scale)
}

/// Quantizes the graph at `export_path` and writes it to `quantized_path`.
pub fn quantize<P: AsRef<Path>, Q: AsRef<Path>>(export_path: P, quantized_path: Q) -> Result<QuantizationSummary> {
    quantize_with(export_path, quantized_path, QuantizeOptions::default())
}

pub fn quantize_with<P: AsRef<Path>, Q: AsRef<Path>>(
    export_path: P,
    quantized_path: Q,
    options: QuantizeOptions,
) -> Result<QuantizationSummary> {
    let (source, path) = (export_path.as_ref(), quantized_path.as_ref());
    let mut model = ModelProto::read(source)?;
    let graph = model
        .graph
        .take()
        .ok_or_else(|| PipelineError::InvalidGraph(format!("{:?} has no graph", source)))?;

    let quantized = quantize_graph(&graph, options)?;
    model.graph = Some(quantized.graph);
    model.write(path)?;

    let summary = QuantizationSummary {
        source: source.to_path_buf(),
        path: path.to_path_buf(),
        quantized_matmuls: quantized.matmuls,
        quantized_gathers: quantized.gathers,
        source_bytes: fs::metadata(source)?.len(),
        quantized_bytes: fs::metadata(path)?.len(),
    };
    info!(
        "Quantized {} MatMul and {} Gather nodes: {:?} ({} bytes) -> {:?} ({} bytes)",
        summary.quantized_matmuls,
        summary.quantized_gathers,
        summary.source,
        summary.source_bytes,
        summary.path,
        summary.quantized_bytes
    );
    Ok(summary)
}

pub struct QuantizedGraph {
    pub graph: GraphProto,
    pub matmuls: usize,
    pub gathers: usize,
}

struct QuantizedWeight {
    values: String,
    scale: String,
    zero_point: String,
}

struct Rewriter<'a> {
    initializers: HashMap<&'a str, &'a TensorProto>,
    weights: HashMap<String, QuantizedWeight>,
    added: Vec<TensorProto>,
    nodes: Vec<NodeProto>,
}

impl<'a> Rewriter<'a> {
    /// The float matrix initializer named `name`, if there is one.
    fn float_matrix(&self, name: Option<&String>) -> Option<&'a TensorProto> {
        let tensor = *self.initializers.get(name?.as_str())?;
        (tensor.dims.len() == 2 && tensor.data_type == Some(data_type::FLOAT)).then_some(tensor)
    }

    fn quantized_weight(&mut self, tensor: &TensorProto) -> Result<&QuantizedWeight> {
        let name = tensor.name().to_string();
        if !self.weights.contains_key(&name) {
            let values = tensor
                .to_f32()
                .ok_or_else(|| PipelineError::InvalidGraph(format!("{} is not a float tensor", name)))?;
            let (q, scale) = quantize_symmetric(&values);
            let weight = QuantizedWeight {
                values: format!("{}_quantized", name),
                scale: format!("{}_scale", name),
                zero_point: format!("{}_zero_point", name),
            };
            self.added.push(TensorProto::int8(&weight.values, &tensor.dims, &q));
            self.added.push(TensorProto::float32(&weight.scale, &[], &[scale]));
            self.added.push(TensorProto::int8(&weight.zero_point, &[], &[0]));
            self.weights.insert(name.clone(), weight);
        }
        self.weights
            .get(&name)
            .ok_or_else(|| PipelineError::InvalidGraph(format!("lost quantized weight {}", name)))
    }

    /// `y = x W` becomes
    /// `DynamicQuantizeLinear(x) -> MatMulInteger(x_q, W_q) -> Cast -> Mul(x_scale * W_scale)`.
    fn rewrite_matmul(&mut self, node: &NodeProto, weight: &TensorProto) -> Result<()> {
        let (input, output) = match (node.input.first(), node.output.first()) {
            (Some(i), Some(o)) => (i.clone(), o.clone()),
            _ => return Err(PipelineError::InvalidGraph(format!("malformed MatMul {:?}", node.name))),
        };
        let (w_values, w_scale) = {
            let w = self.quantized_weight(weight)?;
            (w.values.clone(), w.scale.clone())
        };
        let x_q = format!("{}/x_quantized", output);
        let x_scale = format!("{}/x_scale", output);
        let x_zero = format!("{}/x_zero_point", output);
        let product = format!("{}/int_product", output);
        let product_f = format!("{}/float_product", output);
        let scale = format!("{}/scale", output);

        self.nodes.push(NodeProto::new(
            "DynamicQuantizeLinear",
            &format!("{}/quantize_input", output),
            &[&input],
            &[&x_q, &x_scale, &x_zero],
        ));
        self.nodes.push(NodeProto::new(
            "MatMulInteger",
            &format!("{}/matmul_integer", output),
            &[&x_q, &w_values, &x_zero],
            &[&product],
        ));
        self.nodes.push(
            NodeProto::new("Cast", &format!("{}/cast", output), &[&product], &[&product_f])
                .with_attribute(AttributeProto::int("to", data_type::FLOAT as i64)),
        );
        self.nodes.push(NodeProto::new(
            "Mul",
            &format!("{}/combine_scales", output),
            &[&x_scale, &w_scale],
            &[&scale],
        ));
        self.nodes
            .push(NodeProto::new("Mul", &format!("{}/rescale", output), &[&product_f, &scale], &[&output]));
        Ok(())
    }

    /// Gathers rows of the int8 table and dequantizes only those rows.
    fn rewrite_gather(&mut self, node: &NodeProto, table: &TensorProto) -> Result<()> {
        let output = node
            .output
            .first()
            .cloned()
            .ok_or_else(|| PipelineError::InvalidGraph(format!("malformed Gather {:?}", node.name)))?;
        let (values, scale, zero_point) = {
            let w = self.quantized_weight(table)?;
            (w.values.clone(), w.scale.clone(), w.zero_point.clone())
        };
        let gathered = format!("{}/quantized", output);

        let mut gather = node.clone();
        gather.input[0] = values;
        gather.output = vec![gathered.clone()];
        self.nodes.push(gather);
        self.nodes.push(NodeProto::new(
            "DequantizeLinear",
            &format!("{}/dequantize", output),
            &[&gathered, &scale, &zero_point],
            &[&output],
        ));
        Ok(())
    }
}

/// Rewrites every `MatMul` whose right operand is a float matrix
/// initializer, and (optionally) every `Gather` over one.
pub fn quantize_graph(graph: &GraphProto, options: QuantizeOptions) -> Result<QuantizedGraph> {
    let mut rewriter = Rewriter {
        initializers: graph.initializer.iter().map(|t| (t.name(), t)).collect(),
        weights: HashMap::new(),
        added: Vec::new(),
        nodes: Vec::with_capacity(graph.node.len()),
    };
    let (mut matmuls, mut gathers) = (0, 0);

    for node in &graph.node {
        match node.op_type() {
            "MatMul" => {
                if let Some(weight) = rewriter.float_matrix(node.input.get(1)) {
                    rewriter.rewrite_matmul(node, weight)?;
                    matmuls += 1;
                    continue;
                }
            }
            "Gather" if options.quantize_embeddings => {
                if let Some(table) = rewriter.float_matrix(node.input.first()) {
                    rewriter.rewrite_gather(node, table)?;
                    gathers += 1;
                    continue;
                }
            }
            _ => {}
        }
        rewriter.nodes.push(node.clone());
    }

    let Rewriter { added, nodes, .. } = rewriter;
    let used: HashSet<&str> = nodes.iter().flat_map(|n| n.input.iter().map(String::as_str)).collect();
    let mut initializer: Vec<TensorProto> = graph
        .initializer
        .iter()
        .filter(|t| used.contains(t.name()))
        .cloned()
        .collect();
    initializer.extend(added);

    Ok(QuantizedGraph {
        graph: GraphProto {
            node: nodes,
            initializer,
            ..graph.clone()
        },
        matmuls,
        gathers,
    })
}
