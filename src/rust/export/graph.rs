//! Lowers a trained DistilBERT classifier to an ONNX graph.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::info;
use ndarray::Array2;
use rust_bert::Activation;
use tch::{Device, Tensor};
use tokenizers::Tokenizer;

use super::proto::{data_type, AttributeProto, Dim, GraphProto, ModelProto, NodeProto, TensorProto, ValueInfoProto};
use crate::data::encode_data;
use crate::error::{PipelineError, Result};
use crate::model::{DistilBertClassifier, HostTensor, InferenceModel};

pub const INPUT_IDS: &str = "input_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const LOGITS: &str = "logits";
pub const BATCH_AXIS: &str = "batch_size";

/// Text traced through the model when exporting.
pub const DUMMY_TEXT: &str = "This is a dummy input for ONNX conversion.";

const LAYER_NORM_EPS: f32 = 1e-12;
const MASK_FILL: f32 = -1e9;

/// What [`export_to_graph`] wrote, plus the reference output of the source
/// model on the dummy input.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub max_length: usize,
    pub num_labels: usize,
    pub dummy_input_ids: Vec<i64>,
    pub dummy_attention_mask: Vec<i64>,
    pub reference_logits: Vec<f32>,
    pub num_nodes: usize,
    pub num_initializers: usize,
}

/// Exports `model` as an ONNX graph taking `(batch, max_length)` int64
/// `input_ids` and `attention_mask` and producing `logits`.
pub fn export_to_graph<P: AsRef<Path>>(
    model: &InferenceModel,
    tokenizer: &Tokenizer,
    max_length: usize,
    path: P,
) -> Result<ExportSummary> {
    let path = path.as_ref();
    let dummy = encode_data(tokenizer, &[DUMMY_TEXT.to_string()], &[0], max_length)?;
    let example = dummy
        .examples
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Export("dummy input produced no encoding".into()))?;

    let device = model.classifier().var_store().device();
    let ids = Tensor::from_slice(&example.input_ids).view([1, max_length as i64]).to_device(device);
    let mask = Tensor::from_slice(&example.attention_mask).view([1, max_length as i64]).to_device(device);
    let logits = model.predict(&ids, &mask)?;
    let reference_logits = Vec::<f32>::try_from(&logits.to_device(Device::Cpu).reshape([-1]))?;

    let graph = build_graph(model.classifier(), max_length)?;
    let num_nodes = graph.node.len();
    let num_initializers = graph.initializer.len();
    ModelProto::from_graph(graph).write(path)?;
    info!(
        "Exported ONNX graph to {:?} ({} nodes, {} initializers)",
        path, num_nodes, num_initializers
    );

    Ok(ExportSummary {
        path: path.to_path_buf(),
        max_length,
        num_labels: model.classifier().num_labels(),
        dummy_input_ids: example.input_ids,
        dummy_attention_mask: example.attention_mask,
        reference_logits,
        num_nodes,
        num_initializers,
    })
}

/// Accumulates nodes and initializers under unique names.
struct GraphBuilder<'a> {
    weights: &'a HashMap<String, HostTensor>,
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
}

impl<'a> GraphBuilder<'a> {
    fn new(weights: &'a HashMap<String, HostTensor>) -> Self {
        Self {
            weights,
            nodes: Vec::new(),
            initializers: Vec::new(),
        }
    }

    fn weight(&self, name: &str) -> Result<&'a HostTensor> {
        self.weights
            .get(name)
            .ok_or_else(|| PipelineError::Export(format!("missing parameter {}", name)))
    }

    fn initializer(&mut self, tensor: TensorProto) -> String {
        let name = tensor.name().to_string();
        self.initializers.push(tensor);
        name
    }

    /// Copies a parameter into the graph unchanged.
    fn parameter(&mut self, name: &str) -> Result<String> {
        let weight = self.weight(name)?;
        Ok(self.initializer(TensorProto::float32(name, &weight.shape, &weight.data)))
    }

    fn scalar(&mut self, name: &str, value: f32) -> String {
        self.initializer(TensorProto::float32(name, &[], &[value]))
    }

    fn node(&mut self, op: &str, name: &str, inputs: &[&str], attributes: Vec<AttributeProto>) -> String {
        let mut node = NodeProto::new(op, name, inputs, &[name]);
        node.attribute = attributes;
        self.nodes.push(node);
        name.to_string()
    }

    /// `x W^T + b` as `MatMul` against the transposed weight, then `Add`.
    fn linear(&mut self, input: &str, prefix: &str, name: &str) -> Result<String> {
        let weight = self.weight(&format!("{}.weight", prefix))?;
        let [out_features, in_features] = weight.shape[..] else {
            return Err(PipelineError::Export(format!("{}.weight is not a matrix", prefix)));
        };
        let matrix = Array2::from_shape_vec((out_features as usize, in_features as usize), weight.data.clone())
            .map_err(|e| PipelineError::Export(format!("{}.weight: {}", prefix, e)))?;
        let transposed: Vec<f32> = matrix.reversed_axes().iter().copied().collect();
        let weight_name = self.initializer(TensorProto::float32(
            &format!("{}.weight_t", prefix),
            &[in_features, out_features],
            &transposed,
        ));
        let bias_name = self.parameter(&format!("{}.bias", prefix))?;

        let product = self.node("MatMul", &format!("{}/matmul", name), &[input, &weight_name], vec![]);
        Ok(self.node("Add", name, &[&product, &bias_name], vec![]))
    }

    /// Projects `input` and splits it into heads, transposed by `perm`.
    fn attention_heads(
        &mut self,
        input: &str,
        prefix: &str,
        name: &str,
        which: &str,
        split_shape: &str,
        perm: &[i64],
    ) -> Result<String> {
        let projected = self.linear(input, &format!("{}.attention.{}", prefix, which), &format!("{}/{}", name, which))?;
        let split = self.node("Reshape", &format!("{}/{}/split", name, which), &[&projected, split_shape], vec![]);
        Ok(self.node(
            "Transpose",
            &format!("{}/{}/heads", name, which),
            &[&split],
            vec![AttributeProto::ints("perm", perm)],
        ))
    }

    fn layer_norm(&mut self, input: &str, prefix: &str, name: &str) -> Result<String> {
        let scale = self.parameter(&format!("{}.weight", prefix))?;
        let bias = self.parameter(&format!("{}.bias", prefix))?;
        Ok(self.node(
            "LayerNormalization",
            name,
            &[input, &scale, &bias],
            vec![AttributeProto::int("axis", -1), AttributeProto::float("epsilon", LAYER_NORM_EPS)],
        ))
    }

    fn gelu(&mut self, input: &str, name: &str) -> String {
        let sqrt2 = self.scalar(&format!("{}/sqrt2", name), std::f32::consts::SQRT_2);
        let one = self.scalar(&format!("{}/one", name), 1.0);
        let half = self.scalar(&format!("{}/half", name), 0.5);
        let scaled = self.node("Div", &format!("{}/div", name), &[input, &sqrt2], vec![]);
        let erf = self.node("Erf", &format!("{}/erf", name), &[&scaled], vec![]);
        let shifted = self.node("Add", &format!("{}/add", name), &[&erf, &one], vec![]);
        let gated = self.node("Mul", &format!("{}/mul", name), &[input, &shifted], vec![]);
        self.node("Mul", name, &[&gated, &half], vec![])
    }

    fn finish(self, inputs: Vec<ValueInfoProto>, outputs: Vec<ValueInfoProto>) -> GraphProto {
        GraphProto {
            node: self.nodes,
            name: Some("distilbert_sequence_classifier".into()),
            initializer: self.initializers,
            input: inputs,
            output: outputs,
            ..Default::default()
        }
    }
}

/// Builds the inference graph of `classifier` for sequences of `max_length`.
pub fn build_graph(classifier: &DistilBertClassifier, max_length: usize) -> Result<GraphProto> {
    let architecture = classifier.architecture();
    let dim = architecture.dim;
    let heads = architecture.n_heads;
    if heads <= 0 || dim % heads != 0 {
        return Err(PipelineError::Export(format!("dim {} is not divisible by {} heads", dim, heads)));
    }
    if max_length as i64 > architecture.max_position_embeddings {
        return Err(PipelineError::Export(format!(
            "max_length {} exceeds the {} position embeddings",
            max_length, architecture.max_position_embeddings
        )));
    }
    let head_dim = dim / heads;
    let use_gelu = match &architecture.activation {
        Activation::gelu => true,
        Activation::relu => false,
        other => {
            return Err(PipelineError::Export(format!("unsupported activation {:?}", other)));
        }
    };

    let weights = classifier.named_weights()?;
    let mut g = GraphBuilder::new(&weights);
    let seq = max_length as i64;

    // Additive attention bias: 0 where attended, MASK_FILL where padded.
    let mask_float = g.node(
        "Cast",
        "mask/cast",
        &[ATTENTION_MASK],
        vec![AttributeProto::int("to", data_type::FLOAT as i64)],
    );
    let one = g.scalar("mask/one", 1.0);
    let fill = g.scalar("mask/fill", MASK_FILL);
    let inverted = g.node("Sub", "mask/invert", &[&one, &mask_float], vec![]);
    let bias = g.node("Mul", "mask/scale", &[&inverted, &fill], vec![]);
    let axes = g.initializer(TensorProto::int64("mask/axes", &[2], &[1, 2]));
    let mask_bias = g.node("Unsqueeze", "mask/bias", &[&bias, &axes], vec![]);

    // Embeddings.
    let word_table = g.parameter("distilbert.embeddings.word_embeddings.weight")?;
    let words = g.node(
        "Gather",
        "embeddings/words",
        &[&word_table, INPUT_IDS],
        vec![AttributeProto::int("axis", 0)],
    );
    let position_table = g.parameter("distilbert.embeddings.position_embeddings.weight")?;
    let position_ids = g.initializer(TensorProto::int64(
        "embeddings/position_ids",
        &[seq],
        &(0..seq).collect::<Vec<_>>(),
    ));
    let positions = g.node(
        "Gather",
        "embeddings/positions",
        &[&position_table, &position_ids],
        vec![AttributeProto::int("axis", 0)],
    );
    let summed = g.node("Add", "embeddings/sum", &[&words, &positions], vec![]);
    let mut hidden = g.layer_norm(&summed, "distilbert.embeddings.LayerNorm", "embeddings/norm")?;

    let split_shape = g.initializer(TensorProto::int64("shape/split_heads", &[4], &[0, 0, heads, head_dim]));
    let merge_shape = g.initializer(TensorProto::int64("shape/merge_heads", &[3], &[0, 0, dim]));
    let scale = g.scalar("attention/scale", 1.0 / (head_dim as f32).sqrt());

    for layer in 0..architecture.n_layers {
        let p = format!("distilbert.transformer.layer.{}", layer);
        let n = format!("layer{}", layer);

        let q = g.attention_heads(&hidden, &p, &n, "q_lin", &split_shape, &[0, 2, 1, 3])?;
        let k = g.attention_heads(&hidden, &p, &n, "k_lin", &split_shape, &[0, 2, 3, 1])?;
        let v = g.attention_heads(&hidden, &p, &n, "v_lin", &split_shape, &[0, 2, 1, 3])?;

        let q = g.node("Mul", &format!("{}/q_scaled", n), &[&q, &scale], vec![]);
        let scores = g.node("MatMul", &format!("{}/scores", n), &[&q, &k], vec![]);
        let masked = g.node("Add", &format!("{}/masked_scores", n), &[&scores, &mask_bias], vec![]);
        let probs = g.node(
            "Softmax",
            &format!("{}/probs", n),
            &[&masked],
            vec![AttributeProto::int("axis", -1)],
        );
        let context = g.node("MatMul", &format!("{}/context", n), &[&probs, &v], vec![]);
        let context = g.node(
            "Transpose",
            &format!("{}/context/merge", n),
            &[&context],
            vec![AttributeProto::ints("perm", &[0, 2, 1, 3])],
        );
        let context = g.node("Reshape", &format!("{}/context/flat", n), &[&context, &merge_shape], vec![]);
        let attended = g.linear(&context, &format!("{}.attention.out_lin", p), &format!("{}/out_lin", n))?;

        let residual = g.node("Add", &format!("{}/sa_residual", n), &[&attended, &hidden], vec![]);
        let sa = g.layer_norm(&residual, &format!("{}.sa_layer_norm", p), &format!("{}/sa_norm", n))?;

        let inner = g.linear(&sa, &format!("{}.ffn.lin1", p), &format!("{}/lin1", n))?;
        let activated = if use_gelu {
            g.gelu(&inner, &format!("{}/gelu", n))
        } else {
            g.node("Relu", &format!("{}/relu", n), &[&inner], vec![])
        };
        let ffn = g.linear(&activated, &format!("{}.ffn.lin2", p), &format!("{}/lin2", n))?;
        let residual = g.node("Add", &format!("{}/ffn_residual", n), &[&ffn, &sa], vec![]);
        hidden = g.layer_norm(&residual, &format!("{}.output_layer_norm", p), &format!("{}/out_norm", n))?;
    }

    // Classification head on the first token.
    let first = g.initializer(TensorProto::int64("head/first_token", &[], &[0]));
    let pooled = g.node(
        "Gather",
        "head/cls",
        &[&hidden, &first],
        vec![AttributeProto::int("axis", 1)],
    );
    let pre = g.linear(&pooled, "pre_classifier", "head/pre_classifier")?;
    let pre = g.node("Relu", "head/relu", &[&pre], vec![]);
    let projected = g.linear(&pre, "classifier", "head/classifier")?;
    g.node("Identity", LOGITS, &[&projected], vec![]);

    let batch_by_seq = [Dim::Dynamic(BATCH_AXIS), Dim::Fixed(seq)];
    let inputs = vec![
        ValueInfoProto::tensor(INPUT_IDS, data_type::INT64, &batch_by_seq),
        ValueInfoProto::tensor(ATTENTION_MASK, data_type::INT64, &batch_by_seq),
    ];
    let outputs = vec![ValueInfoProto::tensor(
        LOGITS,
        data_type::FLOAT,
        &[Dim::Dynamic(BATCH_AXIS), Dim::Fixed(classifier.num_labels() as i64)],
    )];
    Ok(g.finish(inputs, outputs))
}
