//! The subset of the ONNX protobuf schema the exporter and quantizer use.
//!
//! Field numbers follow `onnx.proto` (proto2), so scalar fields are optional
//! and repeated scalars are written unpacked.

use prost::Message;

use crate::error::Result;

pub const IR_VERSION: i64 = 8;
pub const OPSET_VERSION: i64 = 17;

/// `TensorProto.DataType` values.
pub mod data_type {
    pub const FLOAT: i32 = 1;
    pub const UINT8: i32 = 2;
    pub const INT8: i32 = 3;
    pub const INT32: i32 = 6;
    pub const INT64: i32 = 7;
}

/// `AttributeProto.AttributeType` values.
pub mod attribute_type {
    pub const FLOAT: i32 = 1;
    pub const INT: i32 = 2;
    pub const TENSOR: i32 = 4;
    pub const INTS: i32 = 7;
}

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, optional, tag = "1")]
    pub ir_version: Option<i64>,
    #[prost(string, optional, tag = "2")]
    pub producer_name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub producer_version: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub domain: Option<String>,
    #[prost(int64, optional, tag = "5")]
    pub model_version: Option<i64>,
    #[prost(string, optional, tag = "6")]
    pub doc_string: Option<String>,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    #[prost(string, optional, tag = "1")]
    pub domain: Option<String>,
    #[prost(int64, optional, tag = "2")]
    pub version: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
    #[prost(string, optional, tag = "10")]
    pub doc_string: Option<String>,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "13")]
    pub value_info: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub op_type: Option<String>,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
    #[prost(string, optional, tag = "6")]
    pub doc_string: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub domain: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(float, optional, tag = "2")]
    pub f: Option<f32>,
    #[prost(int64, optional, tag = "3")]
    pub i: Option<i64>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub s: Option<Vec<u8>>,
    #[prost(message, optional, tag = "5")]
    pub t: Option<TensorProto>,
    #[prost(float, repeated, packed = "false", tag = "7")]
    pub floats: Vec<f32>,
    #[prost(int64, repeated, packed = "false", tag = "8")]
    pub ints: Vec<i64>,
    #[prost(int32, optional, tag = "20")]
    pub r#type: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int64, repeated, packed = "false", tag = "1")]
    pub dims: Vec<i64>,
    #[prost(int32, optional, tag = "2")]
    pub data_type: Option<i32>,
    #[prost(float, repeated, tag = "4")]
    pub float_data: Vec<f32>,
    #[prost(int32, repeated, tag = "5")]
    pub int32_data: Vec<i32>,
    #[prost(int64, repeated, tag = "7")]
    pub int64_data: Vec<i64>,
    #[prost(string, optional, tag = "8")]
    pub name: Option<String>,
    #[prost(bytes = "vec", optional, tag = "9")]
    pub raw_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(oneof = "type_proto::Value", tags = "1")]
    pub value: Option<type_proto::Value>,
}

pub mod type_proto {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        TensorType(Tensor),
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Tensor {
        #[prost(int32, optional, tag = "1")]
        pub elem_type: Option<i32>,
        #[prost(message, optional, tag = "2")]
        pub shape: Option<super::TensorShapeProto>,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<tensor_shape_proto::Dimension>,
}

pub mod tensor_shape_proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Dimension {
        #[prost(oneof = "dimension::Value", tags = "1, 2")]
        pub value: Option<dimension::Value>,
    }

    pub mod dimension {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Value {
            #[prost(int64, tag = "1")]
            DimValue(i64),
            #[prost(string, tag = "2")]
            DimParam(String),
        }
    }
}

impl TensorProto {
    pub fn float32(name: &str, dims: &[i64], values: &[f32]) -> Self {
        let raw = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::raw(name, data_type::FLOAT, dims, raw)
    }

    pub fn int64(name: &str, dims: &[i64], values: &[i64]) -> Self {
        let raw = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::raw(name, data_type::INT64, dims, raw)
    }

    pub fn int8(name: &str, dims: &[i64], values: &[i8]) -> Self {
        let raw = values.iter().map(|v| *v as u8).collect();
        Self::raw(name, data_type::INT8, dims, raw)
    }

    fn raw(name: &str, data_type: i32, dims: &[i64], raw: Vec<u8>) -> Self {
        Self {
            dims: dims.to_vec(),
            data_type: Some(data_type),
            name: Some(name.to_string()),
            raw_data: Some(raw),
            ..Default::default()
        }
    }

    /// Float contents, from `raw_data` or `float_data`.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        if self.data_type != Some(data_type::FLOAT) {
            return None;
        }
        match &self.raw_data {
            Some(raw) => Some(
                raw.chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
            None => Some(self.float_data.clone()),
        }
    }

    pub fn to_i8(&self) -> Option<Vec<i8>> {
        if self.data_type != Some(data_type::INT8) {
            return None;
        }
        self.raw_data.as_ref().map(|raw| raw.iter().map(|b| *b as i8).collect())
    }
}

impl AttributeProto {
    pub fn int(name: &str, value: i64) -> Self {
        Self {
            name: Some(name.to_string()),
            i: Some(value),
            r#type: Some(attribute_type::INT),
            ..Default::default()
        }
    }

    pub fn float(name: &str, value: f32) -> Self {
        Self {
            name: Some(name.to_string()),
            f: Some(value),
            r#type: Some(attribute_type::FLOAT),
            ..Default::default()
        }
    }

    pub fn ints(name: &str, values: &[i64]) -> Self {
        Self {
            name: Some(name.to_string()),
            ints: values.to_vec(),
            r#type: Some(attribute_type::INTS),
            ..Default::default()
        }
    }

    pub fn tensor(name: &str, value: TensorProto) -> Self {
        Self {
            name: Some(name.to_string()),
            t: Some(value),
            r#type: Some(attribute_type::TENSOR),
            ..Default::default()
        }
    }
}

impl NodeProto {
    pub fn new(op_type: &str, name: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            name: Some(name.to_string()),
            op_type: Some(op_type.to_string()),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeProto) -> Self {
        self.attribute.push(attribute);
        self
    }

}

/// Dimension of a graph input or output: fixed size or a named dynamic axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(i64),
    Dynamic(&'static str),
}

impl ValueInfoProto {
    pub fn tensor(name: &str, elem_type: i32, dims: &[Dim]) -> Self {
        use tensor_shape_proto::{dimension, Dimension};
        let dim = dims
            .iter()
            .map(|d| Dimension {
                value: Some(match d {
                    Dim::Fixed(v) => dimension::Value::DimValue(*v),
                    Dim::Dynamic(p) => dimension::Value::DimParam(p.to_string()),
                }),
            })
            .collect();
        Self {
            name: Some(name.to_string()),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: Some(elem_type),
                    shape: Some(TensorShapeProto { dim }),
                })),
            }),
        }
    }

    /// Element type and dims, if this is a tensor value.
    pub fn tensor_shape(&self) -> Option<(i32, Vec<Dim>)> {
        use tensor_shape_proto::dimension;
        let type_proto::Value::TensorType(tensor) = self.r#type.as_ref()?.value.as_ref()?;
        let dims = tensor
            .shape
            .as_ref()?
            .dim
            .iter()
            .map(|d| match &d.value {
                Some(dimension::Value::DimValue(v)) => Dim::Fixed(*v),
                _ => Dim::Dynamic("?"),
            })
            .collect();
        Some((tensor.elem_type.unwrap_or_default(), dims))
    }
}

impl ModelProto {
    pub fn from_graph(graph: GraphProto) -> Self {
        Self {
            ir_version: Some(IR_VERSION),
            producer_name: Some(env!("CARGO_PKG_NAME").to_string()),
            producer_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            graph: Some(graph),
            opset_import: vec![OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(OPSET_VERSION),
            }],
            ..Default::default()
        }
    }

    pub fn read(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::decode(bytes.as_slice())?)
    }

    pub fn write(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.encode_to_vec())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_tensor_contents() {
        let t = TensorProto::float32("w", &[2], &[1.5, -2.0]);
        assert_eq!(t.to_f32().unwrap(), vec![1.5, -2.0]);
        assert_eq!(t.raw_data.as_ref().unwrap().len(), 8);
        assert!(t.to_i8().is_none());

        let q = TensorProto::int8("q", &[3], &[-127, 0, 127]);
        assert_eq!(q.to_i8().unwrap(), vec![-127, 0, 127]);
    }

    #[test]
    fn test_zero_attribute_is_still_written() {
        let node = NodeProto::new("Gather", "g", &["a", "b"], &["c"]).with_attribute(AttributeProto::int("axis", 0));
        let decoded = NodeProto::decode(node.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.attribute[0].i, Some(0));
        assert_eq!(decoded.op_type(), "Gather");
    }

    #[test]
    fn test_model_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.onnx");
        let graph = GraphProto {
            name: Some("g".into()),
            input: vec![ValueInfoProto::tensor(
                "input_ids",
                data_type::INT64,
                &[Dim::Dynamic("batch_size"), Dim::Fixed(8)],
            )],
            ..Default::default()
        };
        ModelProto::from_graph(graph).write(&path).unwrap();

        let model = ModelProto::read(&path).unwrap();
        assert_eq!(model.ir_version, Some(IR_VERSION));
        assert_eq!(model.opset_import[0].version, Some(OPSET_VERSION));
        let input = &model.graph.unwrap().input[0];
        let (elem, dims) = input.tensor_shape().unwrap();
        assert_eq!(elem, data_type::INT64);
        assert_eq!(dims, vec![Dim::Dynamic("?"), Dim::Fixed(8)]);
    }
}
