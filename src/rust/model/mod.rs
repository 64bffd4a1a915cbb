//! DistilBERT sequence classifiers for fine-tuning and inference.
//!
//! [`ModelFactory::build`] returns a model whose parameters are already
//! split into frozen and trainable groups. [`ModelFactory::build_for_inference`]
//! loads trained weights with dropout disabled and every parameter frozen.

mod device;
mod params;

pub use device::resolve_device;
pub use params::{partition_parameters, ParameterGroups};

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{info, warn};
use rust_bert::distilbert::{DistilBertConfig, DistilBertModelClassifier};
use tch::{nn, Device, Kind, Tensor};

use crate::config::ModelSettings;
use crate::data::LABEL_NAMES;
use crate::error::{PipelineError, Result};
use crate::model_manager::{resolve_bundle_dir, CONFIG_FILE, WEIGHTS_FILE};

/// Anything that maps token batches to class logits.
pub trait SequenceClassifier {
    /// Logits of shape `[batch, num_labels]`. `train` enables dropout.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor>;

    fn device(&self) -> Device;
}

/// Reads a DistilBERT `config.json`.
pub fn load_architecture(path: &Path) -> Result<DistilBertConfig> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// A parameter tensor copied to host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

/// DistilBERT encoder with the sequence classification head.
pub struct DistilBertClassifier {
    vs: nn::VarStore,
    net: DistilBertModelClassifier,
    architecture: DistilBertConfig,
    device: Device,
}

impl std::fmt::Debug for DistilBertClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistilBertClassifier")
            .field("layers", &self.architecture.n_layers)
            .field("dim", &self.architecture.dim)
            .field("device", &self.device)
            .finish()
    }
}

impl DistilBertClassifier {
    fn new(architecture: DistilBertConfig, device: Device) -> Result<Self> {
        let vs = nn::VarStore::new(device);
        let net = DistilBertModelClassifier::new(vs.root(), &architecture)?;
        Ok(Self { vs, net, architecture, device })
    }

    pub fn architecture(&self) -> &DistilBertConfig {
        &self.architecture
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn num_labels(&self) -> usize {
        self.architecture.id2label.as_ref().map_or(0, HashMap::len)
    }

    pub fn logits(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let output = self
            .net
            .forward_t(Some(input_ids), Some(attention_mask), None, train)?;
        Ok(output.logits)
    }

    /// Every parameter as `f32` on the host, keyed by variable name.
    pub fn named_weights(&self) -> Result<HashMap<String, HostTensor>> {
        let mut weights = HashMap::new();
        for (name, tensor) in self.vs.variables() {
            let tensor = tensor.detach().to_device(Device::Cpu).to_kind(Kind::Float);
            let shape = tensor.size();
            let data = Vec::<f32>::try_from(&tensor.reshape([-1]))?;
            weights.insert(name, HostTensor { shape, data });
        }
        Ok(weights)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.vs.save(path)?;
        info!("Saved model weights to {:?}", path);
        Ok(())
    }
}

/// A classifier prepared for fine-tuning.
#[derive(Debug)]
pub struct FineTuneModel {
    inner: DistilBertClassifier,
    groups: ParameterGroups,
}

impl FineTuneModel {
    pub fn parameter_groups(&self) -> &ParameterGroups {
        &self.groups
    }

    pub fn classifier(&self) -> &DistilBertClassifier {
        &self.inner
    }

    /// The tensors of the trainable group, in a stable order.
    pub fn trainable_parameters(&self) -> Vec<Tensor> {
        let variables = self.inner.vs.variables();
        self.groups
            .trainable()
            .into_iter()
            .filter_map(|name| variables.get(name).map(Tensor::shallow_clone))
            .collect()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.inner.save(path)
    }
}

impl SequenceClassifier for FineTuneModel {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        self.inner.logits(input_ids, attention_mask, train)
    }

    fn device(&self) -> Device {
        self.inner.device
    }
}

/// A frozen classifier. Forward passes never run in training mode.
#[derive(Debug)]
pub struct InferenceModel {
    inner: DistilBertClassifier,
}

impl InferenceModel {
    pub fn classifier(&self) -> &DistilBertClassifier {
        &self.inner
    }

    pub fn predict(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        tch::no_grad(|| self.inner.logits(input_ids, attention_mask, false))
    }
}

impl SequenceClassifier for InferenceModel {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, _train: bool) -> Result<Tensor> {
        self.predict(input_ids, attention_mask)
    }

    fn device(&self) -> Device {
        self.inner.device
    }
}

fn label_maps(num_labels: usize) -> (HashMap<i64, String>, HashMap<String, i64>) {
    let names: Vec<String> = if num_labels == LABEL_NAMES.len() {
        LABEL_NAMES.iter().map(|s| s.to_string()).collect()
    } else {
        (0..num_labels).map(|i| format!("LABEL_{}", i)).collect()
    };
    let id2label = names.iter().enumerate().map(|(i, n)| (i as i64, n.clone())).collect();
    let label2id = names.into_iter().enumerate().map(|(i, n)| (n, i as i64)).collect();
    (id2label, label2id)
}

/// Builds classifiers from a pretrained bundle or a bare architecture.
pub struct ModelFactory;

impl ModelFactory {
    /// Loads the pretrained bundle named by `settings.model_name` and
    /// prepares it for fine-tuning.
    pub fn build(settings: &ModelSettings, device: Device) -> Result<FineTuneModel> {
        let dir = resolve_bundle_dir(&settings.model_name)?;
        let architecture = load_architecture(&dir.join(CONFIG_FILE))?;
        let weights = dir.join(WEIGHTS_FILE);
        if !weights.exists() {
            return Err(PipelineError::WeightsNotFound { path: weights });
        }
        Self::build_from_architecture(architecture, Some(&weights), settings, device)
    }

    /// Builds a fine-tuning model from `architecture`, loading whatever
    /// `weights` provides. Without weights the model is randomly initialized.
    pub fn build_from_architecture(
        mut architecture: DistilBertConfig,
        weights: Option<&Path>,
        settings: &ModelSettings,
        device: Device,
    ) -> Result<FineTuneModel> {
        settings.validate()?;
        if architecture.n_layers as usize != settings.total_layers {
            return Err(PipelineError::InvalidConfig(format!(
                "total_layers is {} but the model has {} layers",
                settings.total_layers, architecture.n_layers
            )));
        }
        let (id2label, label2id) = label_maps(settings.num_labels);
        architecture.id2label = Some(id2label);
        architecture.label2id = Some(label2id);
        architecture.dropout = settings.dropout_rate;
        architecture.attention_dropout = settings.dropout_rate;

        let mut inner = DistilBertClassifier::new(architecture, device)?;
        if let Some(weights) = weights {
            let missing = inner.vs.load_partial(weights)?;
            if !missing.is_empty() {
                warn!("Newly initialized parameters not found in {:?}: {:?}", weights, missing);
            }
        }

        let variables = inner.vs.variables();
        let groups = partition_parameters(
            variables.keys().map(String::as_str),
            settings.total_layers,
            settings.num_trainable_layers,
        );
        inner.vs.freeze();
        for name in groups.trainable() {
            if let Some(tensor) = variables.get(name) {
                let _ = tensor.set_requires_grad(true);
            }
        }
        info!(
            "Model ready: trainable layers {:?}, {} trainable / {} frozen tensors",
            groups.trainable_layers(),
            groups.trainable().len(),
            groups.frozen.len()
        );

        Ok(FineTuneModel { inner, groups })
    }

    /// Loads trained weights for evaluation and export.
    ///
    /// Fails with `WeightsNotFound` when `weights` is missing and with
    /// `InvalidDevice` when `device` cannot be used.
    pub fn build_for_inference(settings: &ModelSettings, weights: &Path, device: &str) -> Result<InferenceModel> {
        if !weights.is_file() {
            return Err(PipelineError::WeightsNotFound { path: weights.to_path_buf() });
        }
        let device = resolve_device(device)?;
        let dir = resolve_bundle_dir(&settings.model_name)?;
        let architecture = load_architecture(&dir.join(CONFIG_FILE))?;
        Self::inference_from_architecture(architecture, weights, settings, device)
    }

    pub fn inference_from_architecture(
        mut architecture: DistilBertConfig,
        weights: &Path,
        settings: &ModelSettings,
        device: Device,
    ) -> Result<InferenceModel> {
        if !weights.is_file() {
            return Err(PipelineError::WeightsNotFound { path: weights.to_path_buf() });
        }
        let (id2label, label2id) = label_maps(settings.num_labels);
        architecture.id2label = Some(id2label);
        architecture.label2id = Some(label2id);
        architecture.dropout = 0.0;
        architecture.attention_dropout = 0.0;
        architecture.seq_classif_dropout = 0.0;

        let mut inner = DistilBertClassifier::new(architecture, device)?;
        inner.vs.load(weights)?;
        inner.vs.freeze();
        info!("Loaded trained weights from {:?} on {:?}", weights, device);
        Ok(InferenceModel { inner })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A two-layer DistilBERT small enough for unit tests.
    pub(crate) fn tiny_architecture() -> DistilBertConfig {
        serde_json::from_value(serde_json::json!({
            "activation": "gelu",
            "attention_dropout": 0.1,
            "dim": 16,
            "dropout": 0.1,
            "hidden_dim": 32,
            "initializer_range": 0.02,
            "is_decoder": false,
            "max_position_embeddings": 64,
            "model_type": "distilbert",
            "n_heads": 2,
            "n_layers": 2,
            "output_attentions": false,
            "output_hidden_states": false,
            "output_past": false,
            "qa_dropout": 0.1,
            "seq_classif_dropout": 0.2,
            "sinusoidal_pos_embds": false,
            "tie_weights_": true,
            "torchscript": false,
            "use_bfloat16": false,
            "vocab_size": 20
        }))
        .unwrap()
    }

    pub(crate) fn tiny_settings(num_trainable_layers: usize) -> ModelSettings {
        ModelSettings {
            model_name: "unused".into(),
            num_labels: 8,
            dropout_rate: 0.1,
            total_layers: 2,
            num_trainable_layers,
        }
    }

    #[test]
    fn test_freezing_follows_parameter_groups() {
        let model =
            ModelFactory::build_from_architecture(tiny_architecture(), None, &tiny_settings(1), Device::Cpu)
                .unwrap();
        let groups = model.parameter_groups();
        assert_eq!(groups.trainable_layers(), vec![1]);
        assert!(groups.head.iter().any(|n| n.starts_with("classifier.")));

        for (name, tensor) in model.classifier().var_store().variables() {
            assert_eq!(tensor.requires_grad(), groups.is_trainable(&name), "{}", name);
        }
        assert_eq!(model.trainable_parameters().len(), groups.trainable().len());
    }

    #[test]
    fn test_dropout_and_labels_applied() {
        let model =
            ModelFactory::build_from_architecture(tiny_architecture(), None, &tiny_settings(2), Device::Cpu)
                .unwrap();
        let architecture = model.classifier().architecture();
        assert_eq!(architecture.dropout, 0.1);
        assert_eq!(architecture.attention_dropout, 0.1);
        assert_eq!(model.classifier().num_labels(), 8);
        let id2label = architecture.id2label.as_ref().unwrap();
        assert_eq!(id2label[&7], "7_fossil_fuels_needed");
    }

    #[test]
    fn test_layer_count_mismatch() {
        let mut settings = tiny_settings(1);
        settings.total_layers = 6;
        let err =
            ModelFactory::build_from_architecture(tiny_architecture(), None, &settings, Device::Cpu).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_logits_shape() {
        let model =
            ModelFactory::build_from_architecture(tiny_architecture(), None, &tiny_settings(1), Device::Cpu)
                .unwrap();
        let ids = Tensor::from_slice(&[2i64, 5, 6, 3, 0, 0, 2, 7, 3, 0, 0, 0]).view([2, 6]);
        let mask = Tensor::from_slice(&[1i64, 1, 1, 1, 0, 0, 1, 1, 1, 0, 0, 0]).view([2, 6]);
        let logits = model.forward(&ids, &mask, false).unwrap();
        assert_eq!(logits.size(), vec![2, 8]);
    }

    #[test]
    fn test_inference_model_is_frozen() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("model.ot");
        let trained =
            ModelFactory::build_from_architecture(tiny_architecture(), None, &tiny_settings(2), Device::Cpu)
                .unwrap();
        trained.save(&weights).unwrap();

        let model =
            ModelFactory::inference_from_architecture(tiny_architecture(), &weights, &tiny_settings(2), Device::Cpu)
                .unwrap();
        assert_eq!(model.device(), Device::Cpu);
        assert_eq!(model.classifier().architecture().dropout, 0.0);
        for (_, tensor) in model.classifier().var_store().variables() {
            assert!(!tensor.requires_grad());
        }

        let ids = Tensor::from_slice(&[2i64, 5, 3, 0]).view([1, 4]);
        let mask = Tensor::from_slice(&[1i64, 1, 1, 0]).view([1, 4]);
        let a = model.predict(&ids, &mask).unwrap();
        let b = model.predict(&ids, &mask).unwrap();
        assert!(a.allclose(&b, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_missing_weights() {
        let err = ModelFactory::build_for_inference(&tiny_settings(1), Path::new("/nonexistent/model.ot"), "cpu")
            .unwrap_err();
        assert!(matches!(err, PipelineError::WeightsNotFound { .. }));
    }

    #[test]
    fn test_invalid_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = ModelFactory::build_for_inference(&tiny_settings(1), file.path(), "tpu").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDevice { .. }));
    }
}
