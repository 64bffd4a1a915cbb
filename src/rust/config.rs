//! YAML configuration for every stage of the pipeline.
//!
//! Each stage receives the settings struct it needs. `config.yaml` stays a
//! flat key/value file; the nested structs are flattened into it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::runtime::RuntimeSettings;

/// Reads and deserializes a YAML file, naming the file on failure.
pub fn load_yaml<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    serde_yaml::from_str(&contents).map_err(|source| PipelineError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_num_labels() -> usize {
    8
}

fn default_total_layers() -> usize {
    6
}

fn default_label_column() -> String {
    "label".to_string()
}

fn default_text_column() -> String {
    "quote".to_string()
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_seed() -> u64 {
    42
}

/// Model factory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Local bundle directory or the name of a built-in pretrained model.
    pub model_name: String,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    pub dropout_rate: f64,
    #[serde(default = "default_total_layers")]
    pub total_layers: usize,
    pub num_trainable_layers: usize,
}

impl ModelSettings {
    pub fn validate(&self) -> Result<()> {
        if self.num_labels == 0 {
            return Err(PipelineError::InvalidConfig("num_labels must be positive".into()));
        }
        if self.num_trainable_layers > self.total_layers {
            return Err(PipelineError::InvalidConfig(format!(
                "num_trainable_layers ({}) exceeds total_layers ({})",
                self.num_trainable_layers, self.total_layers
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(PipelineError::InvalidConfig(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        Ok(())
    }
}

/// Tokenization and batching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderSettings {
    /// Path to a `tokenizer.json`, a bundle directory, or a built-in model name.
    pub tokenizer_model: String,
    pub max_length: usize,
    pub batch_size: usize,
    #[serde(default = "default_label_column", alias = "class_col")]
    pub label_column: String,
    #[serde(default = "default_text_column")]
    pub text_column: String,
}

impl LoaderSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_length == 0 {
            return Err(PipelineError::InvalidConfig("max_length must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::InvalidConfig("batch_size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSettings {
    pub learning_rate: f64,
    pub step_size: usize,
    pub gamma: f64,
    pub epochs: usize,
}

/// Contents of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(flatten)]
    pub model: ModelSettings,
    #[serde(flatten)]
    pub loader: LoaderSettings,
    #[serde(flatten)]
    pub training: TrainingSettings,
    pub trainpath: PathBuf,
    pub valpath: PathBuf,
    #[serde(default)]
    pub testpath: Option<PathBuf>,
    pub trained_model_path: PathBuf,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl PipelineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.loader.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AugmentAction {
    Insert,
    Substitute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AugmenterKind {
    #[default]
    Contextual,
    Swap,
}

fn default_n_splits() -> usize {
    5
}

fn default_augment_max_length() -> usize {
    128
}

/// Contents of `augmentation_config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    pub data_path: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub augmenter: AugmenterKind,
    /// Masked language model bundle used by the contextual augmenter.
    pub augmenter_model: String,
    pub augment_action: AugmentAction,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_n_splits")]
    pub n_splits: usize,
    #[serde(default = "default_seed")]
    pub random_seed: u64,
    #[serde(default = "default_label_column", alias = "class_col")]
    pub label_column: String,
    #[serde(default = "default_text_column")]
    pub text_column: String,
    #[serde(default = "default_augment_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub save_logs_to_file: bool,
    #[serde(default)]
    pub log_file_path: Option<PathBuf>,
}

impl AugmentationConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_yaml(path)?;
        if config.n_splits < 2 {
            return Err(PipelineError::InvalidConfig(format!(
                "n_splits must be at least 2, got {}",
                config.n_splits
            )));
        }
        Ok(config)
    }

    /// Log file to write to, if file logging is enabled.
    pub fn log_file(&self) -> Option<&Path> {
        if self.save_logs_to_file {
            self.log_file_path.as_deref()
        } else {
            None
        }
    }
}

/// A float search range. `range` is `[low, high]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatRange {
    pub range: [f64; 2],
    #[serde(default)]
    pub log: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntRange {
    pub range: [i64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choices {
    pub range: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrunerSettings {
    #[serde(default = "default_startup_trials")]
    pub n_startup_trials: usize,
    #[serde(default = "default_warmup_steps")]
    pub n_warmup_steps: usize,
}

fn default_startup_trials() -> usize {
    5
}

fn default_warmup_steps() -> usize {
    1
}

impl Default for PrunerSettings {
    fn default() -> Self {
        Self {
            n_startup_trials: default_startup_trials(),
            n_warmup_steps: default_warmup_steps(),
        }
    }
}

fn default_n_trials() -> usize {
    20
}

/// Contents of `hyperoptim_config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpaceConfig {
    pub learning_rate: FloatRange,
    pub num_trainable_layers: IntRange,
    pub dropout_rate: FloatRange,
    pub batch_size: Choices,
    pub epochs: IntRange,
    pub step_size: IntRange,
    pub gamma: FloatRange,
    #[serde(default = "default_n_trials")]
    pub n_trials: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub pruner: PrunerSettings,
}

impl SearchSpaceConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let floats = [
            ("learning_rate", &self.learning_rate),
            ("dropout_rate", &self.dropout_rate),
            ("gamma", &self.gamma),
        ];
        for (name, r) in floats {
            if r.range[0] > r.range[1] || (r.log && r.range[0] <= 0.0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "invalid range for {}: {:?}",
                    name, r.range
                )));
            }
        }
        let ints = [
            ("num_trainable_layers", &self.num_trainable_layers),
            ("epochs", &self.epochs),
            ("step_size", &self.step_size),
        ];
        for (name, r) in ints {
            if r.range[0] > r.range[1] {
                return Err(PipelineError::InvalidConfig(format!(
                    "invalid range for {}: {:?}",
                    name, r.range
                )));
            }
        }
        if self.batch_size.range.is_empty() {
            return Err(PipelineError::InvalidConfig("batch_size choices are empty".into()));
        }
        Ok(())
    }
}

/// Bounds on how much the quantized graph may regress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationTolerance {
    #[serde(default = "default_max_drop")]
    pub max_accuracy_drop: f64,
    #[serde(default = "default_max_drop")]
    pub max_f1_drop: f64,
    #[serde(default = "default_min_agreement")]
    pub min_agreement: f64,
}

fn default_max_drop() -> f64 {
    0.02
}

fn default_min_agreement() -> f64 {
    0.95
}

impl Default for QuantizationTolerance {
    fn default() -> Self {
        Self {
            max_accuracy_drop: default_max_drop(),
            max_f1_drop: default_max_drop(),
            min_agreement: default_min_agreement(),
        }
    }
}

fn default_export_atol() -> f32 {
    1e-3
}

fn default_quantize_embeddings() -> bool {
    true
}

/// Contents of `quantization_config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub onnx_path: PathBuf,
    pub quantized_onnx_path: PathBuf,
    #[serde(default)]
    pub tolerance: QuantizationTolerance,
    #[serde(default = "default_export_atol")]
    pub export_atol: f32,
    #[serde(default = "default_quantize_embeddings")]
    pub quantize_embeddings: bool,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl QuantizationConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_yaml(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
model_name: distilbert-base-uncased
num_labels: 8
dropout_rate: 0.1
total_layers: 6
num_trainable_layers: 2
trainpath: data/train.parquet
valpath: data/val.parquet
tokenizer_model: distilbert-base-uncased
max_length: 365
batch_size: 16
learning_rate: 2.0e-5
step_size: 2
gamma: 0.1
epochs: 4
trained_model_path: models/distilbert.ot
class_col: label
"#;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_flat_config_fills_every_section() {
        let file = write_temp(CONFIG);
        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.model.num_trainable_layers, 2);
        assert_eq!(config.loader.max_length, 365);
        assert_eq!(config.loader.label_column, "label");
        assert_eq!(config.loader.text_column, "quote");
        assert_eq!(config.training.epochs, 4);
        assert!((config.training.learning_rate - 2.0e-5).abs() < 1e-12);
        assert_eq!(config.device, "auto");
        assert_eq!(config.testpath, None);
    }

    #[test]
    fn test_missing_key_names_file() {
        let file = write_temp("model_name: x\n");
        let err = PipelineConfig::from_file(file.path()).unwrap_err();
        match err {
            PipelineError::ConfigParse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rejects_too_many_trainable_layers() {
        let file = write_temp(&CONFIG.replace("num_trainable_layers: 2", "num_trainable_layers: 7"));
        let err = PipelineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_search_space_config() {
        let file = write_temp(
            r#"
learning_rate: {range: [1.0e-5, 1.0e-3], log: true}
num_trainable_layers: {range: [1, 6]}
dropout_rate: {range: [0.1, 0.5]}
batch_size: {range: [16, 32]}
epochs: {range: [2, 4]}
step_size: {range: [1, 3]}
gamma: {range: [0.1, 0.9]}
n_trials: 3
"#,
        );
        let space = SearchSpaceConfig::from_file(file.path()).unwrap();
        assert!(space.learning_rate.log);
        assert!(!space.gamma.log);
        assert_eq!(space.batch_size.range, vec![16, 32]);
        assert_eq!(space.n_trials, 3);
        assert_eq!(space.pruner, PrunerSettings::default());
    }

    #[test]
    fn test_augmentation_config_log_file() {
        let file = write_temp(
            r#"
data_path: data/train.parquet
output_dir: data/folds
augmenter_model: distilbert-base-uncased
augment_action: substitute
save_logs_to_file: true
log_file_path: logs/augment.log
"#,
        );
        let config = AugmentationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.augment_action, AugmentAction::Substitute);
        assert_eq!(config.augmenter, AugmenterKind::Contextual);
        assert_eq!(config.n_splits, 5);
        assert_eq!(config.log_file(), Some(Path::new("logs/augment.log")));
    }

    #[test]
    fn test_quantization_defaults() {
        let file = write_temp("onnx_path: m.onnx\nquantized_onnx_path: m.int8.onnx\n");
        let config = QuantizationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tolerance, QuantizationTolerance::default());
        assert!(config.quantize_embeddings);
    }
}
