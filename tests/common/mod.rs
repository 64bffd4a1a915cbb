#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use climate_debunk::data::LABEL_NAMES;
use rust_bert::distilbert::{DistilBertConfig, DistilBertModelMaskedLM};
use tch::{nn, Device};

pub const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [
        {"id": 0, "content": "[PAD]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 1, "content": "[UNK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 2, "content": "[CLS]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 3, "content": "[SEP]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 4, "content": "[MASK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
    ],
    "normalizer": {"type": "Lowercase"},
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": {"type": "BertProcessing", "sep": ["[SEP]", 3], "cls": ["[CLS]", 2]},
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "[PAD]": 0, "[UNK]": 1, "[CLS]": 2, "[SEP]": 3, "[MASK]": 4,
            "text": 5, "a": 6, "b": 7, "the": 8, "climate": 9,
            "is": 10, "not": 11, "changing": 12, "science": 13, "unreliable": 14,
            "warming": 15, "good": 16, "fossil": 17, "fuels": 18, "needed": 19
        },
        "unk_token": "[UNK]"
    }
}"#;

pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

pub fn tiny_architecture_json() -> serde_json::Value {
    serde_json::json!({
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
    })
}

/// Writes a randomly initialized two-layer masked-LM bundle to `dir`.
/// The encoder weights double as the starting point for classifiers.
pub fn write_tiny_bundle(dir: &Path) -> PathBuf {
    tch::manual_seed(7);
    fs::create_dir_all(dir).unwrap();
    let json = tiny_architecture_json();
    fs::write(dir.join("config.json"), serde_json::to_string_pretty(&json).unwrap()).unwrap();
    fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();

    let architecture: DistilBertConfig = serde_json::from_value(json).unwrap();
    let vs = nn::VarStore::new(Device::Cpu);
    let _model = DistilBertModelMaskedLM::new(vs.root(), &architecture);
    vs.save(dir.join("rust_model.ot")).unwrap();
    dir.to_path_buf()
}

const QUOTES: [&str; 8] = [
    "the climate is not changing",
    "warming is not happening",
    "the warming is good",
    "climate science is unreliable",
    "the science is not good",
    "fossil fuels needed",
    "fossil fuels is good",
    "a climate text",
];

/// Writes a CSV of quotes with compound labels (`"3_not_bad"`), holding
/// `per_class[i]` rows for class `i`.
pub fn write_quotes_csv(path: &Path, label_column: &str, per_class: &[usize]) {
    let mut writer = csv::Writer::from_path(path).unwrap();
    writer.write_record(["quote", label_column]).unwrap();
    for (class, &count) in per_class.iter().enumerate() {
        for i in 0..count {
            let quote = QUOTES[(class + i) % QUOTES.len()];
            writer.write_record([quote, LABEL_NAMES[class]]).unwrap();
        }
    }
    writer.flush().unwrap();
}

/// Writes a held-out test CSV with `quote` and integer `numeric_label` columns.
pub fn write_test_csv(path: &Path, per_class: &[usize]) {
    let mut writer = csv::Writer::from_path(path).unwrap();
    writer.write_record(["quote", "numeric_label"]).unwrap();
    for (class, &count) in per_class.iter().enumerate() {
        for i in 0..count {
            writer
                .write_record([QUOTES[(class * 3 + i) % QUOTES.len()], &class.to_string()])
                .unwrap();
        }
    }
    writer.flush().unwrap();
}

/// Writes a `config.yaml` for the tiny bundle under `root` and returns its path.
pub fn write_pipeline_config(root: &Path, bundle: &Path, trainpath: &Path, epochs: usize) -> PathBuf {
    let yaml = format!(
        r#"model_name: {bundle}
num_labels: 8
dropout_rate: 0.1
total_layers: 2
num_trainable_layers: 1
trainpath: {train}
valpath: {val}
testpath: {test}
tokenizer_model: {tokenizer}
max_length: 10
batch_size: 4
class_col: label
learning_rate: 1.0e-3
step_size: 1
gamma: 0.5
epochs: {epochs}
trained_model_path: {weights}
device: cpu
seed: 3
"#,
        bundle = bundle.display(),
        train = trainpath.display(),
        val = root.join("val.csv").display(),
        test = root.join("test.csv").display(),
        tokenizer = bundle.join("tokenizer.json").display(),
        weights = root.join("out").join("model.ot").display(),
        epochs = epochs,
    );
    let path = root.join("config.yaml");
    fs::write(&path, yaml).unwrap();
    path
}
