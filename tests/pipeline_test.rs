mod common;

use std::fs;

use approx::assert_relative_eq;
use climate_debunk::data::{create_data_loader, load_tokenizer};
use climate_debunk::export::proto::ModelProto;
use climate_debunk::export::{export_to_graph, verify_export};
use climate_debunk::model::ModelFactory;
use climate_debunk::search::TrialStatus;
use climate_debunk::{pipeline, PipelineConfig, PipelineError, QuantizationConfig, RuntimeSettings, SearchSpaceConfig};
use tempfile::tempdir;

const BALANCED: [usize; 8] = [3, 3, 3, 3, 3, 3, 3, 3];

#[test]
fn test_compound_labels_become_fixed_length_batches() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempdir()?;
    let bundle = common::write_tiny_bundle(&root.path().join("bundle"));
    let train = root.path().join("train.csv");
    fs::write(&train, "quote,label
Text A,1_not_happening
Text B,5_science_unreliable
")?;
    common::write_quotes_csv(&root.path().join("val.csv"), "label", &BALANCED);
    let config = PipelineConfig::from_file(common::write_pipeline_config(root.path(), &bundle, &train, 1))?;

    let tokenizer = load_tokenizer(&config.loader.tokenizer_model)?;
    let loader = create_data_loader(&train, &config.loader, &tokenizer, false, 8)?;
    let batches: Vec<_> = loader.iter().collect();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].labels, vec![1, 5]);
    for example in &loader.dataset().examples {
        assert_eq!(example.input_ids.len(), 10);
        assert_eq!(example.attention_mask.len(), 10);
    }
    Ok(())
}

#[test]
fn test_train_evaluate_and_quantize() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let root = tempdir()?;
    let bundle = common::write_tiny_bundle(&root.path().join("bundle"));
    let train = root.path().join("train.csv");
    common::write_quotes_csv(&train, "label", &BALANCED);
    common::write_quotes_csv(&root.path().join("val.csv"), "label", &[2, 1, 1, 1, 1, 1, 1, 1]);
    common::write_test_csv(&root.path().join("test.csv"), &[1, 1, 1, 1, 1, 1, 1, 1]);
    let config = PipelineConfig::from_file(common::write_pipeline_config(root.path(), &bundle, &train, 2))?;

    let trained = pipeline::run_training(&config)?;
    assert!(config.trained_model_path.is_file());
    assert_eq!(trained.history.epochs.len(), 2);
    assert_relative_eq!(trained.history.epochs[0].learning_rate, 1.0e-3);
    assert_relative_eq!(trained.history.epochs[1].learning_rate, 5.0e-4);
    assert!(trained.history.train_losses().iter().all(|loss| loss.is_finite()));
    assert_eq!(trained.history.last_validation.labels.len(), 9);
    assert_eq!(trained.confusion.total(), 9);

    let evaluation = pipeline::run_evaluation(&config, None, &RuntimeSettings::default())?;
    assert_eq!(evaluation.outcome.labels, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(evaluation.roc.len(), 8);

    let quantization: QuantizationConfig = serde_yaml::from_str(&format!(
        "onnx_path: {}\nquantized_onnx_path: {}\n\
         tolerance: {{max_accuracy_drop: 1.0, max_f1_drop: 1.0, min_agreement: 0.0}}\n",
        root.path().join("out/model.onnx").display(),
        root.path().join("out/model.int8.onnx").display(),
    ))?;
    let outcome = pipeline::run_quantization(&config, &quantization)?;
    assert!(outcome.export_max_diff <= 1.0e-3);
    assert!(outcome.quantization.quantized_matmuls > 0);
    assert_eq!(outcome.report.reference.labels.len(), 9);
    assert!(outcome.report.agreement >= 0.0 && outcome.report.agreement <= 1.0);

    let graph = ModelProto::read(&quantization.quantized_onnx_path)?;
    let ops: Vec<&str> = graph
        .graph
        .as_ref()
        .map(|g| g.node.iter().map(|n| n.op_type()).collect())
        .unwrap_or_default();
    assert!(ops.contains(&"MatMulInteger"));
    assert!(ops.contains(&"DynamicQuantizeLinear"));

    let from_graph = pipeline::run_evaluation(
        &config,
        Some(quantization.onnx_path.as_path()),
        &RuntimeSettings::default(),
    )?;
    assert_eq!(from_graph.outcome.labels, evaluation.outcome.labels);
    assert_eq!(from_graph.outcome.predictions.len(), 8);
    Ok(())
}

#[test]
fn test_export_and_quantization_gate_at_default_strictness() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let root = tempdir()?;
    let bundle = common::write_tiny_bundle(&root.path().join("bundle"));
    let train = root.path().join("train.csv");
    common::write_quotes_csv(&train, "label", &BALANCED);
    common::write_quotes_csv(&root.path().join("val.csv"), "label", &BALANCED);
    let config = PipelineConfig::from_file(common::write_pipeline_config(root.path(), &bundle, &train, 1))?;
    pipeline::run_training(&config)?;

    // Defaults: export_atol 1e-3 and the 0.02 / 0.02 / 0.95 gate.
    let defaults: QuantizationConfig = serde_yaml::from_str(&format!(
        "onnx_path: {}\nquantized_onnx_path: {}\n",
        root.path().join("out/model.onnx").display(),
        root.path().join("out/model.int8.onnx").display(),
    ))?;
    assert_eq!(defaults.export_atol, 1.0e-3);
    assert_eq!(defaults.tolerance.min_agreement, 0.95);

    let model = ModelFactory::build_for_inference(&config.model, &config.trained_model_path, &config.device)?;
    let tokenizer = load_tokenizer(&config.loader.tokenizer_model)?;
    let export = export_to_graph(&model, &tokenizer, config.loader.max_length, &defaults.onnx_path)?;
    let max_diff = verify_export(&export, &defaults.runtime, defaults.export_atol)?;
    assert!(max_diff <= 1.0e-3, "fp32 graph differs by {max_diff}");

    // No int8 graph can agree with its source on more than every example.
    let mut strict = defaults.clone();
    strict.tolerance.max_accuracy_drop = 0.0;
    strict.tolerance.max_f1_drop = 0.0;
    strict.tolerance.min_agreement = 1.01;
    let err = pipeline::run_quantization(&config, &strict).unwrap_err();
    match err {
        PipelineError::QuantizationRegression { agreement, .. } => assert!(agreement <= 1.0),
        other => panic!("unexpected error: {other}"),
    }
    assert!(strict.quantized_onnx_path.is_file());
    Ok(())
}

#[test]
fn test_training_rejects_out_of_range_labels() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempdir()?;
    let bundle = common::write_tiny_bundle(&root.path().join("bundle"));
    let train = root.path().join("train.csv");
    fs::write(&train, "quote,label\nthe climate is good,9_unknown\n")?;
    common::write_quotes_csv(&root.path().join("val.csv"), "label", &BALANCED);
    let config = PipelineConfig::from_file(common::write_pipeline_config(root.path(), &bundle, &train, 1))?;

    let err = pipeline::run_training(&config).unwrap_err();
    assert!(matches!(err, PipelineError::LabelOutOfRange { .. }), "{err}");
    assert!(!config.trained_model_path.exists());
    Ok(())
}

#[test]
fn test_search_runs_every_trial() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let root = tempdir()?;
    let bundle = common::write_tiny_bundle(&root.path().join("bundle"));
    let train = root.path().join("train.csv");
    common::write_quotes_csv(&train, "label", &BALANCED);
    common::write_quotes_csv(&root.path().join("val.csv"), "label", &BALANCED);
    let config = PipelineConfig::from_file(common::write_pipeline_config(root.path(), &bundle, &train, 1))?;

    let space: SearchSpaceConfig = serde_yaml::from_str(
        r#"
learning_rate: {range: [1.0e-4, 1.0e-2], log: true}
num_trainable_layers: {range: [0, 2]}
dropout_rate: {range: [0.0, 0.3]}
batch_size: {range: [4, 8]}
epochs: {range: [1, 2]}
step_size: {range: [1, 2]}
gamma: {range: [0.1, 0.9]}
n_trials: 3
seed: 11
"#,
    )?;
    let study = pipeline::run_search(&config, &space)?;
    assert_eq!(study.trials().len(), 3);
    assert!(study
        .trials()
        .iter()
        .all(|t| t.status == TrialStatus::Completed && t.params.len() == 7));

    let best = study.best_trial()?;
    let best_value = best.value.unwrap_or_default();
    assert!(study.trials().iter().all(|t| t.value.unwrap_or_default() <= best_value));
    Ok(())
}
