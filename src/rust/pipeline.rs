//! End-to-end steps behind the command line: augmentation, training,
//! hyperparameter search, export with quantization, and evaluation.

use std::path::Path;

use log::info;
use tch::Device;

use crate::augment::{augment_folds, ContextualWordAugmenter, FoldArtifacts, RandomSwapAugmenter, TextAugmenter};
use crate::config::{AugmentationConfig, AugmenterKind, PipelineConfig, QuantizationConfig, SearchSpaceConfig};
use crate::data::{
    create_data_loader, encode_data, load_test_data, load_tokenizer, process_labels, DataLoader, DataReader,
};
use crate::error::Result;
use crate::export::{
    export_to_graph, graph_logits, load_session, quantize_with, validate_graph, verify_export, ExportSummary,
    QuantizationReport, QuantizationSummary, QuantizeOptions,
};
use crate::metrics::{
    argmax, precision_recall_one_vs_rest, roc_one_vs_rest, softmax, ClassificationReport, ConfusionMatrix,
    PrecisionRecallCurve, RocCurve,
};
use crate::model::{resolve_device, ModelFactory, SequenceClassifier};
use crate::model_manager::resolve_bundle_dir;
use crate::runtime::RuntimeSettings;
use crate::search::{objective, Study};
use crate::train::{fit, AdamW, EvalOutcome, StepLr, TrainingHistory};

/// Builds the augmenter `config` selects.
pub fn build_augmenter(config: &AugmentationConfig) -> Result<Box<dyn TextAugmenter>> {
    match config.augmenter {
        AugmenterKind::Contextual => {
            let dir = resolve_bundle_dir(&config.augmenter_model)?;
            let device = resolve_device(&config.device)?;
            let augmenter = ContextualWordAugmenter::from_bundle(
                &dir,
                config.augment_action,
                device,
                config.max_length,
                config.random_seed,
            )?;
            Ok(Box::new(augmenter))
        }
        AugmenterKind::Swap => Ok(Box::new(RandomSwapAugmenter::new(1, config.random_seed))),
    }
}

/// Reads the labelled dataset, splits it into folds and writes each fold
/// with its balanced counterpart.
pub fn run_augmentation(config: &AugmentationConfig) -> Result<Vec<FoldArtifacts>> {
    let augmenter = build_augmenter(config)?;
    run_augmentation_with(config, augmenter.as_ref())
}

pub fn run_augmentation_with<A: TextAugmenter + ?Sized>(
    config: &AugmentationConfig,
    augmenter: &A,
) -> Result<Vec<FoldArtifacts>> {
    let raw = DataReader::with_text_column(&config.text_column).read(&config.data_path, &config.label_column)?;
    let dataset = process_labels(raw)?;
    info!("Class counts before balancing: {:?}", dataset.class_counts());

    let artifacts = augment_folds(&dataset, augmenter, config.n_splits, config.random_seed, &config.output_dir)?;
    let skipped: usize = artifacts.iter().map(|a| a.skipped).sum();
    info!(
        "Wrote {} balanced folds to {:?} ({} augmentations skipped)",
        artifacts.len(),
        config.output_dir,
        skipped
    );
    Ok(artifacts)
}

#[derive(Debug)]
pub struct TrainingOutcome {
    pub history: TrainingHistory,
    pub confusion: ConfusionMatrix,
}

/// Fine-tunes the configured model and saves its weights to
/// `trained_model_path`.
pub fn run_training(config: &PipelineConfig) -> Result<TrainingOutcome> {
    config.validate()?;
    tch::manual_seed(config.seed as i64);
    let device = resolve_device(&config.device)?;
    info!("Training on {:?}", device);

    let tokenizer = load_tokenizer(&config.loader.tokenizer_model)?;
    let num_labels = config.model.num_labels;
    let train_loader =
        create_data_loader(&config.trainpath, &config.loader, &tokenizer, true, num_labels)?.with_seed(config.seed);
    let val_loader = create_data_loader(&config.valpath, &config.loader, &tokenizer, false, num_labels)?;

    let model = ModelFactory::build(&config.model, device)?;
    let training = &config.training;
    let mut optimizer = AdamW::for_model(&model, training.learning_rate)?;
    let mut scheduler = StepLr::new(training.learning_rate, training.step_size, training.gamma);
    let history = fit(
        &model,
        &train_loader,
        &val_loader,
        &mut optimizer,
        &mut scheduler,
        training.epochs,
        |_| Ok(()),
    )?;

    model.save(&config.trained_model_path)?;

    let last = &history.last_validation;
    let confusion = ConfusionMatrix::from_predictions(&last.labels, &last.predictions, num_labels);
    info!("Validation confusion matrix:\n{}", confusion);
    info!(
        "Validation report:\n{}",
        ClassificationReport::new(&last.labels, &last.predictions)
    );
    Ok(TrainingOutcome { history, confusion })
}

/// Runs the hyperparameter study and logs the best trial.
pub fn run_search(config: &PipelineConfig, space: &SearchSpaceConfig) -> Result<Study> {
    space.validate()?;
    let mut study = Study::new(space.seed, space.pruner.clone());
    study.optimize(space.n_trials, |trial| objective(config, space, trial))?;

    let best = study.best_trial()?;
    info!(
        "Best trial {} with validation accuracy {:.4}",
        best.number,
        best.value.unwrap_or_default()
    );
    for (name, value) in &best.params {
        info!("  {}: {}", name, value);
    }
    Ok(study)
}

#[derive(Debug)]
pub struct QuantizationOutcome {
    pub export: ExportSummary,
    pub export_max_diff: f32,
    pub quantization: QuantizationSummary,
    pub report: QuantizationReport,
}

/// Exports the trained model, checks the export, quantizes it and
/// re-validates both graphs. A quantized graph outside the tolerance is an
/// error.
pub fn run_quantization(config: &PipelineConfig, quantization: &QuantizationConfig) -> Result<QuantizationOutcome> {
    let model = ModelFactory::build_for_inference(&config.model, &config.trained_model_path, &config.device)?;
    let tokenizer = load_tokenizer(&config.loader.tokenizer_model)?;

    let export = export_to_graph(&model, &tokenizer, config.loader.max_length, &quantization.onnx_path)?;
    let export_max_diff = verify_export(&export, &quantization.runtime, quantization.export_atol)?;

    let options = QuantizeOptions {
        quantize_embeddings: quantization.quantize_embeddings,
    };
    let summary = quantize_with(&quantization.onnx_path, &quantization.quantized_onnx_path, options)?;
    info!("Quantized graph is {:.1}% of the original size", summary.size_ratio() * 100.0);

    let val_loader =
        create_data_loader(&config.valpath, &config.loader, &tokenizer, false, config.model.num_labels)?;
    let reference = validate_graph(&quantization.onnx_path, &val_loader, &quantization.runtime)?;
    let quantized = validate_graph(&quantization.quantized_onnx_path, &val_loader, &quantization.runtime)?;
    let report = QuantizationReport::new(reference, quantized);
    report.enforce(&quantization.tolerance)?;

    Ok(QuantizationOutcome {
        export,
        export_max_diff,
        quantization: summary,
        report,
    })
}

#[derive(Debug)]
pub struct EvaluationOutcome {
    pub outcome: EvalOutcome,
    pub confusion: ConfusionMatrix,
    pub report: ClassificationReport,
    pub roc: Vec<RocCurve>,
    pub precision_recall: Vec<PrecisionRecallCurve>,
}

impl EvaluationOutcome {
    fn from_logits(labels: Vec<i64>, logits: &[Vec<f32>], num_classes: usize) -> Self {
        let predictions: Vec<i64> = logits.iter().map(|row| argmax(row)).collect();
        let probabilities: Vec<Vec<f64>> = logits.iter().map(|row| softmax(row)).collect();
        Self {
            confusion: ConfusionMatrix::from_predictions(&labels, &predictions, num_classes),
            report: ClassificationReport::new(&labels, &predictions),
            roc: roc_one_vs_rest(&labels, &probabilities, num_classes),
            precision_recall: precision_recall_one_vs_rest(&labels, &probabilities, num_classes),
            outcome: EvalOutcome::new(labels, predictions),
        }
    }
}

fn model_logits<M: SequenceClassifier + ?Sized>(model: &M, loader: &DataLoader) -> Result<(Vec<i64>, Vec<Vec<f32>>)> {
    let mut labels = Vec::with_capacity(loader.num_examples());
    let mut logits = Vec::with_capacity(loader.num_examples());
    tch::no_grad(|| -> Result<(Vec<i64>, Vec<Vec<f32>>)> {
        for batch in loader {
            let (input_ids, attention_mask, _) = batch.to_tensors(model.device());
            let output = model.forward(&input_ids, &attention_mask, false)?.to_device(Device::Cpu);
            let width = output.size().last().copied().unwrap_or(0).max(1) as usize;
            let flat = Vec::<f32>::try_from(&output.reshape([-1]))?;
            logits.extend(flat.chunks(width).map(<[f32]>::to_vec));
            labels.extend(batch.labels);
        }
        Ok((labels, logits))
    })
}

/// Scores the trained model (or, when `graph` is given, an exported graph)
/// on the test file, falling back to the validation file.
pub fn run_evaluation(
    config: &PipelineConfig,
    graph: Option<&Path>,
    runtime: &RuntimeSettings,
) -> Result<EvaluationOutcome> {
    let path = config.testpath.as_ref().unwrap_or(&config.valpath);
    let dataset = load_test_data(path)?;
    dataset.check_label_range(config.model.num_labels)?;
    let tokenizer = load_tokenizer(&config.loader.tokenizer_model)?;
    let encoded = encode_data(&tokenizer, &dataset.texts(), &dataset.labels(), config.loader.max_length)?;
    let loader = DataLoader::new(encoded, config.loader.batch_size, false);

    let (labels, logits) = match graph {
        Some(graph) => graph_logits(&load_session(graph, runtime)?, &loader)?,
        None => {
            let model =
                ModelFactory::build_for_inference(&config.model, &config.trained_model_path, &config.device)?;
            model_logits(&model, &loader)?
        }
    };

    let evaluation = EvaluationOutcome::from_logits(labels, &logits, config.model.num_labels);
    info!(
        "Evaluated {:?}: accuracy {:.4}, weighted f1 {:.4}",
        path, evaluation.outcome.accuracy, evaluation.outcome.f1
    );
    info!("Confusion matrix:\n{}", evaluation.confusion);
    info!("Classification report:\n{}", evaluation.report);
    let score = |value: f64| {
        if value.is_nan() {
            "n/a".to_string()
        } else {
            format!("{:.4}", value)
        }
    };
    for curve in &evaluation.roc {
        let average_precision = evaluation
            .precision_recall
            .iter()
            .find(|pr| pr.label == curve.label)
            .map_or(f64::NAN, |pr| pr.average_precision);
        info!(
            "{}: ROC AUC {}, average precision {}",
            crate::data::label_name(curve.label).unwrap_or("unknown"),
            score(curve.auc),
            score(average_precision)
        );
    }
    Ok(evaluation)
}
