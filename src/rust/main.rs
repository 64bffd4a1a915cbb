use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use climate_debunk::{
    init_logger, init_logger_with, pipeline, AugmentationConfig, BuiltinModel, ModelManager, PipelineConfig,
    QuantizationConfig, RuntimeSettings, SearchSpaceConfig,
};
use log::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a pretrained bundle into the local cache
    Download {
        #[arg(long, default_value = "distilbert-base-uncased")]
        model: String,
        /// Force a fresh download of the model files
        #[arg(short, long)]
        fresh: bool,
    },
    /// Split the dataset into folds and balance each fold by augmentation
    Augment {
        #[arg(long, default_value = "configs/augmentation_config.yaml")]
        config: PathBuf,
    },
    /// Fine-tune the classifier
    Train {
        #[arg(long, default_value = "configs/config.yaml")]
        config: PathBuf,
    },
    /// Run the hyperparameter study
    Tune {
        #[arg(long, default_value = "configs/config.yaml")]
        config: PathBuf,
        #[arg(long, default_value = "configs/hyperoptim_config.yaml")]
        search: PathBuf,
    },
    /// Export the trained model to ONNX, quantize it and re-validate
    Quantize {
        #[arg(long, default_value = "configs/config.yaml")]
        config: PathBuf,
        #[arg(long, default_value = "configs/quantization_config.yaml")]
        quantization: PathBuf,
    },
    /// Score the trained model, or an exported graph, on the test data
    Evaluate {
        #[arg(long, default_value = "configs/config.yaml")]
        config: PathBuf,
        /// Evaluate this ONNX graph instead of the trained weights
        #[arg(long)]
        graph: Option<PathBuf>,
    },
}

async fn download(model: &str, fresh: bool) -> Result<()> {
    let model = BuiltinModel::from_name(model).with_context(|| format!("unknown built-in model '{}'", model))?;
    let manager = ModelManager::new_default()?;

    if fresh {
        info!("Fresh download requested - removing any existing model files...");
        manager.remove_download(model)?;
    }
    manager.ensure_model_downloaded(model).await?;
    info!("{} available at {:?}", model.name(), manager.bundle_dir(model));
    Ok(())
}

fn load_pipeline_config(path: &PathBuf) -> Result<PipelineConfig> {
    PipelineConfig::from_file(path).with_context(|| format!("failed to load {:?}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let start_time = Instant::now();

    match args.command {
        Command::Download { model, fresh } => {
            init_logger();
            download(&model, fresh).await?;
        }
        Command::Augment { config } => {
            let config =
                AugmentationConfig::from_file(&config).with_context(|| format!("failed to load {:?}", config))?;
            init_logger_with(config.log_level.as_deref(), config.log_file())?;
            let folds = pipeline::run_augmentation(&config).context("augmentation failed")?;
            for fold in &folds {
                info!(
                    "Fold {}: {} -> {} rows ({:?})",
                    fold.fold, fold.subset_len, fold.balanced_len, fold.balanced_path
                );
            }
        }
        Command::Train { config } => {
            init_logger();
            let config = load_pipeline_config(&config)?;
            let outcome = pipeline::run_training(&config).context("training failed")?;
            info!("Best validation accuracy: {:.4}", outcome.history.best_val_accuracy());
            info!("Model saved as {:?}", config.trained_model_path);
        }
        Command::Tune { config, search } => {
            init_logger();
            let config = load_pipeline_config(&config)?;
            let space =
                SearchSpaceConfig::from_file(&search).with_context(|| format!("failed to load {:?}", search))?;
            let study = pipeline::run_search(&config, &space).context("hyperparameter search failed")?;
            info!("Finished {} trials", study.trials().len());
        }
        Command::Quantize { config, quantization } => {
            init_logger();
            let config = load_pipeline_config(&config)?;
            let quantization = QuantizationConfig::from_file(&quantization)
                .with_context(|| format!("failed to load {:?}", quantization))?;
            let outcome = pipeline::run_quantization(&config, &quantization).context("quantization failed")?;
            info!(
                "Quantized model saved at {:?}: accuracy {:.4} -> {:.4}, f1 {:.4} -> {:.4}",
                outcome.quantization.path,
                outcome.report.reference.accuracy,
                outcome.report.quantized.accuracy,
                outcome.report.reference.f1,
                outcome.report.quantized.f1
            );
        }
        Command::Evaluate { config, graph } => {
            init_logger();
            let config = load_pipeline_config(&config)?;
            let evaluation = pipeline::run_evaluation(&config, graph.as_deref(), &RuntimeSettings::default())
                .context("evaluation failed")?;
            println!("Accuracy: {:.4}", evaluation.outcome.accuracy);
            println!("Weighted F1: {:.4}", evaluation.outcome.f1);
        }
    }

    info!("=== Done (took {:.2?}) ===", start_time.elapsed());
    Ok(())
}
