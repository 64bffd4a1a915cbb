//! Training and validation loops.

mod optimizer;
mod scheduler;

pub use optimizer::{AdamW, Optimizer};
pub use scheduler::StepLr;

use log::info;
use tch::{Device, Tensor};

use crate::data::{Batch, DataLoader};
use crate::error::Result;
use crate::metrics::{accuracy, f1_weighted};
use crate::model::SequenceClassifier;

/// Metrics of one pass over a loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochMetrics {
    /// Mean loss per batch.
    pub loss: f64,
    pub accuracy: f64,
    /// Weighted F1.
    pub f1: f64,
    pub labels: Vec<i64>,
    pub predictions: Vec<i64>,
}

impl EpochMetrics {
    fn from_pass(total_loss: f64, batches: usize, labels: Vec<i64>, predictions: Vec<i64>) -> Self {
        if batches == 0 || labels.is_empty() {
            return Self::default();
        }
        Self {
            loss: total_loss / batches as f64,
            accuracy: accuracy(&labels, &predictions),
            f1: f1_weighted(&labels, &predictions),
            labels,
            predictions,
        }
    }

    pub fn summary(&self) -> MetricSummary {
        MetricSummary {
            loss: self.loss,
            accuracy: self.accuracy,
            f1: self.f1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricSummary {
    pub loss: f64,
    pub accuracy: f64,
    pub f1: f64,
}

/// Result of scoring a model or graph on a labelled loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalOutcome {
    pub accuracy: f64,
    pub f1: f64,
    pub labels: Vec<i64>,
    pub predictions: Vec<i64>,
}

impl EvalOutcome {
    pub fn new(labels: Vec<i64>, predictions: Vec<i64>) -> Self {
        if labels.is_empty() {
            return Self::default();
        }
        Self {
            accuracy: accuracy(&labels, &predictions),
            f1: f1_weighted(&labels, &predictions),
            labels,
            predictions,
        }
    }
}

struct BatchStep {
    loss: f64,
    predictions: Vec<i64>,
}

fn run_batch<M: SequenceClassifier + ?Sized>(model: &M, batch: &Batch, train: bool) -> Result<(Tensor, BatchStep)> {
    let (input_ids, attention_mask, labels) = batch.to_tensors(model.device());
    let logits = model.forward(&input_ids, &attention_mask, train)?;
    let loss = logits.cross_entropy_for_logits(&labels);
    let predictions = Vec::<i64>::try_from(&logits.argmax(-1, false).to_device(Device::Cpu))?;
    let step = BatchStep {
        loss: f64::try_from(&loss.detach())?,
        predictions,
    };
    Ok((loss, step))
}

/// One optimization pass: for every batch zero the gradients, run the
/// model in training mode, back-propagate the cross-entropy loss and step.
pub fn train_one_epoch<M, O>(model: &M, loader: &DataLoader, optimizer: &mut O) -> Result<EpochMetrics>
where
    M: SequenceClassifier + ?Sized,
    O: Optimizer + ?Sized,
{
    let mut total_loss = 0.0;
    let mut batches = 0;
    let mut labels = Vec::with_capacity(loader.num_examples());
    let mut predictions = Vec::with_capacity(loader.num_examples());

    for batch in loader {
        optimizer.zero_grad()?;
        let (loss, step) = run_batch(model, &batch, true)?;
        loss.backward();
        optimizer.step()?;

        total_loss += step.loss;
        batches += 1;
        labels.extend_from_slice(&batch.labels);
        predictions.extend(step.predictions);
    }

    Ok(EpochMetrics::from_pass(total_loss, batches, labels, predictions))
}

/// Scores `model` on `loader` without tracking gradients.
pub fn validate_model<M: SequenceClassifier + ?Sized>(model: &M, loader: &DataLoader) -> Result<EpochMetrics> {
    tch::no_grad(|| -> Result<EpochMetrics> {
        let mut total_loss = 0.0;
        let mut batches = 0;
        let mut labels = Vec::with_capacity(loader.num_examples());
        let mut predictions = Vec::with_capacity(loader.num_examples());

        for batch in loader {
            let (_, step) = run_batch(model, &batch, false)?;
            total_loss += step.loss;
            batches += 1;
            labels.extend_from_slice(&batch.labels);
            predictions.extend(step.predictions);
        }

        Ok(EpochMetrics::from_pass(total_loss, batches, labels, predictions))
    })
}

pub fn test_model<M: SequenceClassifier + ?Sized>(model: &M, loader: &DataLoader) -> Result<EvalOutcome> {
    let metrics = validate_model(model, loader)?;
    Ok(EvalOutcome::new(metrics.labels, metrics.predictions))
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    /// 1-based.
    pub epoch: usize,
    pub learning_rate: f64,
    pub train: MetricSummary,
    pub validation: MetricSummary,
}

/// Per-epoch metrics of a [`fit`] run, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    /// Full validation metrics of the last epoch.
    pub last_validation: EpochMetrics,
}

impl TrainingHistory {
    pub fn best_val_accuracy(&self) -> f64 {
        self.epochs
            .iter()
            .map(|r| r.validation.accuracy)
            .fold(0.0, f64::max)
    }

    pub fn train_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|r| r.train.loss).collect()
    }

    pub fn val_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|r| r.validation.loss).collect()
    }
}

/// Trains for `epochs` epochs, validating after each and stepping the
/// schedule once per epoch. `on_epoch` sees every record as soon as it is
/// produced; an error from it stops training and is returned as is.
pub fn fit<M, O, F>(
    model: &M,
    train_loader: &DataLoader,
    val_loader: &DataLoader,
    optimizer: &mut O,
    scheduler: &mut StepLr,
    epochs: usize,
    mut on_epoch: F,
) -> Result<TrainingHistory>
where
    M: SequenceClassifier + ?Sized,
    O: Optimizer + ?Sized,
    F: FnMut(&EpochRecord) -> Result<()>,
{
    let mut history = TrainingHistory::default();
    for epoch in 1..=epochs {
        let learning_rate = optimizer.lr();
        let train = train_one_epoch(model, train_loader, optimizer)?;
        let validation = validate_model(model, val_loader)?;
        scheduler.step(optimizer)?;

        let record = EpochRecord {
            epoch,
            learning_rate,
            train: train.summary(),
            validation: validation.summary(),
        };
        info!(
            "Epoch {}/{}, lr: {:.2e}, Train Loss: {:.4}, Train Accuracy: {:.4}, Train F1: {:.4}, \
             Val Loss: {:.4}, Val Accuracy: {:.4}, Val F1: {:.4}",
            epoch,
            epochs,
            learning_rate,
            train.loss,
            train.accuracy,
            train.f1,
            validation.loss,
            validation.accuracy,
            validation.f1
        );
        history.last_validation = validation;
        history.epochs.push(record);
        if let Some(record) = history.epochs.last() {
            on_epoch(record)?;
        }
    }
    Ok(history)
}
