//! Hyperparameter search: a seeded random sampler with median pruning
//! driving the fine-tuning objective.

mod pruner;
mod trial;

pub use pruner::MedianPruner;
pub use trial::{ParamValue, Trial, TrialRecord, TrialStatus};

use log::{error, info};

use crate::config::{PipelineConfig, PrunerSettings, SearchSpaceConfig};
use crate::data::{create_data_loader, load_tokenizer};
use crate::error::{PipelineError, Result};
use crate::model::{resolve_device, ModelFactory};
use crate::train::{fit, AdamW, StepLr};

/// Runs trials one after another and keeps their records.
#[derive(Debug)]
pub struct Study {
    seed: u64,
    pruner: MedianPruner,
    trials: Vec<TrialRecord>,
}

impl Study {
    pub fn new(seed: u64, pruner: PrunerSettings) -> Self {
        Self {
            seed,
            pruner: MedianPruner::new(pruner),
            trials: Vec::new(),
        }
    }

    pub fn trials(&self) -> &[TrialRecord] {
        &self.trials
    }

    /// Evaluates `objective` for `n_trials` new trials.
    ///
    /// A trial that returns [`PipelineError::TrialPruned`] is recorded as
    /// pruned and the study moves on. Any other error is recorded as a
    /// failed trial and stops the study.
    pub fn optimize<F>(&mut self, n_trials: usize, mut objective: F) -> Result<()>
    where
        F: FnMut(&mut Trial<'_>) -> Result<f64>,
    {
        for _ in 0..n_trials {
            let number = self.trials.len();
            let mut trial = Trial::new(number, self.seed, &self.pruner);
            let outcome = objective(&mut trial);
            let (record, failure) = match outcome {
                Ok(value) => {
                    info!("Trial {} finished with value {:.4}", number, value);
                    (trial.into_record(TrialStatus::Completed, Some(value)), None)
                }
                Err(PipelineError::TrialPruned { step }) => {
                    info!("Trial {} pruned at step {}", number, step);
                    (trial.into_record(TrialStatus::Pruned, None), None)
                }
                Err(e) => {
                    error!("Trial {} failed: {}", number, e);
                    (trial.into_record(TrialStatus::Failed, None), Some(e))
                }
            };
            self.pruner.record(&record);
            self.trials.push(record);
            if let Some(e) = failure {
                return Err(e);
            }
        }
        Ok(())
    }

    /// The completed trial with the highest value.
    pub fn best_trial(&self) -> Result<&TrialRecord> {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Completed)
            .filter_map(|t| t.value.map(|v| (t, v)))
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(t, _)| t)
            .ok_or_else(|| PipelineError::Search("no trial completed".into()))
    }
}

/// The search objective: trains a fresh model with sampled hyperparameters
/// and returns the best validation accuracy over its epochs.
///
/// Validation accuracy is reported after every epoch; when the trial should
/// be pruned, training stops with [`PipelineError::TrialPruned`].
pub fn objective(config: &PipelineConfig, space: &SearchSpaceConfig, trial: &mut Trial<'_>) -> Result<f64> {
    let learning_rate = trial.suggest_float("learning_rate", &space.learning_rate);
    let num_trainable_layers = to_count(
        "num_trainable_layers",
        trial.suggest_int("num_trainable_layers", &space.num_trainable_layers),
    )?;
    let dropout_rate = trial.suggest_float("dropout_rate", &space.dropout_rate);
    let batch_size = trial.suggest_categorical("batch_size", &space.batch_size)?;
    let epochs = to_count("epochs", trial.suggest_int("epochs", &space.epochs))?;
    let step_size = to_count("step_size", trial.suggest_int("step_size", &space.step_size))?;
    let gamma = trial.suggest_float("gamma", &space.gamma);
    info!(
        "Trial {}: lr {:.2e}, layers {}, dropout {:.3}, batch {}, epochs {}, step {}, gamma {:.3}",
        trial.number(),
        learning_rate,
        num_trainable_layers,
        dropout_rate,
        batch_size,
        epochs,
        step_size,
        gamma
    );

    let mut model_settings = config.model.clone();
    model_settings.num_trainable_layers = num_trainable_layers;
    model_settings.dropout_rate = dropout_rate;
    let mut loader_settings = config.loader.clone();
    loader_settings.batch_size = batch_size;

    let device = resolve_device(&config.device)?;
    let tokenizer = load_tokenizer(&loader_settings.tokenizer_model)?;
    let num_labels = model_settings.num_labels;
    let train_loader = create_data_loader(&config.trainpath, &loader_settings, &tokenizer, true, num_labels)?
        .with_seed(config.seed);
    let val_loader = create_data_loader(&config.valpath, &loader_settings, &tokenizer, false, num_labels)?;

    let model = ModelFactory::build(&model_settings, device)?;
    let mut optimizer = AdamW::for_model(&model, learning_rate)?;
    let mut scheduler = StepLr::new(learning_rate, step_size, gamma);

    let history = fit(&model, &train_loader, &val_loader, &mut optimizer, &mut scheduler, epochs, |record| {
        trial.report(record.epoch, record.validation.accuracy);
        if trial.should_prune() {
            return Err(PipelineError::TrialPruned { step: record.epoch });
        }
        Ok(())
    })?;

    Ok(history.best_val_accuracy())
}

fn to_count(name: &str, value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| PipelineError::InvalidConfig(format!("{} must not be negative, got {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FloatRange;

    fn quadratic(trial: &mut Trial<'_>) -> Result<f64> {
        let x = trial.suggest_float("x", &FloatRange { range: [-1.0, 1.0], log: false });
        Ok(1.0 - x * x)
    }

    #[test]
    fn test_best_trial_maximizes() {
        let mut study = Study::new(42, PrunerSettings::default());
        study.optimize(20, quadratic).unwrap();
        assert_eq!(study.trials().len(), 20);

        let best = study.best_trial().unwrap();
        let best_value = best.value.unwrap();
        for trial in study.trials() {
            assert!(trial.value.unwrap() <= best_value);
        }
        assert!(matches!(best.params["x"], ParamValue::Float(_)));
    }

    #[test]
    fn test_pruned_trials_are_recorded_and_skipped() {
        let mut study = Study::new(0, PrunerSettings { n_startup_trials: 2, n_warmup_steps: 0 });
        study
            .optimize(4, |trial| {
                let good = trial.number() < 2;
                for step in 1..=3 {
                    trial.report(step, if good { 0.8 } else { 0.1 });
                    if trial.should_prune() {
                        return Err(PipelineError::TrialPruned { step });
                    }
                }
                Ok(if good { 0.8 } else { 0.1 })
            })
            .unwrap();

        let statuses: Vec<TrialStatus> = study.trials().iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![
                TrialStatus::Completed,
                TrialStatus::Completed,
                TrialStatus::Pruned,
                TrialStatus::Pruned
            ]
        );
        assert_eq!(study.trials()[2].intermediate.len(), 1);
        assert_eq!(study.best_trial().unwrap().number, 0);
    }

    #[test]
    fn test_failed_trial_stops_study() {
        let mut study = Study::new(0, PrunerSettings::default());
        let err = study
            .optimize(5, |trial| {
                if trial.number() == 1 {
                    Err(PipelineError::Search("boom".into()))
                } else {
                    Ok(0.5)
                }
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Search(_)));
        assert_eq!(study.trials().len(), 2);
        assert_eq!(study.trials()[1].status, TrialStatus::Failed);
    }

    #[test]
    fn test_no_completed_trial() {
        let study = Study::new(0, PrunerSettings::default());
        assert!(matches!(study.best_trial(), Err(PipelineError::Search(_))));
    }

    #[test]
    fn test_negative_count_rejected() {
        assert!(matches!(to_count("epochs", -1), Err(PipelineError::InvalidConfig(_))));
        assert_eq!(to_count("epochs", 3).unwrap(), 3);
    }
}
