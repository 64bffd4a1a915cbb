use crate::config::PrunerSettings;

use super::trial::{TrialRecord, TrialStatus};

/// Median stopping rule over completed trials.
///
/// A running trial is pruned at `step` when its value is strictly below the
/// median of the values completed trials reported at that step. Nothing is
/// pruned before `n_startup_trials` trials have completed, nor at steps up
/// to `n_warmup_steps`. Higher values are better.
#[derive(Debug, Clone, Default)]
pub struct MedianPruner {
    settings: PrunerSettings,
    completed: Vec<TrialRecord>,
}

impl MedianPruner {
    pub fn new(settings: PrunerSettings) -> Self {
        Self {
            settings,
            completed: Vec::new(),
        }
    }

    /// Keeps the curve of a completed trial. Other trials are ignored.
    pub fn record(&mut self, trial: &TrialRecord) {
        if trial.status == TrialStatus::Completed {
            self.completed.push(trial.clone());
        }
    }

    pub fn should_prune(&self, step: usize, value: f64) -> bool {
        if self.completed.len() < self.settings.n_startup_trials || step <= self.settings.n_warmup_steps {
            return false;
        }
        let mut values: Vec<f64> = self
            .completed
            .iter()
            .filter_map(|t| t.intermediate.get(&step).copied())
            .collect();
        if values.is_empty() {
            return false;
        }
        values.sort_by(f64::total_cmp);
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };
        value < median
    }
}
