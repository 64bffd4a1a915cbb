use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::pruner::MedianPruner;
use crate::config::{Choices, FloatRange, IntRange};
use crate::data::stream_seed;
use crate::error::{PipelineError, Result};

/// A sampled hyperparameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Choice(usize),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Float(v) => write!(f, "{:.6}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Choice(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Running,
    Completed,
    Pruned,
    Failed,
}

/// One evaluation of the objective.
///
/// Sampling is seeded per trial, so a study replays exactly for the same seed.
pub struct Trial<'a> {
    number: usize,
    rng: StdRng,
    params: BTreeMap<String, ParamValue>,
    intermediate: BTreeMap<usize, f64>,
    pruner: &'a MedianPruner,
}

impl<'a> Trial<'a> {
    pub(crate) fn new(number: usize, seed: u64, pruner: &'a MedianPruner) -> Self {
        Self {
            number,
            rng: StdRng::seed_from_u64(stream_seed(seed, number as u64)),
            params: BTreeMap::new(),
            intermediate: BTreeMap::new(),
            pruner,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    /// Uniform in `[low, high]`, or log-uniform when `range.log` is set.
    pub fn suggest_float(&mut self, name: &str, range: &FloatRange) -> f64 {
        let [low, high] = range.range;
        let value = if low >= high {
            low
        } else if range.log {
            self.rng.gen_range(low.ln()..=high.ln()).exp().clamp(low, high)
        } else {
            self.rng.gen_range(low..=high)
        };
        self.params.insert(name.to_string(), ParamValue::Float(value));
        value
    }

    pub fn suggest_int(&mut self, name: &str, range: &IntRange) -> i64 {
        let [low, high] = range.range;
        let value = if low >= high { low } else { self.rng.gen_range(low..=high) };
        self.params.insert(name.to_string(), ParamValue::Int(value));
        value
    }

    pub fn suggest_categorical(&mut self, name: &str, choices: &Choices) -> Result<usize> {
        let value = *choices
            .range
            .choose(&mut self.rng)
            .ok_or_else(|| PipelineError::Search(format!("no choices for {}", name)))?;
        self.params.insert(name.to_string(), ParamValue::Choice(value));
        Ok(value)
    }

    /// Records the objective's intermediate value after `step` (1-based epochs).
    pub fn report(&mut self, step: usize, value: f64) {
        self.intermediate.insert(step, value);
    }

    /// Whether the last reported value is below the median of completed
    /// trials at the same step.
    pub fn should_prune(&self) -> bool {
        match self.intermediate.iter().next_back() {
            Some((&step, &value)) => self.pruner.should_prune(step, value),
            None => false,
        }
    }

    pub(crate) fn into_record(self, status: TrialStatus, value: Option<f64>) -> TrialRecord {
        TrialRecord {
            number: self.number,
            params: self.params,
            intermediate: self.intermediate,
            value,
            status,
        }
    }
}

/// A finished trial as kept by the study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub number: usize,
    pub params: BTreeMap<String, ParamValue>,
    pub intermediate: BTreeMap<usize, f64>,
    pub value: Option<f64>,
    pub status: TrialStatus,
}
