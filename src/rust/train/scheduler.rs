use super::optimizer::Optimizer;
use crate::error::Result;

/// Step decay learning rate schedule.
///
/// `lr = base_lr * gamma^(epoch / step_size)`, advanced once per epoch.
/// A `step_size` of zero keeps the base rate.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    epoch: usize,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self { base_lr, step_size, gamma, epoch: 0 }
    }

    pub fn get_lr(&self) -> f64 {
        if self.step_size == 0 {
            return self.base_lr;
        }
        let decays = self.epoch / self.step_size;
        self.base_lr * self.gamma.powi(decays as i32)
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Moves to the next epoch and applies the new rate.
    pub fn step<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) -> Result<()> {
        self.epoch += 1;
        optimizer.set_lr(self.get_lr())
    }
}
