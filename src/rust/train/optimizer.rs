use tch::nn::{self, OptimizerConfig};
use tch::{COptimizer, Tensor};

use crate::error::Result;
use crate::model::FineTuneModel;

/// The operations the training loop needs from an optimizer.
pub trait Optimizer {
    fn zero_grad(&mut self) -> Result<()>;
    fn step(&mut self) -> Result<()>;
    fn set_lr(&mut self, lr: f64) -> Result<()>;
    fn lr(&self) -> f64;
}

/// AdamW over an explicit list of parameters.
pub struct AdamW {
    inner: COptimizer,
    lr: f64,
    num_parameters: usize,
}

impl AdamW {
    pub fn new(parameters: &[Tensor], lr: f64) -> Result<Self> {
        let mut inner = nn::AdamW::default().build_copt(lr)?;
        for parameter in parameters {
            inner.add_parameters(parameter, 0)?;
        }
        Ok(Self {
            inner,
            lr,
            num_parameters: parameters.len(),
        })
    }

    /// Optimizes exactly the model's trainable parameter group.
    pub fn for_model(model: &FineTuneModel, lr: f64) -> Result<Self> {
        Self::new(&model.trainable_parameters(), lr)
    }

    pub fn num_parameters(&self) -> usize {
        self.num_parameters
    }
}

impl Optimizer for AdamW {
    fn zero_grad(&mut self) -> Result<()> {
        self.inner.zero_grad()?;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.inner.step()?;
        Ok(())
    }

    fn set_lr(&mut self, lr: f64) -> Result<()> {
        self.inner.set_learning_rate(lr)?;
        self.lr = lr;
        Ok(())
    }

    fn lr(&self) -> f64 {
        self.lr
    }
}
