//! Optimizer and learning-rate scheduler traits

use crate::nn::Parameter;
use runtime_core::{Result, StateDict};

/// Updates parameters from their accumulated gradients
pub trait Optimizer: Send {
    /// Apply one update to `params`, in the order the runner pairs them
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

/// Adjusts the learning rate of one optimizer
pub trait LrScheduler: Send {
    fn step(&mut self, optimizer: &mut dyn Optimizer);

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

/// Clear the gradients of every parameter
pub fn zero_grad(params: &mut [&mut Parameter]) {
    for param in params.iter_mut() {
        param.zero_grad();
    }
}
