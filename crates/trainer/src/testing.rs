//! Minimal reference components for tests and benchmarks
//!
//! A dense linear unit, mean squared error, SGD with momentum, a step
//! learning-rate schedule and a mean-absolute-error metric. Enough to drive
//! the runner end to end without a real tensor library.

use crate::metrics::Metric;
use crate::nn::{Criterion, Loss, Module, Parameter};
use crate::optim::{LrScheduler, Optimizer};
use ndarray::{Array1, Array2, Axis, Ix1, Ix2};
use runtime_core::{Error, Result, StateDict, StateValue, Tensor};

fn as_matrix(tensor: &Tensor, what: &str) -> Result<Array2<f32>> {
    tensor
        .clone()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::Shape {
            message: format!("{} must be 2-D, got shape {:?}", what, tensor.shape()),
        })
}

/// Dense layer `y = x·w (+ b)`
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Parameter,
    bias: Option<Parameter>,
    input: Option<Array2<f32>>,
}

impl Linear {
    /// Layer with the given `[in, out]` weight matrix and no bias
    pub fn from_weights(weight: Array2<f32>) -> Self {
        Self {
            weight: Parameter::new("weight", weight.into_dyn()),
            bias: None,
            input: None,
        }
    }

    /// Layer with every weight set to `value`, bias initialized to zero
    pub fn filled(in_features: usize, out_features: usize, value: f32, bias: bool) -> Self {
        let weight = Array2::from_elem((in_features, out_features), value);
        let bias = bias.then(|| Parameter::new("bias", Array1::<f32>::zeros(out_features).into_dyn()));
        Self {
            weight: Parameter::new("weight", weight.into_dyn()),
            bias,
            input: None,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight.value
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(|b| &b.value)
    }
}

impl Module for Linear {
    fn forward(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let x = inputs.first().ok_or_else(|| Error::Shape {
            message: "linear layer needs one input".to_string(),
        })?;
        let x = as_matrix(x, "input")?;
        let w = as_matrix(&self.weight.value, "weight")?;
        if x.ncols() != w.nrows() {
            return Err(Error::Shape {
                message: format!("input has {} features, layer expects {}", x.ncols(), w.nrows()),
            });
        }

        let mut y = x.dot(&w);
        if let Some(bias) = &self.bias {
            let b = bias.value.view().into_dimensionality::<Ix1>()?;
            y += &b;
        }
        self.input = Some(x);
        Ok(vec![y.into_dyn()])
    }

    fn backward(&mut self, grad_outputs: &[Tensor]) -> Result<()> {
        let x = self.input.as_ref().ok_or_else(|| Error::Internal {
            message: "backward called before forward".to_string(),
        })?;
        let g = grad_outputs.first().ok_or_else(|| Error::Shape {
            message: "linear layer needs one output gradient".to_string(),
        })?;
        let g = as_matrix(g, "output gradient")?;

        let dw = x.t().dot(&g).into_dyn();
        if dw.shape() != self.weight.grad.shape() {
            return Err(Error::Shape {
                message: format!(
                    "weight gradient has shape {:?}, expected {:?}",
                    dw.shape(),
                    self.weight.grad.shape()
                ),
            });
        }
        self.weight.grad += &dw;
        if let Some(bias) = &mut self.bias {
            bias.grad += &g.sum_axis(Axis(0)).into_dyn();
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        std::iter::once(&self.weight).chain(self.bias.as_ref()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        std::iter::once(&mut self.weight).chain(self.bias.as_mut()).collect()
    }
}

/// Mean squared error over every output element
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl Criterion for MseLoss {
    fn loss(&self, outputs: &[Tensor], targets: &[Tensor]) -> Result<Loss> {
        let (output, target) = match (outputs.first(), targets.first()) {
            (Some(o), Some(t)) => (o, t),
            _ => {
                return Err(Error::Shape {
                    message: "mse needs one output and one target".to_string(),
                })
            }
        };

        // labels of shape [n] against outputs of shape [n, 1]
        let target = if target.shape() == output.shape() {
            target.clone()
        } else if target.len() == output.len() {
            target
                .clone()
                .into_shape_with_order(output.raw_dim())?
        } else {
            return Err(Error::Shape {
                message: format!(
                    "output shape {:?} does not match target shape {:?}",
                    output.shape(),
                    target.shape()
                ),
            });
        };

        let n = output.len().max(1) as f32;
        let diff = output - &target;
        let value = diff.mapv(|d| d * d).sum() / n;
        let grad = diff * (2.0 / n);
        Ok(Loss {
            value,
            grads: vec![grad],
        })
    }
}

/// Stochastic gradient descent with optional momentum
///
/// `v = momentum * v + g; p -= lr * v`
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    velocity: Vec<Tensor>,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self::with_momentum(lr, 0.0)
    }

    pub fn with_momentum(lr: f64, momentum: f64) -> Self {
        Self {
            lr,
            momentum,
            velocity: Vec::new(),
        }
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        if self.velocity.len() != params.len() {
            self.velocity = params
                .iter()
                .map(|p| Tensor::zeros(p.value.raw_dim()))
                .collect();
        }

        let lr = self.lr as f32;
        let momentum = self.momentum as f32;
        for (param, velocity) in params.iter_mut().zip(self.velocity.iter_mut()) {
            if velocity.shape() != param.grad.shape() {
                return Err(Error::Shape {
                    message: format!(
                        "velocity for {} has shape {:?}, gradient has {:?}",
                        param.name,
                        velocity.shape(),
                        param.grad.shape()
                    ),
                });
            }
            velocity.zip_mut_with(&param.grad, |v, g| *v = momentum * *v + g);
            param.value.scaled_add(-lr, velocity);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("lr", StateValue::Float(self.lr));
        state.insert("momentum", StateValue::Float(self.momentum));
        state.insert(
            "velocity",
            StateValue::List(self.velocity.iter().cloned().map(StateValue::Tensor).collect()),
        );
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.lr = state.require_float("lr")?;
        self.momentum = state.require_float("momentum")?;
        self.velocity = state
            .require("velocity")?
            .as_list()
            .unwrap_or_default()
            .iter()
            .map(|v| {
                v.as_tensor().cloned().ok_or_else(|| {
                    Error::Serialization("sgd velocity entry is not a tensor".to_string())
                })
            })
            .collect::<Result<_>>()?;
        Ok(())
    }
}

/// Multiply the learning rate by `gamma` every `step_size` scheduler steps
#[derive(Debug, Clone)]
pub struct StepLr {
    step_size: u64,
    gamma: f64,
    last_epoch: u64,
}

impl StepLr {
    pub fn new(step_size: u64, gamma: f64) -> Self {
        Self {
            step_size: step_size.max(1),
            gamma,
            last_epoch: 0,
        }
    }

    /// Number of scheduler steps taken so far
    pub fn last_epoch(&self) -> u64 {
        self.last_epoch
    }
}

impl LrScheduler for StepLr {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;
        if self.last_epoch % self.step_size == 0 {
            optimizer.set_learning_rate(optimizer.learning_rate() * self.gamma);
        }
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("step_size", StateValue::Int(self.step_size as i64));
        state.insert("gamma", StateValue::Float(self.gamma));
        state.insert("last_epoch", StateValue::Int(self.last_epoch as i64));
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.step_size = state.require_int("step_size")?.max(1) as u64;
        self.gamma = state.require_float("gamma")?;
        self.last_epoch = state.require_int("last_epoch")?.max(0) as u64;
        Ok(())
    }
}

/// Mean absolute difference between the first output and the first target
#[derive(Debug, Clone, Default)]
pub struct MeanAbsoluteError {
    total: f64,
    count: usize,
}

impl Metric for MeanAbsoluteError {
    fn name(&self) -> &str {
        "mae"
    }

    fn reset(&mut self) {
        self.total = 0.0;
        self.count = 0;
    }

    fn update(&mut self, outputs: &[Tensor], targets: &[Tensor]) -> Result<()> {
        let (output, target) = match (outputs.first(), targets.first()) {
            (Some(o), Some(t)) if o.len() == t.len() => (o, t),
            _ => {
                return Err(Error::Shape {
                    message: "mae needs an output and a target of equal size".to_string(),
                })
            }
        };
        self.total += output
            .iter()
            .zip(target.iter())
            .map(|(o, t)| (o - t).abs() as f64)
            .sum::<f64>();
        self.count += output.len();
        Ok(())
    }

    fn compute(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}
