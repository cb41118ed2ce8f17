//! Trainable module and criterion traits

use runtime_core::{Error, Result, StateDict, StateValue, Tensor};
use serde::{Deserialize, Serialize};

/// Trainable tensor together with its accumulated gradient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    pub grad: Tensor,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        let grad = Tensor::zeros(value.raw_dim());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    /// Reset the accumulated gradient
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Number of scalar elements
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// A differentiable model.
///
/// `backward` adds into the gradients of the parameters touched by the last
/// `forward`; gradients are only cleared through [`Parameter::zero_grad`].
pub trait Module: Send {
    fn forward(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>>;

    fn backward(&mut self, grad_outputs: &[Tensor]) -> Result<()>;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Parameter values keyed by parameter name
    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        for param in self.parameters() {
            state.insert(param.name.clone(), StateValue::Tensor(param.value.clone()));
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        for param in self.parameters_mut() {
            let value = state.require_tensor(&param.name)?;
            if value.shape() != param.value.shape() {
                return Err(Error::Shape {
                    message: format!(
                        "parameter {} has shape {:?}, state has {:?}",
                        param.name,
                        param.value.shape(),
                        value.shape()
                    ),
                });
            }
            param.value.assign(value);
        }
        Ok(())
    }
}

/// Loss value and its gradient with respect to every output
#[derive(Debug, Clone)]
pub struct Loss {
    pub value: f32,
    pub grads: Vec<Tensor>,
}

/// Loss function
pub trait Criterion: Send {
    fn loss(&self, outputs: &[Tensor], targets: &[Tensor]) -> Result<Loss>;
}

/// Total number of scalars across `params`
pub fn numel<'a>(params: impl IntoIterator<Item = &'a Parameter>) -> usize {
    params.into_iter().map(Parameter::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    struct Scale {
        factor: Parameter,
    }

    impl Module for Scale {
        fn forward(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
            Ok(vec![&inputs[0] * self.factor.value[[0]]])
        }

        fn backward(&mut self, _grad_outputs: &[Tensor]) -> Result<()> {
            Ok(())
        }

        fn parameters(&self) -> Vec<&Parameter> {
            vec![&self.factor]
        }

        fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
            vec![&mut self.factor]
        }
    }

    #[test]
    fn test_default_state_dict() {
        let mut module = Scale {
            factor: Parameter::new("factor", array![2.0f32].into_dyn()),
        };
        let state = module.state_dict();
        assert_eq!(state.require_tensor("factor").unwrap(), &array![2.0f32].into_dyn());

        let mut other = StateDict::new();
        other.insert("factor", StateValue::Tensor(array![5.0f32].into_dyn()));
        module.load_state_dict(&other).unwrap();
        assert_eq!(module.factor.value[[0]], 5.0);

        let mut bad = StateDict::new();
        bad.insert("factor", StateValue::Tensor(array![1.0f32, 2.0].into_dyn()));
        assert!(matches!(module.load_state_dict(&bad), Err(Error::Shape { .. })));
    }

    #[test]
    fn test_zero_grad() {
        let mut p = Parameter::new("w", array![[1.0f32, 2.0]].into_dyn());
        p.grad.fill(3.0);
        p.zero_grad();
        assert!(p.grad.iter().all(|g| *g == 0.0));
        assert_eq!(numel([&p]), 2);
    }
}
