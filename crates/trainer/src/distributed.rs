//! Gradient-synchronizing wrappers around user models and optimizers

use crate::nn::{Module, Parameter};
use crate::optim::Optimizer;
use collective::{ProcessGroup, ProcessGroupHandle, ReduceOp};
use runtime_core::{Error, Result, StateDict, Tensor};
use tracing::debug;

fn gather<F>(params: &[&mut Parameter], field: F) -> Vec<f32>
where
    F: Fn(&Parameter) -> &Tensor,
{
    let mut flat = Vec::with_capacity(params.iter().map(|p| p.len()).sum());
    for param in params {
        flat.extend(field(param).iter().copied());
    }
    flat
}

fn scatter<F>(params: &mut [&mut Parameter], flat: &[f32], field: F) -> Result<()>
where
    F: Fn(&mut Parameter) -> &mut Tensor,
{
    let total: usize = params.iter().map(|p| p.len()).sum();
    if total != flat.len() {
        return Err(Error::Internal {
            message: format!("flat buffer holds {} values for {} parameters", flat.len(), total),
        });
    }

    let mut offset = 0;
    for param in params.iter_mut() {
        let target = field(param);
        let n = target.len();
        for (dst, src) in target.iter_mut().zip(&flat[offset..offset + n]) {
            *dst = *src;
        }
        offset += n;
    }
    Ok(())
}

/// Average the gradients of `params` across the group in one flat bucket
pub fn all_reduce_gradients(group: &dyn ProcessGroup, params: &mut [&mut Parameter]) -> Result<()> {
    let mut bucket = gather(params, |p| &p.grad);
    group.all_reduce(&mut bucket, ReduceOp::Mean)?;
    scatter(params, &bucket, |p| &mut p.grad)
}

/// Overwrite `params` with the values held by rank 0
pub fn broadcast_parameters(group: &dyn ProcessGroup, params: &mut [&mut Parameter]) -> Result<()> {
    let mut values = gather(params, |p| &p.value);
    group.broadcast(&mut values)?;
    scatter(params, &values, |p| &mut p.value)?;
    debug!(rank = group.rank(), count = values.len(), "Parameters synchronized from rank 0");
    Ok(())
}

/// Model whose backward pass ends with a gradient all-reduce
pub struct DistributedModel {
    inner: Box<dyn Module>,
    group: ProcessGroupHandle,
}

impl DistributedModel {
    /// Wrap `inner`, replacing its parameters with rank 0's
    pub fn wrap(mut inner: Box<dyn Module>, group: ProcessGroupHandle) -> Result<Self> {
        broadcast_parameters(group.as_ref(), &mut inner.parameters_mut())?;
        Ok(Self { inner, group })
    }

    pub fn into_inner(self) -> Box<dyn Module> {
        self.inner
    }
}

impl Module for DistributedModel {
    fn forward(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self.inner.forward(inputs)
    }

    fn backward(&mut self, grad_outputs: &[Tensor]) -> Result<()> {
        self.inner.backward(grad_outputs)?;
        all_reduce_gradients(self.group.as_ref(), &mut self.inner.parameters_mut())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.inner.parameters_mut()
    }

    fn state_dict(&self) -> StateDict {
        self.inner.state_dict()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.inner.load_state_dict(state)
    }
}

/// Optimizer that averages gradients across the group before stepping
pub struct DistributedOptimizer {
    inner: Box<dyn Optimizer>,
    group: ProcessGroupHandle,
}

impl DistributedOptimizer {
    pub fn wrap(inner: Box<dyn Optimizer>, group: ProcessGroupHandle) -> Self {
        Self { inner, group }
    }

    pub fn into_inner(self) -> Box<dyn Optimizer> {
        self.inner
    }
}

impl Optimizer for DistributedOptimizer {
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        all_reduce_gradients(self.group.as_ref(), params)?;
        self.inner.step(params)
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    fn state_dict(&self) -> StateDict {
        self.inner.state_dict()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.inner.load_state_dict(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Linear, Sgd};
    use collective::LocalRendezvous;
    use ndarray::array;
    use std::sync::Arc;
    use std::thread;

    fn run_ranks<F, T>(world: usize, f: F) -> Vec<T>
    where
        F: Fn(ProcessGroupHandle) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let rendezvous = LocalRendezvous::new(world);
        let f = Arc::new(f);
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let rendezvous = Arc::clone(&rendezvous);
                let f = Arc::clone(&f);
                thread::spawn(move || {
                    let group: ProcessGroupHandle = Arc::new(rendezvous.join(rank).unwrap());
                    f(group)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_wrap_broadcasts_rank0_weights() {
        let weights = run_ranks(2, |group| {
            let init = if group.rank() == 0 { 3.0 } else { -1.0 };
            let model = DistributedModel::wrap(Box::new(Linear::filled(1, 1, init, true)), group).unwrap();
            model.parameters()[0].value.clone()
        });
        assert_eq!(weights[0], weights[1]);
        assert_eq!(weights[0], array![[3.0f32]].into_dyn());
    }

    #[test]
    fn test_backward_averages_gradients() {
        let grads = run_ranks(2, |group| {
            let x = if group.rank() == 0 { 1.0f32 } else { 3.0 };
            let mut model = DistributedModel::wrap(Box::new(Linear::filled(1, 1, 1.0, false)), group).unwrap();
            model.forward(&[array![[x]].into_dyn()]).unwrap();
            model.backward(&[array![[1.0f32]].into_dyn()]).unwrap();
            model.parameters()[0].grad.clone()
        });
        assert_eq!(grads[0], array![[2.0f32]].into_dyn());
        assert_eq!(grads[1], grads[0]);
    }

    #[test]
    fn test_optimizer_step_averages_gradients() {
        let values = run_ranks(2, |group| {
            let mut param = Parameter::new("w", array![1.0f32].into_dyn());
            param.grad.fill(if group.rank() == 0 { 0.0 } else { 2.0 });
            let mut sgd = DistributedOptimizer::wrap(Box::new(Sgd::new(0.5)), group);
            sgd.step(&mut [&mut param]).unwrap();
            param.value[[0]]
        });
        assert_eq!(values, vec![0.5, 0.5]);
    }

    #[test]
    fn test_scatter_length_mismatch() {
        let mut param = Parameter::new("w", array![1.0f32, 2.0].into_dyn());
        let err = scatter(&mut [&mut param], &[1.0], |p| &mut p.value).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }
}
