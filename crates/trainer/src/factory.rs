//! Building models, optimizers, schedulers and the criterion from user creators

use crate::nn::{Criterion, Module, Parameter};
use crate::optim::{zero_grad, LrScheduler, Optimizer};
use runtime_core::{BoxError, Error, Result, SyncMode, Tensor, TrainConfig};
use std::fmt;
use tracing::debug;

/// A creator may return one component or an ordered list of them
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

impl<T> From<T> for OneOrMany<T> {
    fn from(item: T) -> Self {
        OneOrMany::One(item)
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(items: Vec<T>) -> Self {
        OneOrMany::Many(items)
    }
}

pub type CreatorResult<T> = std::result::Result<T, BoxError>;

pub type ModelCreator =
    Box<dyn Fn(&TrainConfig) -> CreatorResult<OneOrMany<Box<dyn Module>>> + Send>;
pub type OptimizerCreator = Box<
    dyn Fn(&[Box<dyn Module>], &TrainConfig) -> CreatorResult<OneOrMany<Box<dyn Optimizer>>>
        + Send,
>;
pub type LossCreator = Box<dyn Fn(&TrainConfig) -> CreatorResult<Box<dyn Criterion>> + Send>;
pub type SchedulerCreator = Box<
    dyn Fn(&[Box<dyn Optimizer>], &TrainConfig) -> CreatorResult<OneOrMany<Box<dyn LrScheduler>>>
        + Send,
>;

/// User-supplied component creators
#[derive(Default)]
pub struct ComponentFactory {
    model_creator: Option<ModelCreator>,
    optimizer_creator: Option<OptimizerCreator>,
    loss_creator: Option<LossCreator>,
    scheduler_creator: Option<SchedulerCreator>,
}

impl ComponentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_creator<F>(mut self, creator: F) -> Self
    where
        F: Fn(&TrainConfig) -> CreatorResult<OneOrMany<Box<dyn Module>>> + Send + 'static,
    {
        self.model_creator = Some(Box::new(creator));
        self
    }

    pub fn optimizer_creator<F>(mut self, creator: F) -> Self
    where
        F: Fn(&[Box<dyn Module>], &TrainConfig) -> CreatorResult<OneOrMany<Box<dyn Optimizer>>>
            + Send
            + 'static,
    {
        self.optimizer_creator = Some(Box::new(creator));
        self
    }

    pub fn loss_creator<F>(mut self, creator: F) -> Self
    where
        F: Fn(&TrainConfig) -> CreatorResult<Box<dyn Criterion>> + Send + 'static,
    {
        self.loss_creator = Some(Box::new(creator));
        self
    }

    pub fn scheduler_creator<F>(mut self, creator: F) -> Self
    where
        F: Fn(&[Box<dyn Optimizer>], &TrainConfig) -> CreatorResult<OneOrMany<Box<dyn LrScheduler>>>
            + Send
            + 'static,
    {
        self.scheduler_creator = Some(Box::new(creator));
        self
    }

    /// Run the creators and validate what they returned
    pub fn build(&self, config: &TrainConfig, sync_mode: SyncMode) -> Result<Components> {
        let model_creator = self
            .model_creator
            .as_ref()
            .ok_or(Error::MissingCreator {
                creator: "model_creator",
            })?;
        let optimizer_creator = self
            .optimizer_creator
            .as_ref()
            .ok_or(Error::MissingCreator {
                creator: "optimizer_creator",
            })?;
        let loss_creator = self.loss_creator.as_ref().ok_or(Error::MissingCreator {
            creator: "loss_creator",
        })?;

        let models = model_creator(config).map_err(Error::Training)?.into_vec();
        if models.is_empty() {
            return Err(Error::config("model_creator returned no models"));
        }
        if let Some(index) = models.iter().position(|m| m.parameters().is_empty()) {
            return Err(Error::config(format!(
                "model {} has no trainable parameters",
                index
            )));
        }

        let optimizers = optimizer_creator(&models, config)
            .map_err(Error::Training)?
            .into_vec();
        if sync_mode.requires_single_optimizer() && (optimizers.len() != 1 || models.len() != 1) {
            return Err(Error::OptimizerCountMismatch {
                backend: format!("{:?} sync", sync_mode).to_lowercase(),
                count: optimizers.len().max(models.len()),
            });
        }
        if optimizers.is_empty() || (optimizers.len() != 1 && optimizers.len() != models.len()) {
            return Err(Error::config(format!(
                "expected 1 or {} optimizers, got {}",
                models.len(),
                optimizers.len()
            )));
        }

        let schedulers = match &self.scheduler_creator {
            Some(creator) => creator(&optimizers, config)
                .map_err(Error::Training)?
                .into_vec(),
            None => Vec::new(),
        };
        if schedulers.len() > optimizers.len() {
            return Err(Error::config(format!(
                "{} schedulers for {} optimizers",
                schedulers.len(),
                optimizers.len()
            )));
        }

        let criterion = loss_creator(config).map_err(Error::Training)?;

        debug!(
            models = models.len(),
            optimizers = optimizers.len(),
            schedulers = schedulers.len(),
            "Components created"
        );

        Ok(Components {
            models,
            optimizers,
            schedulers,
            criterion,
        })
    }
}

impl fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("model_creator", &self.model_creator.is_some())
            .field("optimizer_creator", &self.optimizer_creator.is_some())
            .field("loss_creator", &self.loss_creator.is_some())
            .field("scheduler_creator", &self.scheduler_creator.is_some())
            .finish()
    }
}

/// Everything the training loop works on.
///
/// Optimizer `i` drives model `i`, or every model when there is a single
/// optimizer. Scheduler `i` drives optimizer `i`.
pub struct Components {
    pub models: Vec<Box<dyn Module>>,
    pub optimizers: Vec<Box<dyn Optimizer>>,
    pub schedulers: Vec<Box<dyn LrScheduler>>,
    pub criterion: Box<dyn Criterion>,
}

impl fmt::Debug for Components {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Components")
            .field("models", &self.models.len())
            .field("optimizers", &self.optimizers.len())
            .field("schedulers", &self.schedulers.len())
            .finish()
    }
}

impl Components {
    /// Check if optimizer `optimizer` updates model `model`
    pub fn drives(&self, optimizer: usize, model: usize) -> bool {
        self.optimizers.len() == 1 || optimizer == model
    }

    /// The only model; multi-model setups need their own main hooks
    pub fn single_model(&mut self) -> Result<&mut Box<dyn Module>> {
        match self.models.as_mut_slice() {
            [model] => Ok(model),
            models => Err(Error::config(format!(
                "default training hooks drive exactly one model, found {}",
                models.len()
            ))),
        }
    }

    pub fn forward(&mut self, features: &[Tensor]) -> Result<Vec<Tensor>> {
        self.single_model()?.forward(features)
    }

    /// Clear the gradients of every parameter any optimizer drives
    pub fn zero_grad(&mut self) {
        for model in self.models.iter_mut() {
            zero_grad(&mut model.parameters_mut());
        }
    }

    /// Step every optimizer over the parameters of the models it drives
    pub fn step_optimizers(&mut self) -> Result<()> {
        let single = self.optimizers.len() == 1;
        for (i, optimizer) in self.optimizers.iter_mut().enumerate() {
            let mut params: Vec<&mut Parameter> = self
                .models
                .iter_mut()
                .enumerate()
                .filter(|(j, _)| single || *j == i)
                .flat_map(|(_, model)| model.parameters_mut())
                .collect();
            optimizer.step(&mut params)?;
        }
        Ok(())
    }

    /// Step scheduler `i` against optimizer `i`
    pub fn step_schedulers(&mut self) {
        for (scheduler, optimizer) in self.schedulers.iter_mut().zip(self.optimizers.iter_mut()) {
            scheduler.step(optimizer.as_mut());
        }
    }

    /// Current learning rate of every optimizer
    pub fn learning_rates(&self) -> Vec<f64> {
        self.optimizers.iter().map(|o| o.learning_rate()).collect()
    }
}
