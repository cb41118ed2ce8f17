//! Trainer - the per-worker distributed training runner
//!
//! A [`Runner`] is created once per worker process. It resolves the worker's
//! rank from the cluster placement, joins the process group, builds models,
//! optimizers, schedulers and the criterion from user creators and then runs
//! a synchronized training loop. Gradients are averaged across workers either
//! inside every model's backward pass or right before the optimizer steps.
//!
//! # Example
//!
//! ```rust,ignore
//! use trainer::{OneOrMany, RunnerBuilder, TrainOptions};
//!
//! let mut runner = RunnerBuilder::new(config, train_config)
//!     .model_creator(|cfg| Ok(OneOrMany::One(build_model(cfg))))
//!     .optimizer_creator(|models, cfg| Ok(OneOrMany::One(build_optimizer(models, cfg))))
//!     .loss_creator(|_| Ok(Box::new(MyLoss)))
//!     .build(&placement)?;
//!
//! let stats = runner.train_epochs(&loader, 10, TrainOptions::default())?;
//! runner.shutdown()?;
//! ```

pub mod callbacks;
pub mod distributed;
pub mod factory;
pub mod metrics;
pub mod nn;
pub mod operator;
pub mod optim;
pub mod runner;
pub mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use callbacks::{
    Callback, CallbackRegistry, DefaultMainHooks, Event, HookContext, LrBoundary, MainHooks,
    Observer, StepState,
};
pub use distributed::{DistributedModel, DistributedOptimizer};
pub use factory::{ComponentFactory, Components, OneOrMany};
pub use metrics::{EpochStats, Metric, ValidationStats, NUM_SAMPLES, TRAIN_LOSS, VAL_LOSS};
pub use nn::{Criterion, Loss, Module, Parameter};
pub use operator::{OperatorState, TrainingOperator};
pub use optim::{LrScheduler, Optimizer};
pub use runner::{Runner, RunnerBuilder, TrainOptions, ValidateOptions};
pub use state::{ModelWeights, StateSerializer, StateSnapshot};
