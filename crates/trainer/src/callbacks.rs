//! Training callbacks
//!
//! A run has exactly one set of main hooks, which owns the forward, backward
//! and learning-rate steps, and any number of observers that only see
//! lifecycle events. Registering a second main callback is rejected.

use crate::factory::Components;
use crate::nn::{Loss, Module};
use runtime_core::{Batch, Epoch, Error, Info, Result, SchedulerStep, StateDict, Step, Tensor, SCHEDULER_STEP};
use std::fmt;

/// Read-only view handed to lifecycle hooks
pub struct HookContext<'a> {
    pub epoch: Epoch,
    pub global_step: Step,
    pub batch_idx: Option<usize>,
    pub loss: Option<f32>,
    pub models: &'a [Box<dyn Module>],
    pub info: &'a Info,
}

/// Lifecycle events, dispatched in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    TrainBegin,
    TrainEnd,
    EpochBegin,
    EpochEnd,
    IterBegin,
    IterEnd,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::TrainBegin => "on_train_begin",
            Event::TrainEnd => "on_train_end",
            Event::EpochBegin => "on_epoch_begin",
            Event::EpochEnd => "on_epoch_end",
            Event::IterBegin => "on_iter_begin",
            Event::IterEnd => "on_iter_end",
        };
        f.write_str(name)
    }
}

/// Lifecycle hooks; every hook defaults to doing nothing
#[allow(unused_variables)]
pub trait Observer: Send {
    fn on_train_begin(&mut self, ctx: &HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, ctx: &HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, ctx: &HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, ctx: &HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_iter_begin(&mut self, ctx: &HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_iter_end(&mut self, ctx: &HookContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Route `event` to the matching hook of `observer`
pub(crate) fn dispatch<O: Observer + ?Sized>(observer: &mut O, event: Event, ctx: &HookContext<'_>) -> Result<()> {
    match event {
        Event::TrainBegin => observer.on_train_begin(ctx),
        Event::TrainEnd => observer.on_train_end(ctx),
        Event::EpochBegin => observer.on_epoch_begin(ctx),
        Event::EpochEnd => observer.on_epoch_end(ctx),
        Event::IterBegin => observer.on_iter_begin(ctx),
        Event::IterEnd => observer.on_iter_end(ctx),
    }
}

/// Which boundary triggered an lr-adjust step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrBoundary {
    /// After a training batch
    Iteration,
    /// After the last batch of an epoch
    Epoch,
}

impl LrBoundary {
    /// Check if schedulers configured for `granularity` step at this boundary
    pub fn matches(&self, granularity: SchedulerStep) -> bool {
        matches!(
            (*self, granularity),
            (LrBoundary::Iteration, SchedulerStep::Batch) | (LrBoundary::Epoch, SchedulerStep::Epoch)
        )
    }
}

/// Scheduler granularity carried in `info`; epoch when absent
pub fn scheduler_step_of(info: &Info) -> Result<SchedulerStep> {
    match info.get(SCHEDULER_STEP) {
        None => Ok(SchedulerStep::Epoch),
        Some(value) => value
            .as_str()
            .ok_or_else(|| Error::config(format!("{} must be a string, got {}", SCHEDULER_STEP, value)))?
            .parse(),
    }
}

/// Data flowing through one training or validation step
pub struct StepState<'a> {
    pub batch: &'a Batch,
    pub batch_idx: usize,
    pub info: &'a Info,
    pub outputs: Vec<Tensor>,
    pub loss: Option<Loss>,
}

impl<'a> StepState<'a> {
    pub fn new(batch: &'a Batch, batch_idx: usize, info: &'a Info) -> Self {
        Self {
            batch,
            batch_idx,
            info,
            outputs: Vec::new(),
            loss: None,
        }
    }

    /// Split the batch into features and the trailing target
    pub fn split(&self) -> Result<(&'a [Tensor], &'a Tensor)> {
        match self.batch.split_last() {
            Some((target, features)) if !features.is_empty() => Ok((features, target)),
            _ => Err(Error::Shape {
                message: format!(
                    "batch needs at least one feature and a target, got {} tensors",
                    self.batch.len()
                ),
            }),
        }
    }

    /// Number of samples in the batch, taken from the target's leading axis
    pub fn num_samples(&self) -> usize {
        self.batch
            .last()
            .and_then(|t| t.shape().first().copied())
            .unwrap_or(0)
    }
}

/// The hooks driving one training step
pub trait MainHooks: Observer {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Compute outputs and loss into `step`
    fn forward(&mut self, components: &mut Components, step: &mut StepState<'_>) -> Result<()>;

    /// Turn the loss into parameter updates
    fn backward(&mut self, components: &mut Components, step: &mut StepState<'_>) -> Result<()>;

    /// Step learning-rate schedulers at `boundary`
    fn lr_adjust(&mut self, components: &mut Components, boundary: LrBoundary, info: &Info) -> Result<()>;

    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }

    fn load_state_dict(&mut self, _state: &StateDict) -> Result<()> {
        Ok(())
    }
}

/// Supervised single-model step: `*features, target = batch`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMainHooks;

impl Observer for DefaultMainHooks {}

impl MainHooks for DefaultMainHooks {
    fn name(&self) -> &str {
        "DefaultMainHooks"
    }

    fn forward(&mut self, components: &mut Components, step: &mut StepState<'_>) -> Result<()> {
        let (features, target) = step.split()?;
        let outputs = components.forward(features)?;
        let loss = components
            .criterion
            .loss(&outputs, std::slice::from_ref(target))?;
        step.outputs = outputs;
        step.loss = Some(loss);
        Ok(())
    }

    fn backward(&mut self, components: &mut Components, step: &mut StepState<'_>) -> Result<()> {
        let loss = step.loss.as_ref().ok_or_else(|| Error::Internal {
            message: "backward called without a loss".to_string(),
        })?;
        components.zero_grad();
        components.single_model()?.backward(&loss.grads)?;
        components.step_optimizers()
    }

    fn lr_adjust(&mut self, components: &mut Components, boundary: LrBoundary, info: &Info) -> Result<()> {
        if !components.schedulers.is_empty() && boundary.matches(scheduler_step_of(info)?) {
            components.step_schedulers();
        }
        Ok(())
    }
}

/// A registered callback
pub enum Callback {
    Main(Box<dyn MainHooks>),
    Observer(Box<dyn Observer>),
}

impl Callback {
    pub fn main(hooks: impl MainHooks + 'static) -> Self {
        Callback::Main(Box::new(hooks))
    }

    pub fn observer(hooks: impl Observer + 'static) -> Self {
        Callback::Observer(Box::new(hooks))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Main(hooks) => f.debug_tuple("Main").field(&hooks.name()).finish(),
            Callback::Observer(_) => f.write_str("Observer"),
        }
    }
}

/// Callbacks of one run
#[derive(Default)]
pub struct CallbackRegistry {
    main: Option<Box<dyn MainHooks>>,
    observers: Vec<Box<dyn Observer>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, callback: Callback) -> Result<()> {
        match callback {
            Callback::Main(hooks) => {
                if let Some(existing) = &self.main {
                    return Err(Error::DuplicateMainCallback {
                        existing: existing.name().to_string(),
                    });
                }
                self.main = Some(hooks);
            }
            Callback::Observer(hooks) => self.observers.push(hooks),
        }
        Ok(())
    }

    pub fn has_main(&self) -> bool {
        self.main.is_some()
    }

    pub fn num_observers(&self) -> usize {
        self.observers.len()
    }

    /// Main hooks (the default ones if none were registered) and observers
    pub fn into_parts(self) -> (Box<dyn MainHooks>, Vec<Box<dyn Observer>>) {
        let main = self.main.unwrap_or_else(|| Box::new(DefaultMainHooks));
        (main, self.observers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counting;

    impl Observer for Counting {}

    impl MainHooks for Counting {
        fn name(&self) -> &str {
            "Counting"
        }

        fn forward(&mut self, _: &mut Components, _: &mut StepState<'_>) -> Result<()> {
            Ok(())
        }

        fn backward(&mut self, _: &mut Components, _: &mut StepState<'_>) -> Result<()> {
            Ok(())
        }

        fn lr_adjust(&mut self, _: &mut Components, _: LrBoundary, _: &Info) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_second_main_rejected() {
        let mut registry = CallbackRegistry::new();
        registry.register(Callback::main(Counting)).unwrap();
        registry.register(Callback::observer(DefaultMainHooks)).unwrap();

        let err = registry.register(Callback::main(DefaultMainHooks)).unwrap_err();
        assert!(matches!(err, Error::DuplicateMainCallback { ref existing } if existing == "Counting"));
        assert_eq!(registry.num_observers(), 1);

        let (main, observers) = registry.into_parts();
        assert_eq!(main.name(), "Counting");
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_default_main_when_none_registered() {
        let registry = CallbackRegistry::new();
        assert!(!registry.has_main());
        let (main, _) = registry.into_parts();
        assert_eq!(main.name(), "DefaultMainHooks");
    }

    #[test]
    fn test_scheduler_step_from_info() {
        let mut info = Info::new();
        assert_eq!(scheduler_step_of(&info).unwrap(), SchedulerStep::Epoch);
        info.insert(SCHEDULER_STEP.to_string(), json!("batch"));
        assert_eq!(scheduler_step_of(&info).unwrap(), SchedulerStep::Batch);
        info.insert(SCHEDULER_STEP.to_string(), json!("manual"));
        assert!(scheduler_step_of(&info).is_err());

        assert!(LrBoundary::Iteration.matches(SchedulerStep::Batch));
        assert!(!LrBoundary::Iteration.matches(SchedulerStep::Epoch));
        assert!(LrBoundary::Epoch.matches(SchedulerStep::Epoch));
    }

    #[test]
    fn test_split_batch() {
        let batch = vec![
            ndarray::array![[1.0f32], [2.0]].into_dyn(),
            ndarray::array![0.0f32, 1.0].into_dyn(),
        ];
        let info = Info::new();
        let step = StepState::new(&batch, 0, &info);
        let (features, target) = step.split().unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(target.len(), 2);
        assert_eq!(step.num_samples(), 2);

        let lonely = vec![ndarray::array![1.0f32].into_dyn()];
        assert!(StepState::new(&lonely, 0, &info).split().is_err());
    }
}
