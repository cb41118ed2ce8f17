//! Training operator: the per-batch state machine
//!
//! ```text
//! Idle -> EpochRunning -> { Forward -> Backward -> LrAdjust -> EpochRunning }*
//!      -> LrAdjust -> EpochDone -> Idle
//! ```
//!
//! Any phase may move to `Shutdown`, which is terminal.

use crate::callbacks::{dispatch, CallbackRegistry, Event, HookContext, LrBoundary, MainHooks, Observer, StepState};
use crate::factory::Components;
use runtime_core::{Batch, Epoch, Error, Info, Result, StateDict, Step, Tensor, TimerCollection, WorkerPhase};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Operator state carried in snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorState {
    pub global_step: Step,
    pub main: StateDict,
}

/// Outcome of one training batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchOutcome {
    pub loss: f32,
    pub num_samples: usize,
}

/// Outputs and loss of one validation batch
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub outputs: Vec<Tensor>,
    pub loss: f32,
    pub num_samples: usize,
}

pub struct TrainingOperator {
    phase: WorkerPhase,
    global_step: Step,
    main: Box<dyn MainHooks>,
    observers: Vec<Box<dyn Observer>>,
}

impl TrainingOperator {
    pub fn new(callbacks: CallbackRegistry) -> Self {
        let (main, observers) = callbacks.into_parts();
        Self {
            phase: WorkerPhase::Idle,
            global_step: 0,
            main,
            observers,
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn global_step(&self) -> Step {
        self.global_step
    }

    pub fn main_name(&self) -> &str {
        self.main.name()
    }

    fn transition(&mut self, next: WorkerPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        trace!(from = %self.phase, to = %next, "Operator transition");
        self.phase = next;
        Ok(())
    }

    fn require_idle(&self, action: &str) -> Result<()> {
        if self.phase != WorkerPhase::Idle {
            return Err(Error::InvalidTransition {
                from: self.phase.to_string(),
                to: action.to_string(),
            });
        }
        Ok(())
    }

    /// Send `event` to the main hooks, then to every observer in registration order
    pub fn notify(&mut self, event: Event, ctx: &HookContext<'_>) -> Result<()> {
        dispatch(self.main.as_mut(), event, ctx)?;
        for observer in self.observers.iter_mut() {
            dispatch(observer.as_mut(), event, ctx)?;
        }
        Ok(())
    }

    fn notify_with(
        &mut self,
        event: Event,
        components: &Components,
        epoch: Epoch,
        batch: Option<(usize, Option<f32>)>,
        info: &Info,
    ) -> Result<()> {
        let ctx = HookContext {
            epoch,
            global_step: self.global_step,
            batch_idx: batch.map(|(idx, _)| idx),
            loss: batch.and_then(|(_, loss)| loss),
            models: &components.models,
            info,
        };
        self.notify(event, &ctx)
    }

    pub fn begin_train(&mut self, components: &Components, epoch: Epoch, info: &Info) -> Result<()> {
        self.require_idle("train")?;
        self.notify_with(Event::TrainBegin, components, epoch, None, info)
    }

    pub fn end_train(&mut self, components: &Components, epoch: Epoch, info: &Info) -> Result<()> {
        self.require_idle("train end")?;
        self.notify_with(Event::TrainEnd, components, epoch, None, info)
    }

    pub fn begin_epoch(&mut self, components: &Components, epoch: Epoch, info: &Info) -> Result<()> {
        self.transition(WorkerPhase::EpochRunning)?;
        self.notify_with(Event::EpochBegin, components, epoch, None, info)
    }

    /// Run forward, backward and the iteration lr-adjust for one batch
    pub fn train_batch(
        &mut self,
        components: &mut Components,
        batch: &Batch,
        batch_idx: usize,
        epoch: Epoch,
        info: &Info,
        timers: &TimerCollection,
    ) -> Result<BatchOutcome> {
        if self.phase != WorkerPhase::EpochRunning {
            return Err(Error::InvalidTransition {
                from: self.phase.to_string(),
                to: WorkerPhase::Forward.to_string(),
            });
        }
        self.notify_with(Event::IterBegin, components, epoch, Some((batch_idx, None)), info)?;

        let mut step = StepState::new(batch, batch_idx, info);

        self.transition(WorkerPhase::Forward)?;
        {
            let _fwd = timers.record("fwd");
            self.main.forward(components, &mut step)?;
        }
        let loss = step
            .loss
            .as_ref()
            .map(|l| l.value)
            .ok_or_else(|| Error::Internal {
                message: format!("{} produced no loss", self.main.name()),
            })?;

        self.transition(WorkerPhase::Backward)?;
        {
            let _grad = timers.record("grad");
            self.main.backward(components, &mut step)?;
        }

        self.transition(WorkerPhase::LrAdjust)?;
        self.main.lr_adjust(components, LrBoundary::Iteration, info)?;

        self.transition(WorkerPhase::EpochRunning)?;
        self.global_step += 1;

        let outcome = BatchOutcome {
            loss,
            num_samples: step.num_samples(),
        };
        self.notify_with(Event::IterEnd, components, epoch, Some((batch_idx, Some(loss))), info)?;
        Ok(outcome)
    }

    /// Run the epoch lr-adjust and return to idle
    pub fn end_epoch(&mut self, components: &mut Components, epoch: Epoch, info: &Info) -> Result<()> {
        self.transition(WorkerPhase::LrAdjust)?;
        self.main.lr_adjust(components, LrBoundary::Epoch, info)?;
        self.transition(WorkerPhase::EpochDone)?;
        self.notify_with(Event::EpochEnd, components, epoch, None, info)?;
        self.transition(WorkerPhase::Idle)
    }

    /// Forward pass and loss without touching gradients
    pub fn validate_batch(
        &mut self,
        components: &mut Components,
        batch: &Batch,
        batch_idx: usize,
        info: &Info,
    ) -> Result<ValidationOutcome> {
        self.require_idle("validate")?;
        let mut step = StepState::new(batch, batch_idx, info);
        self.main.forward(components, &mut step)?;
        let loss = step.loss.as_ref().map(|l| l.value).ok_or_else(|| Error::Internal {
            message: format!("{} produced no loss", self.main.name()),
        })?;
        Ok(ValidationOutcome {
            num_samples: step.num_samples(),
            outputs: step.outputs,
            loss,
        })
    }

    /// Model outputs for a batch made of features only
    pub fn predict_batch(&mut self, components: &mut Components, batch: &Batch) -> Result<Vec<Tensor>> {
        self.require_idle("predict")?;
        components.forward(batch)
    }

    pub fn state(&self) -> OperatorState {
        OperatorState {
            global_step: self.global_step,
            main: self.main.state_dict(),
        }
    }

    /// Restore counters and main-hook state; the operator is idle afterwards
    pub fn load_state(&mut self, state: &OperatorState) -> Result<()> {
        self.main.load_state_dict(&state.main)?;
        self.global_step = state.global_step;
        self.phase = WorkerPhase::Idle;
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.transition(WorkerPhase::Shutdown)
    }
}
