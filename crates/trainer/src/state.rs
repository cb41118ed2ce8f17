//! Runner snapshots and their byte encoding

use crate::factory::Components;
use crate::operator::{OperatorState, TrainingOperator};
use runtime_core::{Epoch, Error, Result, StateDict};
use serde::{Deserialize, Serialize};

/// Complete resumable state of a runner.
///
/// Lists follow component creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub epoch: Epoch,
    pub operator: OperatorState,
    pub models: Vec<StateDict>,
    pub optimizers: Vec<StateDict>,
    pub schedulers: Option<Vec<StateDict>>,
}

impl StateSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Model weights only, written by `weights_only` checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    pub epoch: Epoch,
    pub models: Vec<StateDict>,
}

impl ModelWeights {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn check_count(component: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::StateMismatch {
            component,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Captures and applies [`StateSnapshot`]s
pub struct StateSerializer;

impl StateSerializer {
    pub fn capture(epoch: Epoch, operator: &TrainingOperator, components: &Components) -> StateSnapshot {
        let schedulers = if components.schedulers.is_empty() {
            None
        } else {
            Some(components.schedulers.iter().map(|s| s.state_dict()).collect())
        };
        StateSnapshot {
            epoch,
            operator: operator.state(),
            models: components.models.iter().map(|m| m.state_dict()).collect(),
            optimizers: components.optimizers.iter().map(|o| o.state_dict()).collect(),
            schedulers,
        }
    }

    /// Apply `snapshot`, returning the restored epoch counter.
    ///
    /// Component counts are checked before anything is modified.
    pub fn apply(
        snapshot: &StateSnapshot,
        operator: &mut TrainingOperator,
        components: &mut Components,
    ) -> Result<Epoch> {
        check_count("models", components.models.len(), snapshot.models.len())?;
        check_count("optimizers", components.optimizers.len(), snapshot.optimizers.len())?;
        let schedulers = snapshot.schedulers.as_deref().unwrap_or_default();
        check_count("schedulers", components.schedulers.len(), schedulers.len())?;

        for (model, state) in components.models.iter_mut().zip(&snapshot.models) {
            model.load_state_dict(state)?;
        }
        for (optimizer, state) in components.optimizers.iter_mut().zip(&snapshot.optimizers) {
            optimizer.load_state_dict(state)?;
        }
        for (scheduler, state) in components.schedulers.iter_mut().zip(schedulers) {
            scheduler.load_state_dict(state)?;
        }
        operator.load_state(&snapshot.operator)?;
        Ok(snapshot.epoch)
    }

    pub fn capture_weights(epoch: Epoch, components: &Components) -> ModelWeights {
        ModelWeights {
            epoch,
            models: components.models.iter().map(|m| m.state_dict()).collect(),
        }
    }

    pub fn apply_weights(weights: &ModelWeights, components: &mut Components) -> Result<Epoch> {
        check_count("models", components.models.len(), weights.models.len())?;
        for (model, state) in components.models.iter_mut().zip(&weights.models) {
            model.load_state_dict(state)?;
        }
        Ok(weights.epoch)
    }
}
