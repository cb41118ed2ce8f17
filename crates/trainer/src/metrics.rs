//! Epoch and validation statistics

use runtime_core::{Epoch, Result, Tensor, TimerStats};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the sample-weighted mean training loss
pub const TRAIN_LOSS: &str = "train_loss";
/// Name of the sample-weighted mean validation loss
pub const VAL_LOSS: &str = "val_loss";
/// Number of samples seen by this worker (or by all workers when stats are synced)
pub const NUM_SAMPLES: &str = "num_samples";

/// Streaming metric accumulated over the batches of one pass
pub trait Metric: Send {
    fn name(&self) -> &str;

    fn reset(&mut self);

    fn update(&mut self, outputs: &[Tensor], targets: &[Tensor]) -> Result<()>;

    fn compute(&self) -> f64;
}

/// Result of one training epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: Epoch,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<BTreeMap<String, TimerStats>>,
}

impl EpochStats {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn train_loss(&self) -> Option<f64> {
        self.get(TRAIN_LOSS)
    }
}

/// Result of one validation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub num_samples: usize,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<BTreeMap<String, TimerStats>>,
}

impl ValidationStats {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Running sample-weighted mean
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WeightedMean {
    total: f64,
    weight: usize,
}

impl WeightedMean {
    pub fn add(&mut self, value: f64, weight: usize) {
        self.total += value * weight as f64;
        self.weight += weight;
    }

    pub fn weight(&self) -> usize {
        self.weight
    }

    pub fn mean(&self) -> f64 {
        if self.weight == 0 {
            0.0
        } else {
            self.total / self.weight as f64
        }
    }
}
