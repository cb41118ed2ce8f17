//! Core type definitions for the distributed training runner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::{Error, Result};

/// Dense tensor of 32-bit floats with a dynamic shape
pub type Tensor = ndarray::ArrayD<f32>;

/// Ordered sequence of tensors; the last element of a training batch is the target
pub type Batch = Vec<Tensor>;

/// A single (un-collated) sample, same layout as a batch
pub type Sample = Vec<Tensor>;

/// Zero-based worker index within the process group
pub type Rank = usize;

/// Training step and epoch counters
pub type Step = u64;
pub type Epoch = u64;

/// Side-channel map passed along with every epoch
pub type Info = BTreeMap<String, serde_json::Value>;

/// Key under which the scheduler step granularity travels in [`Info`]
pub const SCHEDULER_STEP: &str = "scheduler_step";

/// Single value inside a [`StateDict`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Int(i64),
    Float(f64),
    Text(String),
    Tensor(Tensor),
    List(Vec<StateValue>),
}

impl StateValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StateValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            StateValue::Float(v) => Some(*v),
            StateValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            StateValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Named state of one component (model, optimizer, scheduler, operator)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    entries: BTreeMap<String, StateValue>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: StateValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateValue)> {
        self.entries.iter()
    }

    /// Look up a key that must exist
    pub fn require(&self, key: &str) -> Result<&StateValue> {
        self.get(key).ok_or_else(|| Error::Serialization(format!(
            "state dict is missing key: {}",
            key
        )))
    }

    /// Look up a tensor that must exist
    pub fn require_tensor(&self, key: &str) -> Result<&Tensor> {
        self.require(key)?
            .as_tensor()
            .ok_or_else(|| Error::Serialization(format!("state key {} is not a tensor", key)))
    }

    /// Look up a float that must exist
    pub fn require_float(&self, key: &str) -> Result<f64> {
        self.require(key)?
            .as_float()
            .ok_or_else(|| Error::Serialization(format!("state key {} is not a number", key)))
    }

    /// Look up an integer that must exist
    pub fn require_int(&self, key: &str) -> Result<i64> {
        self.require(key)?
            .as_int()
            .ok_or_else(|| Error::Serialization(format!("state key {} is not an integer", key)))
    }
}

/// Checkpoint content type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CheckpointType {
    /// Full runner state
    Full,

    /// Model weights only
    ModelOnly,
}

impl CheckpointType {
    pub fn as_u8(self) -> u8 {
        match self {
            CheckpointType::Full => 0,
            CheckpointType::ModelOnly => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CheckpointType::Full),
            1 => Some(CheckpointType::ModelOnly),
            _ => None,
        }
    }
}

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Storage path
    pub path: String,

    /// Training step at checkpoint
    pub step: Step,

    /// Training epoch at checkpoint
    pub epoch: Epoch,

    /// Checkpoint size in bytes
    pub size_bytes: u64,

    /// Timestamp when checkpoint was created
    pub created_at: DateTime<Utc>,

    /// Checkpoint type
    pub checkpoint_type: CheckpointType,

    /// Additional metadata
    pub metadata: HashMap<String, String>,
}
