//! Runtime Core - Foundation for the distributed training runner
//!
//! Provides core types, error handling, configuration, rank resolution,
//! phase timers and the single-threaded I/O runtime shared by every crate.

pub mod config;
pub mod error;
pub mod profile;
pub mod runtime;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use config::{
    BackendKind, CheckpointConfig, CheckpointTrigger, NetworkConfig, RunnerConfig,
    SchedulerStep, SyncMode, TrainConfig,
};
pub use error::{BoxError, Error, ErrorKind, Result};
pub use profile::{TimerCollection, TimerGuard, TimerStats};
pub use runtime::{RuntimeHandle, RuntimeManager};
pub use types::*;
pub use worker::{resolve_rank, ClusterInfo, WorkerPhase, WorkerPlacement};
