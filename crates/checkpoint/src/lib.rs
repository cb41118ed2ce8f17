//! Checkpoint management for distributed training
//!
//! Provides filename templating, the checkpoint file format, atomic
//! checkpoint storage and the manager deciding when and where to save.

pub mod format;
pub mod manager;
pub mod store;
pub mod template;

pub use format::{CheckpointHeader, CHECKPOINT_MAGIC, CHECKPOINT_VERSION};
pub use manager::{CheckpointManager, LoadedCheckpoint, WrittenCheckpoint};
pub use store::CheckpointStore;
pub use template::{format_checkpoint_name, last_checkpoint_name, CHECKPOINT_EXTENSION};
