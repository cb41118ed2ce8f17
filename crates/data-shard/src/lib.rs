//! Data sharding for distributed training
//!
//! This crate provides:
//! - **Datasets**: map-style [`Dataset`] and stream-style [`IterableDataset`]
//! - **Batching**: [`DataLoader`] collating samples into batches per epoch
//! - **Sampling**: [`DistributedSampler`] giving every rank a disjoint share of
//!   a deterministically shuffled epoch order
//! - **Adaptation**: [`DataLoaderAdapter`] deriving a per-rank loader from a
//!   user loader without mutating it
//!
//! # Example
//!
//! ```rust
//! use data_shard::{DataLoader, DataLoaderAdapter, ShardContext, TensorDataset, WrapPolicy};
//! use std::sync::Arc;
//!
//! let features = ndarray::Array::zeros((8, 3)).into_dyn();
//! let labels = ndarray::Array::zeros(8).into_dyn();
//! let dataset = TensorDataset::new(vec![features, labels]).unwrap();
//!
//! let loader = DataLoader::new(Arc::new(dataset), 2).unwrap().with_shuffle(42);
//! let ctx = ShardContext { rank: 0, world_size: 2 };
//! let local = DataLoaderAdapter::wrap(&loader, ctx, WrapPolicy::Auto).unwrap();
//!
//! assert_eq!(local.num_batches(), Some(2));
//! ```

mod adapter;
mod dataset;
mod loader;
mod sampler;

pub use adapter::{DataLoaderAdapter, ShardContext, WrapPolicy};
pub use dataset::{Dataset, IterableDataset, SampleStream, TensorDataset};
pub use loader::{collate, Batches, DataLoader, DataSource};
pub use sampler::{epoch_seed, shuffled_indices, DistributedSampler, Sampler};
