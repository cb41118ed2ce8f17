//! Rank-aware re-wrapping of user data loaders

use crate::loader::DataLoader;
use crate::sampler::{DistributedSampler, Sampler};
use runtime_core::{Rank, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Position of this worker in the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardContext {
    pub rank: Rank,
    pub world_size: usize,
}

/// When to install a distributed sampler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WrapPolicy {
    /// Wrap unless the loader already shards by rank
    #[default]
    Auto,
    /// Always replace the sampler
    Always,
    /// Use the loader as given
    Never,
}

/// Derives per-rank loaders from user loaders
pub struct DataLoaderAdapter;

impl DataLoaderAdapter {
    /// Check if `loader` would be re-sampled under `policy`
    pub fn should_wrap(loader: &DataLoader, policy: WrapPolicy) -> bool {
        if loader.is_iterable() {
            return false;
        }
        match policy {
            WrapPolicy::Auto => !loader.shards_by_rank(),
            WrapPolicy::Always => true,
            WrapPolicy::Never => false,
        }
    }

    /// Return a loader yielding only this rank's share of every epoch.
    ///
    /// The input loader is left untouched. Iterable sources are returned as
    /// they are since they cannot be re-sampled. The shuffle setting carries
    /// over from the original sampler.
    pub fn wrap(loader: &DataLoader, ctx: ShardContext, policy: WrapPolicy) -> Result<DataLoader> {
        if loader.is_iterable() && policy != WrapPolicy::Never {
            warn!(
                rank = ctx.rank,
                "Iterable data sources are not re-sampled; every rank must shard its own stream"
            );
        }
        if !Self::should_wrap(loader, policy) {
            return Ok(loader.clone());
        }

        let mut sampler = DistributedSampler::new(ctx.world_size, ctx.rank)?;
        match loader.sampler() {
            Sampler::Random { seed } => sampler = sampler.with_shuffle(*seed),
            Sampler::Distributed(existing) if existing.shuffle() => {
                sampler = sampler.with_shuffle(existing.seed())
            }
            _ => {}
        }

        debug!(
            rank = ctx.rank,
            world_size = ctx.world_size,
            shuffle = sampler.shuffle(),
            "Installed distributed sampler"
        );
        Ok(loader.clone().with_sampler(Sampler::Distributed(sampler)))
    }
}
