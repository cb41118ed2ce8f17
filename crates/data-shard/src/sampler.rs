//! Index samplers, including the rank-partitioning distributed sampler

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use runtime_core::{Epoch, Error, Rank, Result};
use serde::{Deserialize, Serialize};

/// Mix the base seed with the epoch so every epoch gets its own order
pub fn epoch_seed(seed: u64, epoch: Epoch) -> u64 {
    seed ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Deterministic permutation of `0..len` for `(seed, epoch)`
pub fn shuffled_indices(len: usize, seed: u64, epoch: Epoch) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(epoch_seed(seed, epoch));
    indices.shuffle(&mut rng);
    indices
}

/// Partitions an epoch's index order across the ranks of a group.
///
/// Rank `r` takes positions `r, r + n, r + 2n, ...` of the (optionally
/// shuffled) order, so the ranks' shares are disjoint and cover every index.
/// With padding enabled the order is extended by wrapping around until its
/// length divides evenly, and every rank sees the same number of samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSampler {
    num_replicas: usize,
    rank: Rank,
    shuffle: bool,
    seed: u64,
    pad: bool,
}

impl DistributedSampler {
    pub fn new(num_replicas: usize, rank: Rank) -> Result<Self> {
        if num_replicas == 0 || rank >= num_replicas {
            return Err(Error::config(format!(
                "sampler rank {} outside {} replicas",
                rank, num_replicas
            )));
        }
        Ok(Self {
            num_replicas,
            rank,
            shuffle: false,
            seed: 0,
            pad: false,
        })
    }

    /// Shuffle every epoch with `seed`
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    /// Repeat indices so every rank gets the same share size
    pub fn with_padding(mut self, pad: bool) -> Self {
        self.pad = pad;
        self
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Full index order of `epoch`, identical on every rank
    pub fn epoch_order(&self, len: usize, epoch: Epoch) -> Vec<usize> {
        let mut order = if self.shuffle {
            shuffled_indices(len, self.seed, epoch)
        } else {
            (0..len).collect()
        };

        if self.pad && len > 0 {
            let total = len.div_ceil(self.num_replicas) * self.num_replicas;
            let mut i = 0;
            while order.len() < total {
                order.push(order[i]);
                i += 1;
            }
        }
        order
    }

    /// This rank's indices for `epoch`
    pub fn indices(&self, len: usize, epoch: Epoch) -> Vec<usize> {
        self.epoch_order(len, epoch)
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }

    /// Number of indices this rank receives per epoch
    pub fn num_samples(&self, len: usize) -> usize {
        if self.pad {
            len.div_ceil(self.num_replicas)
        } else {
            (len + self.num_replicas - 1 - self.rank) / self.num_replicas
        }
    }
}

/// Index order used by a [`DataLoader`](crate::DataLoader)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sampler {
    Sequential,
    Random { seed: u64 },
    Distributed(DistributedSampler),
}

impl Sampler {
    pub fn indices(&self, len: usize, epoch: Epoch) -> Vec<usize> {
        match self {
            Sampler::Sequential => (0..len).collect(),
            Sampler::Random { seed } => shuffled_indices(len, *seed, epoch),
            Sampler::Distributed(sampler) => sampler.indices(len, epoch),
        }
    }

    pub fn num_samples(&self, len: usize) -> usize {
        match self {
            Sampler::Sequential | Sampler::Random { .. } => len,
            Sampler::Distributed(sampler) => sampler.num_samples(len),
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Sampler::Distributed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_ranks(world: usize, len: usize, epoch: Epoch, seed: Option<u64>) -> Vec<Vec<usize>> {
        (0..world)
            .map(|rank| {
                let mut sampler = DistributedSampler::new(world, rank).unwrap();
                if let Some(seed) = seed {
                    sampler = sampler.with_shuffle(seed);
                }
                sampler.indices(len, epoch)
            })
            .collect()
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        for world in 1..=5 {
            for len in [0usize, 1, 7, 100, 101] {
                let shares = all_ranks(world, len, 3, Some(42));
                let mut all: Vec<usize> = shares.iter().flatten().copied().collect();
                all.sort();
                assert_eq!(all, (0..len).collect::<Vec<_>>(), "world {} len {}", world, len);
            }
        }
    }

    #[test]
    fn test_num_samples_matches_share() {
        for world in 1..=4 {
            for rank in 0..world {
                let sampler = DistributedSampler::new(world, rank).unwrap();
                for len in [0usize, 3, 10, 11] {
                    assert_eq!(sampler.num_samples(len), sampler.indices(len, 0).len());
                }
            }
        }
    }

    #[test]
    fn test_round_robin_without_shuffle() {
        let shares = all_ranks(2, 4, 0, None);
        assert_eq!(shares[0], vec![0, 2]);
        assert_eq!(shares[1], vec![1, 3]);
    }

    #[test]
    fn test_deterministic_per_epoch() {
        let a = all_ranks(3, 50, 1, Some(7));
        let b = all_ranks(3, 50, 1, Some(7));
        assert_eq!(a, b);

        let next = all_ranks(3, 50, 2, Some(7));
        assert_ne!(a, next);
    }

    #[test]
    fn test_padding_evens_shares() {
        let shares: Vec<Vec<usize>> = (0..4)
            .map(|rank| {
                DistributedSampler::new(4, rank)
                    .unwrap()
                    .with_padding(true)
                    .indices(10, 0)
            })
            .collect();

        assert!(shares.iter().all(|s| s.len() == 3));
        let mut covered: Vec<usize> = shares.concat();
        covered.sort();
        covered.dedup();
        assert_eq!(covered.len(), 10);
    }

    #[test]
    fn test_invalid_rank() {
        assert!(DistributedSampler::new(2, 2).is_err());
        assert!(DistributedSampler::new(0, 0).is_err());
    }
}
