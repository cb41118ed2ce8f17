//! Worker placement, rank resolution and training phases

use crate::{Error, Rank, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Ordered `host:port` addresses, one per worker, fixed by the external rendezvous
pub type ClusterInfo = Vec<String>;

/// Phase of a worker's training operator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Between epochs
    Idle,

    /// Inside an epoch, between batches
    EpochRunning,

    /// Running the forward pass of a batch
    Forward,

    /// Running backward and optimizer steps
    Backward,

    /// Stepping learning-rate schedulers
    LrAdjust,

    /// Epoch finished, statistics not yet collected
    EpochDone,

    /// Terminal state
    Shutdown,
}

impl WorkerPhase {
    /// Returns true if `next` is a legal successor of this phase
    pub fn can_transition_to(&self, next: WorkerPhase) -> bool {
        use WorkerPhase::*;
        match (self, next) {
            (Shutdown, _) => false,
            (_, Shutdown) => true,
            (Idle, EpochRunning) => true,
            (EpochRunning, Forward) | (EpochRunning, LrAdjust) | (EpochRunning, EpochDone) => {
                true
            }
            (Forward, Backward) | (Forward, EpochRunning) => true,
            (Backward, LrAdjust) => true,
            (LrAdjust, EpochRunning) | (LrAdjust, EpochDone) => true,
            (EpochDone, Idle) => true,
            _ => false,
        }
    }

    /// Returns true while an epoch is in progress
    pub fn is_in_epoch(&self) -> bool {
        matches!(
            self,
            WorkerPhase::EpochRunning
                | WorkerPhase::Forward
                | WorkerPhase::Backward
                | WorkerPhase::LrAdjust
        )
    }
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Where this worker's task was placed by the cluster scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPlacement {
    /// Index of this task within the job
    pub task_index: usize,

    /// Address of every task in the job, indexed by task index
    pub task_addresses: Vec<String>,

    /// Pre-established worker addresses
    pub cluster_info: ClusterInfo,
}

impl WorkerPlacement {
    /// Total number of workers in the group
    pub fn world_size(&self) -> usize {
        self.cluster_info.len()
    }

    /// Rendezvous URL served by the rank-0 worker
    pub fn rendezvous_url(&self) -> Result<String> {
        let root = self.cluster_info.first().ok_or_else(|| Error::RankResolution {
            address: self.local_address().unwrap_or_default().to_string(),
            required: 1,
            found: 0,
        })?;
        Ok(format!("tcp://{}", root))
    }

    fn local_address(&self) -> Option<&str> {
        self.task_addresses.get(self.task_index).map(String::as_str)
    }

    /// Resolve this worker's global rank
    pub fn resolve_rank(&self) -> Result<Rank> {
        resolve_rank(self.task_index, &self.task_addresses, &self.cluster_info)
    }
}

/// Host part of a `host:port` address
pub fn host_of(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => address,
    }
}

/// Derive a worker's global rank from task placement and the cluster info list.
///
/// Task placement may differ between the job that built `cluster_info` and the
/// current one, so the task index cannot be used directly. Instead, count how
/// many lower-indexed tasks share this host (the local rank) and pick the
/// matching occurrence of the host in `cluster_info`.
pub fn resolve_rank(
    task_index: usize,
    task_addresses: &[String],
    cluster_info: &[String],
) -> Result<Rank> {
    let local_address = task_addresses
        .get(task_index)
        .ok_or_else(|| Error::RankResolution {
            address: format!("task-{}", task_index),
            required: task_index + 1,
            found: task_addresses.len(),
        })?;
    let local_host = host_of(local_address);

    let local_rank = task_addresses[..task_index]
        .iter()
        .filter(|addr| host_of(addr) == local_host)
        .count();

    let mut seen = 0;
    for (global_rank, node) in cluster_info.iter().enumerate() {
        if host_of(node) == local_host {
            if seen == local_rank {
                debug!(
                    host = local_host,
                    local_rank, global_rank, "Resolved worker rank"
                );
                info!(rank = global_rank, world_size = cluster_info.len(), "Worker rank resolved");
                return Ok(global_rank);
            }
            seen += 1;
        }
    }

    Err(Error::RankResolution {
        address: local_address.clone(),
        required: local_rank + 1,
        found: seen,
    })
}
