//! Collective - process-group membership and gradient-averaging collectives
//!
//! Workers join a group through a rendezvous URL and then exchange flat
//! `f32` buffers (and `f64` statistics) with blocking all-reduce, broadcast and
//! barrier calls.
//!
//! Two backends are provided:
//! - `tcp`: rank 0 listens on the rendezvous address, reduces every
//!   collective in rank order and sends the result back to its peers
//! - `local`: workers are threads of one process sharing a [`LocalRendezvous`]

pub mod group;
pub mod local;
pub mod tcp;
pub mod wire;

pub use group::{CollectiveOp, Element, ProcessGroup, ProcessGroupHandle, ReduceOp, Values};
pub use local::{LocalProcessGroup, LocalRendezvous};
pub use tcp::TcpProcessGroup;

use runtime_core::{BackendKind, Error, NetworkConfig, Rank, Result, RuntimeHandle};
use std::sync::Arc;

/// Everything needed to join a process group besides rank and URL
#[derive(Clone)]
pub struct GroupInitializer {
    backend: BackendKind,
    network: NetworkConfig,
    runtime: RuntimeHandle,
    local: Option<Arc<LocalRendezvous>>,
}

impl GroupInitializer {
    pub fn new(backend: BackendKind, network: NetworkConfig, runtime: RuntimeHandle) -> Self {
        Self {
            backend,
            network,
            runtime,
            local: None,
        }
    }

    /// Rendezvous used when the backend is [`BackendKind::Local`]
    pub fn with_local_rendezvous(mut self, rendezvous: Arc<LocalRendezvous>) -> Self {
        self.local = Some(rendezvous);
        self
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Join the group as `rank`; blocks until all `world_size` members joined
    pub fn init(&self, url: &str, rank: Rank, world_size: usize) -> Result<ProcessGroupHandle> {
        match self.backend {
            BackendKind::Tcp => {
                let group = TcpProcessGroup::join(
                    Arc::clone(&self.runtime),
                    url,
                    rank,
                    world_size,
                    &self.network,
                )?;
                Ok(Arc::new(group))
            }
            BackendKind::Local => {
                let rendezvous = self.local.as_ref().ok_or_else(|| {
                    Error::config("local backend selected without an in-process rendezvous")
                })?;
                if rendezvous.world_size() != world_size {
                    return Err(Error::GroupJoin {
                        url: url.to_string(),
                        message: format!(
                            "rendezvous sized for {} workers, asked for {}",
                            rendezvous.world_size(),
                            world_size
                        ),
                    });
                }
                Ok(Arc::new(rendezvous.join(rank)?))
            }
        }
    }
}

/// Join a process group with the given backend
pub fn init_process_group(
    url: &str,
    rank: Rank,
    world_size: usize,
    backend: BackendKind,
    network: &NetworkConfig,
    runtime: RuntimeHandle,
) -> Result<ProcessGroupHandle> {
    GroupInitializer::new(backend, network.clone(), runtime).init(url, rank, world_size)
}
