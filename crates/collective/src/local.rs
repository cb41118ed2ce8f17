//! In-process process group for workers running as threads of one process

use crate::group::{combine, CollectiveOp, Element, ProcessGroup, ReduceOp, Values};
use parking_lot::{Condvar, Mutex};
use runtime_core::{BackendKind, Error, Rank, Result};
use std::sync::Arc;
use tracing::debug;

struct Contribution {
    op: CollectiveOp,
    data: Values,
}

struct ExchangeState {
    joined: Vec<bool>,
    generation: u64,
    slots: Vec<Option<Contribution>>,
    arrived: usize,
    outcome: std::result::Result<Values, String>,
}

/// Shared meeting point for the members of one in-process group
pub struct LocalRendezvous {
    world_size: usize,
    state: Mutex<ExchangeState>,
    ready: Condvar,
}

impl LocalRendezvous {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            state: Mutex::new(ExchangeState {
                joined: vec![false; world_size],
                generation: 0,
                slots: (0..world_size).map(|_| None).collect(),
                arrived: 0,
                outcome: Ok(Values::F32(Vec::new())),
            }),
            ready: Condvar::new(),
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Claim `rank` and wait until every rank has joined
    pub fn join(self: &Arc<Self>, rank: Rank) -> Result<LocalProcessGroup> {
        {
            let mut state = self.state.lock();
            if rank >= self.world_size {
                return Err(Error::GroupJoin {
                    url: "local".to_string(),
                    message: format!("rank {} outside world of size {}", rank, self.world_size),
                });
            }
            if state.joined[rank] {
                return Err(Error::GroupJoin {
                    url: "local".to_string(),
                    message: format!("rank {} joined twice", rank),
                });
            }
            state.joined[rank] = true;
        }

        let group = LocalProcessGroup {
            rendezvous: Arc::clone(self),
            rank,
        };
        group.barrier()?;
        debug!(rank, world_size = self.world_size, "Joined local process group");
        Ok(group)
    }

    fn exchange<T: Element>(&self, rank: Rank, op: CollectiveOp, buf: &mut [T]) -> Result<()> {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.slots[rank] = Some(Contribution {
            op,
            data: T::pack(buf.to_vec()),
        });
        state.arrived += 1;

        if state.arrived == self.world_size {
            let contributions: Vec<Contribution> =
                state.slots.iter_mut().filter_map(Option::take).collect();
            state.outcome = settle(&contributions, self.world_size);
            state.arrived = 0;
            state.generation += 1;
            self.ready.notify_all();
        } else {
            while state.generation == generation {
                self.ready.wait(&mut state);
            }
        }

        match &state.outcome {
            Ok(data) => match T::unpack(data.clone()) {
                Some(values) => {
                    buf.copy_from_slice(&values);
                    Ok(())
                }
                None => Err(Error::Internal {
                    message: format!("collective settled with {} values", data.element()),
                }),
            },
            Err(reason) => Err(Error::Collective {
                message: reason.clone(),
            }),
        }
    }
}

fn settle(contributions: &[Contribution], world_size: usize) -> std::result::Result<Values, String> {
    let root = &contributions[0];
    for (rank, other) in contributions.iter().enumerate().skip(1) {
        if other.op != root.op
            || other.data.len() != root.data.len()
            || other.data.element() != root.data.element()
        {
            return Err(format!(
                "rank {} issued {:?} over {} {} values, rank 0 issued {:?} over {} {}",
                rank,
                other.op,
                other.data.len(),
                other.data.element(),
                root.op,
                root.data.len(),
                root.data.element()
            ));
        }
    }
    match &root.data {
        Values::F32(_) => reduce_as::<f32>(root.op, contributions, world_size),
        Values::F64(_) => reduce_as::<f64>(root.op, contributions, world_size),
    }
}

fn reduce_as<T: Element>(
    op: CollectiveOp,
    contributions: &[Contribution],
    world_size: usize,
) -> std::result::Result<Values, String> {
    let buffers = contributions
        .iter()
        .map(|c| T::unpack(c.data.clone()))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| "workers mixed element types".to_string())?;
    let ordered: Vec<&[T]> = buffers.iter().map(Vec::as_slice).collect();
    Ok(T::pack(combine(op, &ordered, world_size)))
}

/// Member of a [`LocalRendezvous`]
pub struct LocalProcessGroup {
    rendezvous: Arc<LocalRendezvous>,
    rank: Rank,
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.rendezvous.world_size
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Local
    }

    fn all_reduce(&self, buf: &mut [f32], op: ReduceOp) -> Result<()> {
        self.rendezvous
            .exchange(self.rank, CollectiveOp::AllReduce(op), buf)
    }

    fn all_reduce_f64(&self, buf: &mut [f64], op: ReduceOp) -> Result<()> {
        self.rendezvous
            .exchange(self.rank, CollectiveOp::AllReduce(op), buf)
    }

    fn broadcast(&self, buf: &mut [f32]) -> Result<()> {
        self.rendezvous
            .exchange(self.rank, CollectiveOp::Broadcast, buf)
    }
}
