//! Process group trait and reduction operators

use runtime_core::{BackendKind, Rank, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Element-wise reduction applied by [`ProcessGroup::all_reduce`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Mean,
    Min,
    Max,
}

impl ReduceOp {
    /// Fold `other` into `acc`
    pub fn accumulate<T: Element>(&self, acc: &mut [T], other: &[T]) {
        for (a, &b) in acc.iter_mut().zip(other) {
            *a = match self {
                ReduceOp::Sum | ReduceOp::Mean => a.add(b),
                ReduceOp::Min => a.lesser(b),
                ReduceOp::Max => a.greater(b),
            };
        }
    }

    /// Post-process the folded buffer
    pub fn finish<T: Element>(&self, acc: &mut [T], world_size: usize) {
        if let ReduceOp::Mean = self {
            acc.iter_mut().for_each(|a| *a = a.divide(world_size));
        }
    }
}

/// Flat buffer carried by one collective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Values {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Values {
    pub fn len(&self) -> usize {
        match self {
            Values::F32(data) => data.len(),
            Values::F64(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the element type, used in mismatch reports
    pub fn element(&self) -> &'static str {
        match self {
            Values::F32(_) => "f32",
            Values::F64(_) => "f64",
        }
    }
}

/// Scalar types a collective can reduce
pub trait Element: Copy + Send + Sync + 'static {
    fn add(self, other: Self) -> Self;

    fn lesser(self, other: Self) -> Self;

    fn greater(self, other: Self) -> Self;

    fn divide(self, world_size: usize) -> Self;

    fn pack(data: Vec<Self>) -> Values;

    /// `None` when `values` holds another element type
    fn unpack(values: Values) -> Option<Vec<Self>>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            fn add(self, other: Self) -> Self {
                self + other
            }

            fn lesser(self, other: Self) -> Self {
                <$ty>::min(self, other)
            }

            fn greater(self, other: Self) -> Self {
                <$ty>::max(self, other)
            }

            fn divide(self, world_size: usize) -> Self {
                self / world_size as $ty
            }

            fn pack(data: Vec<Self>) -> Values {
                Values::$variant(data)
            }

            fn unpack(values: Values) -> Option<Vec<Self>> {
                match values {
                    Values::$variant(data) => Some(data),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f32, F32);
impl_element!(f64, F64);

/// Collective requested by a worker, checked for agreement across the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectiveOp {
    AllReduce(ReduceOp),
    Broadcast,
}

/// Blocking collectives over a fixed group of workers.
///
/// Every call blocks until the matching call was issued by every member, so
/// all workers must issue the same sequence of collectives with buffers of the
/// same length.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this worker
    fn rank(&self) -> Rank;

    /// Number of workers in the group
    fn world_size(&self) -> usize;

    /// Backend serving this group
    fn backend(&self) -> BackendKind;

    /// Reduce `buf` element-wise across the group; every worker receives the result
    fn all_reduce(&self, buf: &mut [f32], op: ReduceOp) -> Result<()>;

    /// [`ProcessGroup::all_reduce`] at double precision, for counters and statistics
    fn all_reduce_f64(&self, buf: &mut [f64], op: ReduceOp) -> Result<()>;

    /// Overwrite `buf` on every worker with the contents held by rank 0
    fn broadcast(&self, buf: &mut [f32]) -> Result<()>;

    /// Wait until every worker reached this point
    fn barrier(&self) -> Result<()> {
        self.all_reduce(&mut [], ReduceOp::Sum)
    }

    /// Check if this is the rank-0 worker
    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// Thread-safe handle to a process group
pub type ProcessGroupHandle = Arc<dyn ProcessGroup>;

/// Reduce an ordered set of contributions (rank order) with `op`
pub(crate) fn combine<T: Element>(
    op: CollectiveOp,
    contributions: &[&[T]],
    world_size: usize,
) -> Vec<T> {
    let mut acc = contributions.first().map(|c| c.to_vec()).unwrap_or_default();
    if let CollectiveOp::AllReduce(reduce) = op {
        for other in contributions.iter().skip(1) {
            reduce.accumulate(&mut acc, other);
        }
        reduce.finish(&mut acc, world_size);
    }
    acc
}
