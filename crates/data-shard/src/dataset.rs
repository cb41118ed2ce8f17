//! Dataset traits and an in-memory tensor dataset

use ndarray::Axis;
use runtime_core::{Epoch, Error, Result, Sample, Tensor};

/// Map-style dataset addressable by index
pub trait Dataset: Send + Sync {
    /// Number of samples
    fn len(&self) -> usize;

    /// Sample at `index`, one tensor per field
    fn get(&self, index: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the dataset already yields only this rank's share
    fn shards_by_rank(&self) -> bool {
        false
    }
}

/// Stream-style dataset without random access
pub trait IterableDataset: Send + Sync {
    /// Samples of one epoch in stream order
    fn samples(&self, epoch: Epoch) -> Box<dyn Iterator<Item = Result<Sample>> + '_>;
}

/// Dataset over column tensors sharing their leading (sample) axis
#[derive(Debug, Clone)]
pub struct TensorDataset {
    columns: Vec<Tensor>,
    len: usize,
}

impl TensorDataset {
    /// Build from columns, e.g. `[features, labels]`
    pub fn new(columns: Vec<Tensor>) -> Result<Self> {
        let first = columns.first().ok_or_else(|| Error::Shape {
            message: "tensor dataset needs at least one column".to_string(),
        })?;
        if first.ndim() == 0 {
            return Err(Error::Shape {
                message: "tensor dataset columns need a leading sample axis".to_string(),
            });
        }

        let len = first.len_of(Axis(0));
        for (i, column) in columns.iter().enumerate() {
            if column.ndim() == 0 || column.len_of(Axis(0)) != len {
                return Err(Error::Shape {
                    message: format!(
                        "column {} has shape {:?}, expected {} samples",
                        i,
                        column.shape(),
                        len
                    ),
                });
            }
        }

        Ok(Self { columns, len })
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<Sample> {
        if index >= self.len {
            return Err(Error::Shape {
                message: format!("index {} out of range for {} samples", index, self.len),
            });
        }
        Ok(self
            .columns
            .iter()
            .map(|c| c.index_axis(Axis(0), index).to_owned())
            .collect())
    }
}

/// Iterable dataset replaying a fixed list of samples
#[derive(Debug, Clone, Default)]
pub struct SampleStream {
    samples: Vec<Sample>,
}

impl SampleStream {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl IterableDataset for SampleStream {
    fn samples(&self, _epoch: Epoch) -> Box<dyn Iterator<Item = Result<Sample>> + '_> {
        Box::new(self.samples.iter().cloned().map(Ok))
    }
}
