//! Batching data loader

use crate::dataset::{Dataset, IterableDataset};
use crate::sampler::Sampler;
use ndarray::{ArrayView, Axis, IxDyn};
use runtime_core::{Batch, Epoch, Error, Result, Sample, Tensor};
use std::fmt;
use std::sync::Arc;

/// Where a loader draws its samples from
#[derive(Clone)]
pub enum DataSource {
    Indexed(Arc<dyn Dataset>),
    Iterable(Arc<dyn IterableDataset>),
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Indexed(ds) => write!(f, "Indexed(len={})", ds.len()),
            DataSource::Iterable(_) => write!(f, "Iterable"),
        }
    }
}

/// Groups samples into collated batches, one pass per epoch
#[derive(Debug, Clone)]
pub struct DataLoader {
    source: DataSource,
    batch_size: usize,
    drop_last: bool,
    sampler: Sampler,
}

impl DataLoader {
    /// Sequential loader over a map-style dataset
    pub fn new(dataset: Arc<dyn Dataset>, batch_size: usize) -> Result<Self> {
        Self::with_source(DataSource::Indexed(dataset), batch_size)
    }

    /// Loader over a stream; never re-sampled
    pub fn from_iterable(dataset: Arc<dyn IterableDataset>, batch_size: usize) -> Result<Self> {
        Self::with_source(DataSource::Iterable(dataset), batch_size)
    }

    fn with_source(source: DataSource, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        Ok(Self {
            source,
            batch_size,
            drop_last: false,
            sampler: Sampler::Sequential,
        })
    }

    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Reshuffle every epoch with `seed`
    pub fn with_shuffle(self, seed: u64) -> Self {
        self.with_sampler(Sampler::Random { seed })
    }

    /// Drop the trailing partial batch
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn drop_last(&self) -> bool {
        self.drop_last
    }

    pub fn is_iterable(&self) -> bool {
        matches!(self.source, DataSource::Iterable(_))
    }

    /// Check if this loader already yields only one rank's share
    pub fn shards_by_rank(&self) -> bool {
        match &self.source {
            DataSource::Indexed(ds) => self.sampler.is_distributed() || ds.shards_by_rank(),
            DataSource::Iterable(_) => false,
        }
    }

    /// Batches per epoch, unknown for iterable sources
    pub fn num_batches(&self) -> Option<usize> {
        match &self.source {
            DataSource::Indexed(ds) => {
                let samples = self.sampler.num_samples(ds.len());
                Some(if self.drop_last {
                    samples / self.batch_size
                } else {
                    samples.div_ceil(self.batch_size)
                })
            }
            DataSource::Iterable(_) => None,
        }
    }

    /// Iterate the batches of `epoch`
    pub fn epoch(&self, epoch: Epoch) -> Batches<'_> {
        let samples = match &self.source {
            DataSource::Indexed(ds) => SampleIter::Indexed {
                dataset: ds.as_ref(),
                order: self.sampler.indices(ds.len(), epoch).into_iter(),
            },
            DataSource::Iterable(ds) => SampleIter::Iterable(ds.samples(epoch)),
        };

        Batches {
            samples,
            batch_size: self.batch_size,
            drop_last: self.drop_last,
            done: false,
        }
    }
}

enum SampleIter<'a> {
    Indexed {
        dataset: &'a dyn Dataset,
        order: std::vec::IntoIter<usize>,
    },
    Iterable(Box<dyn Iterator<Item = Result<Sample>> + 'a>),
}

impl Iterator for SampleIter<'_> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SampleIter::Indexed { dataset, order } => order.next().map(|i| dataset.get(i)),
            SampleIter::Iterable(inner) => inner.next(),
        }
    }
}

/// Batches of one epoch; stops after the first error
pub struct Batches<'a> {
    samples: SampleIter<'a>,
    batch_size: usize,
    drop_last: bool,
    done: bool,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut pending = Vec::with_capacity(self.batch_size);
        while pending.len() < self.batch_size {
            match self.samples.next() {
                Some(Ok(sample)) => pending.push(sample),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }

        if pending.is_empty() || (self.drop_last && pending.len() < self.batch_size) {
            return None;
        }
        Some(collate(&pending))
    }
}

/// Stack each field of the samples along a new leading axis
pub fn collate(samples: &[Sample]) -> Result<Batch> {
    let fields = samples.first().map(Vec::len).unwrap_or(0);
    if let Some(bad) = samples.iter().position(|s| s.len() != fields) {
        return Err(Error::Shape {
            message: format!(
                "sample {} has {} fields, expected {}",
                bad,
                samples[bad].len(),
                fields
            ),
        });
    }

    (0..fields)
        .map(|field| -> Result<Tensor> {
            let views: Vec<ArrayView<'_, f32, IxDyn>> =
                samples.iter().map(|s| s[field].view()).collect();
            Ok(ndarray::stack(Axis(0), &views)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{SampleStream, TensorDataset};
    use crate::sampler::DistributedSampler;
    use ndarray::array;

    fn dataset(n: usize) -> Arc<dyn Dataset> {
        let features = ndarray::Array::from_shape_fn((n, 2), |(i, j)| (i * 2 + j) as f32).into_dyn();
        let labels = ndarray::Array::from_shape_fn(n, |i| i as f32).into_dyn();
        Arc::new(TensorDataset::new(vec![features, labels]).unwrap())
    }

    #[test]
    fn test_sequential_batches() {
        let loader = DataLoader::new(dataset(5), 2).unwrap();
        let batches: Vec<Batch> = loader.epoch(0).collect::<Result<_>>().unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(loader.num_batches(), Some(3));
        assert_eq!(batches[0][0].shape(), &[2, 2]);
        assert_eq!(batches[0][1], array![0.0f32, 1.0].into_dyn());
        assert_eq!(batches[2][0].shape(), &[1, 2]);
    }

    #[test]
    fn test_drop_last() {
        let loader = DataLoader::new(dataset(5), 2).unwrap().with_drop_last(true);
        assert_eq!(loader.epoch(0).count(), 2);
        assert_eq!(loader.num_batches(), Some(2));
    }

    #[test]
    fn test_distributed_share() {
        let sampler = DistributedSampler::new(2, 1).unwrap();
        let loader = DataLoader::new(dataset(4), 2)
            .unwrap()
            .with_sampler(Sampler::Distributed(sampler));

        let batches: Vec<Batch> = loader.epoch(0).collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][1], array![1.0f32, 3.0].into_dyn());
        assert!(loader.shards_by_rank());
    }

    #[test]
    fn test_iterable_source() {
        let samples = (0..3)
            .map(|i| vec![array![i as f32].into_dyn(), ndarray::arr0(0.0f32).into_dyn()])
            .collect();
        let loader = DataLoader::from_iterable(Arc::new(SampleStream::new(samples)), 2).unwrap();

        assert!(loader.is_iterable());
        assert_eq!(loader.num_batches(), None);
        assert_eq!(loader.epoch(0).count(), 2);
    }

    #[test]
    fn test_collate_rejects_ragged_samples() {
        let samples = vec![
            vec![array![1.0f32].into_dyn()],
            vec![array![1.0f32].into_dyn(), array![2.0f32].into_dyn()],
        ];
        assert!(matches!(collate(&samples), Err(Error::Shape { .. })));

        let mismatched = vec![vec![array![1.0f32].into_dyn()], vec![array![1.0f32, 2.0].into_dyn()]];
        assert!(collate(&mismatched).is_err());
    }

    #[test]
    fn test_zero_batch_size() {
        assert!(DataLoader::new(dataset(2), 0).is_err());
    }
}
