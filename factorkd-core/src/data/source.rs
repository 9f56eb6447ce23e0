//! The batch-sequence boundary between the training loop and the data
//! pipeline.

use crate::data::split::SubsetSampler;
use crate::error::TrainError;

/// A batch of inputs with one integer class label per sample.
pub trait LabeledBatch {
    fn labels(&self) -> &[usize];

    fn len(&self) -> usize {
        self.labels().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator over the batches of one epoch.
pub type EpochBatches<'a, B> = Box<dyn Iterator<Item = Result<B, TrainError>> + 'a>;

/// A finite, restartable sequence of batches.
///
/// `epoch` is called once per epoch; each call starts the sequence over.
pub trait DataSource {
    type Batch: LabeledBatch;

    /// Number of batches one epoch yields.
    fn num_batches(&self) -> usize;

    fn epoch(&mut self, epoch: usize) -> Result<EpochBatches<'_, Self::Batch>, TrainError>;
}

/// Inputs plus labels, the usual shape a collate step produces.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<X> {
    pub inputs: X,
    pub labels: Vec<usize>,
}

impl<X> LabeledBatch for Batch<X> {
    fn labels(&self) -> &[usize] {
        &self.labels
    }
}

/// Materializes the samples at a set of dataset indices into one batch.
pub trait Collate {
    type Batch: LabeledBatch;

    fn collate(&self, indices: &[usize]) -> Result<Self::Batch, TrainError>;
}

/// Batches the order produced by a [`SubsetSampler`] through a [`Collate`].
///
/// The final batch of an epoch may be short; nothing is dropped.
pub struct SampledSource<C> {
    collate: C,
    sampler: SubsetSampler,
    batch_size: usize,
}

impl<C: Collate> SampledSource<C> {
    pub fn new(collate: C, sampler: SubsetSampler, batch_size: usize) -> Result<Self, TrainError> {
        if batch_size == 0 {
            return Err(TrainError::config("batch_size must be at least 1"));
        }
        Ok(Self {
            collate,
            sampler,
            batch_size,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sampler(&self) -> &SubsetSampler {
        &self.sampler
    }
}

impl<C: Collate> DataSource for SampledSource<C> {
    type Batch = C::Batch;

    fn num_batches(&self) -> usize {
        self.sampler.len().div_ceil(self.batch_size)
    }

    fn epoch(&mut self, epoch: usize) -> Result<EpochBatches<'_, Self::Batch>, TrainError> {
        let order = self.sampler.order_for_epoch(epoch);
        let batch_size = self.batch_size;
        let collate = &self.collate;
        let batches = (0..self.num_batches()).map(move |i| {
            let start = i * batch_size;
            let end = (start + batch_size).min(order.len());
            collate.collate(&order[start..end])
        });
        Ok(Box::new(batches))
    }
}

/// A data source over batches that are already in memory.
#[derive(Debug, Clone)]
pub struct InMemorySource<B> {
    batches: Vec<B>,
}

impl<B> InMemorySource<B> {
    pub fn new(batches: Vec<B>) -> Self {
        Self { batches }
    }
}

impl<B: LabeledBatch + Clone> DataSource for InMemorySource<B> {
    type Batch = B;

    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn epoch(&mut self, _epoch: usize) -> Result<EpochBatches<'_, B>, TrainError> {
        Ok(Box::new(self.batches.iter().cloned().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Labels each index with `index % 10`.
    struct ModuloCollate;

    impl Collate for ModuloCollate {
        type Batch = Batch<Vec<usize>>;

        fn collate(&self, indices: &[usize]) -> Result<Self::Batch, TrainError> {
            Ok(Batch {
                inputs: indices.to_vec(),
                labels: indices.iter().map(|i| i % 10).collect(),
            })
        }
    }

    #[test]
    fn test_sampled_source_batches() {
        let sampler = SubsetSampler::sequential((0..10).collect());
        let mut source = SampledSource::new(ModuloCollate, sampler, 4).unwrap();
        assert_eq!(source.num_batches(), 3);

        let batches: Vec<_> = source
            .epoch(1)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let sizes: Vec<_> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(batches[2].inputs, vec![8, 9]);
    }

    #[test]
    fn test_sampled_source_is_restartable() {
        let sampler = SubsetSampler::shuffled((0..32).collect(), 11);
        let mut source = SampledSource::new(ModuloCollate, sampler, 8).unwrap();

        let first: Vec<_> = source
            .epoch(1)
            .unwrap()
            .map(|b| b.unwrap().inputs)
            .collect();
        let again: Vec<_> = source
            .epoch(1)
            .unwrap()
            .map(|b| b.unwrap().inputs)
            .collect();
        assert_eq!(first, again);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let sampler = SubsetSampler::sequential(vec![0]);
        assert!(SampledSource::new(ModuloCollate, sampler, 0).is_err());
    }

    #[test]
    fn test_in_memory_source() {
        let mut source = InMemorySource::new(vec![
            Batch {
                inputs: (),
                labels: vec![1, 2],
            },
            Batch {
                inputs: (),
                labels: vec![3],
            },
        ]);
        assert_eq!(source.num_batches(), 2);
        let total: usize = source.epoch(1).unwrap().map(|b| b.unwrap().len()).sum();
        assert_eq!(total, 3);
    }
}
