//! Seeded train/validation partitioning and per-epoch subset sampling.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::TrainError;

/// A fixed partition of `0..len` into disjoint train and validation subsets.
///
/// The indices are shuffled once with `seed`; the first
/// `floor(validation_fraction * len)` shuffled indices form the validation
/// subset and the rest the training subset. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitIndices {
    seed: u64,
    train: Vec<usize>,
    validation: Vec<usize>,
}

impl SplitIndices {
    pub fn new(len: usize, validation_fraction: f64, seed: u64) -> Result<Self, TrainError> {
        if !(0.0..1.0).contains(&validation_fraction) {
            return Err(TrainError::config(format!(
                "validation fraction must be in [0, 1), got {validation_fraction}"
            )));
        }

        let mut indices: Vec<usize> = (0..len).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let split = (validation_fraction * len as f64).floor() as usize;
        let train = indices.split_off(split);

        tracing::debug!(
            len,
            train = train.len(),
            validation = indices.len(),
            seed,
            "Split dataset indices"
        );

        Ok(Self {
            seed,
            train,
            validation: indices,
        })
    }

    pub fn train(&self) -> &[usize] {
        &self.train
    }

    pub fn validation(&self) -> &[usize] {
        &self.validation
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Yields a subset of indices in a fresh seeded order every epoch.
#[derive(Debug, Clone)]
pub struct SubsetSampler {
    indices: Vec<usize>,
    seed: u64,
    shuffle: bool,
}

impl SubsetSampler {
    /// A sampler that reshuffles `indices` every epoch.
    pub fn shuffled(indices: Vec<usize>, seed: u64) -> Self {
        Self {
            indices,
            seed,
            shuffle: true,
        }
    }

    /// A sampler that always yields `indices` in their given order.
    pub fn sequential(indices: Vec<usize>) -> Self {
        Self {
            indices,
            seed: 0,
            shuffle: false,
        }
    }

    /// The sampling order for `epoch`, deterministic in `(seed, epoch)`.
    pub fn order_for_epoch(&self, epoch: usize) -> Vec<usize> {
        let mut order = self.indices.clone();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed ^ (epoch as u64).rotate_left(32));
            order.shuffle(&mut rng);
        }
        order
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_split_sizes() {
        let split = SplitIndices::new(50_000, 0.1, 66).unwrap();
        assert_eq!(split.validation().len(), 5_000);
        assert_eq!(split.train().len(), 45_000);
        assert_eq!(split.len(), 50_000);
    }

    #[test]
    fn test_split_is_disjoint_and_complete() {
        let split = SplitIndices::new(1_000, 0.2, 2).unwrap();
        let train: BTreeSet<_> = split.train().iter().copied().collect();
        let val: BTreeSet<_> = split.validation().iter().copied().collect();
        assert!(train.is_disjoint(&val));
        let all: BTreeSet<_> = train.union(&val).copied().collect();
        assert_eq!(all, (0..1_000).collect::<BTreeSet<_>>());
    }

    #[test]
    fn test_split_is_seed_deterministic() {
        let a = SplitIndices::new(500, 0.1, 7).unwrap();
        let b = SplitIndices::new(500, 0.1, 7).unwrap();
        let c = SplitIndices::new(500, 0.1, 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.validation(), c.validation());
    }

    #[test]
    fn test_split_rejects_bad_fraction() {
        assert!(matches!(
            SplitIndices::new(10, 1.0, 0),
            Err(TrainError::Config(_))
        ));
        assert!(SplitIndices::new(10, -0.1, 0).is_err());
    }

    #[test]
    fn test_sampler_orders() {
        let sampler = SubsetSampler::shuffled((0..100).collect(), 3);
        let first = sampler.order_for_epoch(1);
        assert_eq!(first, sampler.order_for_epoch(1));
        assert_ne!(first, sampler.order_for_epoch(2));

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());

        let sequential = SubsetSampler::sequential(vec![4, 2, 9]);
        assert_eq!(sequential.order_for_epoch(5), vec![4, 2, 9]);
    }
}
