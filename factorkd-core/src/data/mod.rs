//! Data-source collaborator surface: dataset profiles, seeded splits,
//! samplers and batch sequences.

pub mod dataset;
pub mod source;
pub mod split;

pub use dataset::{AugmentationPolicy, Dataset, DatasetProfile};
pub use source::{
    Batch, Collate, DataSource, EpochBatches, InMemorySource, LabeledBatch, SampledSource,
};
pub use split::{SplitIndices, SubsetSampler};
