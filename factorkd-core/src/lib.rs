//! # factorkd-core
//!
//! Staged training orchestration for factor-transfer knowledge distillation.
//! A paraphraser is pretrained on the frozen teacher's features, frozen, and
//! then a student and translator are trained jointly on classification plus
//! factor-transfer loss. This crate sequences those stages, tracks metrics,
//! schedules the learning rate and persists checkpoints; the networks
//! themselves sit behind the [`Model`] trait.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod persistence;
pub mod testing;
pub mod training;

// Re-export commonly used types at the crate root.
pub use config::{
    ConfigOverrides, OptimizerSettings, Pipeline, ScheduleKind, TrainConfig, load_config,
};
pub use data::{DataSource, Dataset, DatasetProfile, LabeledBatch, SplitIndices, SubsetSampler};
pub use error::{Result, TrainError};
pub use model::{
    LossComposition, LossKind, Mode, Model, ModuleSet, Optimizer, Representations, Role, RoleSet,
};
pub use testing::MockModel;
pub use training::{
    BestMarker, Checkpoint, CheckpointStore, LrPolicy, Meter, Orchestrator, Phase, RunContext,
    RunSummary,
};
