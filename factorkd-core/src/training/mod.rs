//! Training infrastructure: metrics, LR policies, checkpoints, stages and
//! the orchestrator that sequences them.

pub mod accuracy;
pub mod callbacks;
pub mod checkpoint;
pub mod metrics;
pub mod orchestrator;
pub mod reproducibility;
pub mod run;
pub mod schedule;
pub mod stage;

pub use accuracy::{ScoreMatrix, TOP_K, top_k_accuracy};
pub use callbacks::{LoggingObserver, ObserverSet, ProgressRecord, RecordingObserver, RunObserver};
pub use checkpoint::{BestMarker, Checkpoint, CheckpointStore, ModuleState, SavedCheckpoint};
pub use metrics::{Meter, MeterSnapshot, TrainingMetrics};
pub use orchestrator::{Orchestrator, Phase, RunSummary};
pub use reproducibility::{EnvironmentSnapshot, SeedManager};
pub use run::RunContext;
pub use schedule::{CosineAnnealing, LearningRateSchedule, LrBlock, LrPolicy, PiecewiseSchedule};
pub use stage::{EpochReport, StageController, StageKind, StageSpec};
