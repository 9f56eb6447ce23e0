//! Training orchestrator: sequences paraphraser pretraining, the auxiliary
//! freeze and joint student training, and owns the best-score bookkeeping.
//! Baseline runs train a single network through the same checkpoint path.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::config::{Pipeline, TrainConfig};
use crate::data::DataSource;
use crate::error::TrainError;
use crate::model::{Model, ModuleSet, Optimizer, Role, RoleSet};
use crate::training::callbacks::{ObserverSet, RunObserver};
use crate::training::checkpoint::{BestMarker, Checkpoint, CheckpointStore};
use crate::training::metrics::TrainingMetrics;
use crate::training::schedule::{LearningRateSchedule, LrPolicy};
use crate::training::stage::{EpochReport, StageController, StageSpec};

/// Where a run is in its stage sequence.
///
/// Baseline runs have no auxiliary phases and use [`Phase::Stage2Joint`]
/// for their single training stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Stage1Pretrain,
    FreezeAux,
    Stage2Joint,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Stage1Pretrain => "stage1_pretrain",
            Phase::FreezeAux => "freeze_aux",
            Phase::Stage2Joint => "stage2_joint",
            Phase::Done => "done",
        }
    }

    /// Forward-only transitions of a fresh distillation run.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Init, Phase::Stage1Pretrain)
                | (Phase::Stage1Pretrain, Phase::FreezeAux)
                | (Phase::FreezeAux, Phase::Stage2Joint)
                | (Phase::Stage2Joint, Phase::Done)
        )
    }

    /// Forward-only transitions under `pipeline`.
    pub fn can_advance_in(&self, pipeline: Pipeline, next: Phase) -> bool {
        match pipeline {
            Pipeline::Distillation => self.can_advance_to(next),
            Pipeline::Baseline => matches!(
                (self, next),
                (Phase::Init, Phase::Stage2Joint) | (Phase::Stage2Joint, Phase::Done)
            ),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the main training stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub last_epoch: usize,
    pub best: BestMarker,
    pub metrics: TrainingMetrics,
}

pub struct Orchestrator<'a, M: Model> {
    config: &'a TrainConfig,
    model: M,
    pipeline: Pipeline,
    modules: ModuleSet,
    store: CheckpointStore,
    policy: LrPolicy,
    pretrain: StageSpec,
    training: StageSpec,
    evaluation: StageSpec,
    phase: Phase,
    initialized: bool,
    next_epoch: usize,
    best: BestMarker,
    metrics: TrainingMetrics,
    observers: ObserverSet,
}

impl<'a, M: Model> Orchestrator<'a, M> {
    /// Set up a run over `model`.
    ///
    /// The configuration is validated and the learning-rate schedule must
    /// cover `total_epochs`, so a bad config fails here before anything is
    /// trained or written. The model must provide exactly the roles of the
    /// configured pipeline: all four for distillation, the student alone
    /// for a baseline run.
    pub fn new(
        config: &'a TrainConfig,
        model: M,
        store: CheckpointStore,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        let policy = LrPolicy::from_config(config)?;
        let last = policy.last_epoch();
        if last < config.total_epochs {
            return Err(TrainError::config(format!(
                "learning-rate schedule ends at epoch {last} but total_epochs is {}",
                config.total_epochs
            )));
        }

        let pipeline = config.pipeline;
        let modules = pipeline_modules(pipeline);
        let provided = model.roles();
        if provided != modules.roles() {
            let names = |roles: &RoleSet| {
                roles
                    .iter()
                    .map(Role::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            return Err(TrainError::config(format!(
                "model provides roles [{}], the {pipeline} pipeline needs [{}]",
                names(&provided),
                names(&modules.roles())
            )));
        }

        let training = match pipeline {
            Pipeline::Distillation => StageSpec::joint(config.distillation_weight)?,
            Pipeline::Baseline => StageSpec::supervised(),
        };
        let evaluation = StageSpec::evaluation(training.composition.clone());

        Ok(Self {
            config,
            model,
            pipeline,
            modules,
            store,
            policy,
            pretrain: StageSpec::paraphraser_pretrain(),
            training,
            evaluation,
            phase: Phase::Init,
            initialized: false,
            next_epoch: 1,
            best: BestMarker::default(),
            metrics: TrainingMetrics::default(),
            observers: ObserverSet::with_logging(),
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline
    }

    pub fn best(&self) -> &BestMarker {
        &self.best
    }

    pub fn modules(&self) -> &ModuleSet {
        &self.modules
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// First epoch the next call to [`Orchestrator::train_joint`] runs.
    pub fn next_epoch(&self) -> usize {
        self.next_epoch
    }

    fn advance(&mut self, next: Phase) -> Result<(), TrainError> {
        if !self.phase.can_advance_in(self.pipeline, next) {
            return Err(TrainError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.observers.on_phase(self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Write the untrained epoch-0 snapshot as both the latest and the
    /// initial checkpoint.
    pub fn initialize(&mut self) -> Result<(), TrainError> {
        if self.phase != Phase::Init {
            return Err(TrainError::InvalidTransition {
                from: self.phase,
                to: Phase::Init,
            });
        }
        let checkpoint = Checkpoint::capture(&self.model, &self.modules.roles(), 0, 0.0, 0.0)?;
        self.store.save(&checkpoint)?;
        let saved = self.store.save_initial(&checkpoint)?;
        info!(path = %saved.path.display(), "Saved initial checkpoint");
        self.initialized = true;
        Ok(())
    }

    /// Train the paraphraser alone on reconstruction loss for
    /// `paraphraser.epochs` epochs at a fixed reduced rate.
    pub fn pretrain_auxiliary<S>(&mut self, source: &mut S) -> Result<(), TrainError>
    where
        S: DataSource<Batch = M::Batch>,
    {
        self.advance(Phase::Stage1Pretrain)?;
        let roles = self.modules.stage_roles(&self.pretrain.trainable)?;
        let settings = self.config.pretrain_optimizer();
        let mut optimizer = self.model.build_optimizer(&roles, &settings)?;
        info!(
            epochs = self.config.paraphraser.epochs,
            lr = settings.learning_rate,
            "Pretraining paraphraser"
        );

        let print_freq = self.config.print_freq;
        let controller = StageController::new(&self.pretrain, &self.modules, print_freq);
        for epoch in 1..=self.config.paraphraser.epochs {
            let report = controller.train_epoch(
                &mut self.model,
                &mut optimizer,
                source,
                epoch,
                &mut self.observers,
            )?;
            self.observers.on_epoch_end(&report);
        }
        Ok(())
    }

    /// Mark the paraphraser frozen for the rest of the run.
    pub fn freeze_auxiliary(&mut self) -> Result<(), TrainError> {
        self.advance(Phase::FreezeAux)?;
        self.modules.set_trainable(Role::Paraphraser, false)?;
        info!(trainable = ?self.modules.trainable(), "Froze paraphraser");
        Ok(())
    }

    /// Main training from [`Orchestrator::next_epoch`] through
    /// `total_epochs`: set the rate, train, validate, checkpoint, and save
    /// the best checkpoint on strict top-1 improvement.
    ///
    /// Distillation runs train student and translator jointly; baseline runs
    /// train the student on classification alone.
    pub fn train_joint<S, V>(
        &mut self,
        train: &mut S,
        validation: &mut V,
    ) -> Result<RunSummary, TrainError>
    where
        S: DataSource<Batch = M::Batch>,
        V: DataSource<Batch = M::Batch>,
    {
        self.advance(Phase::Stage2Joint)?;
        let roles = self.modules.stage_roles(&self.training.trainable)?;
        let mut optimizer = self
            .model
            .build_optimizer(&roles, &self.config.joint_optimizer())?;
        let all_roles = self.modules.roles();

        let print_freq = self.config.print_freq;
        let trainer = StageController::new(&self.training, &self.modules, print_freq);
        let evaluator = StageController::new(&self.evaluation, &self.modules, print_freq);

        for epoch in self.next_epoch..=self.config.total_epochs {
            let lr = self.policy.rate_for_epoch(epoch)?;
            optimizer.set_learning_rate(lr);

            let train_report = trainer.train_epoch(
                &mut self.model,
                &mut optimizer,
                train,
                epoch,
                &mut self.observers,
            )?;
            self.observers.on_epoch_end(&train_report);

            let val_report =
                evaluator.evaluate(&mut self.model, validation, epoch, &mut self.observers)?;
            self.observers.on_epoch_end(&val_report);
            let (top1, top5) = scores(&val_report)?;

            let checkpoint = Checkpoint::capture(&self.model, &all_roles, epoch, top1, top5)?;
            self.store.save(&checkpoint)?;
            if self.best.observe(epoch, top1, top5) {
                self.store.save_best(&checkpoint)?;
                self.observers.on_best(&self.best);
            }

            self.metrics.record_epoch(
                epoch,
                train_report.loss,
                top1,
                top5,
                train_report.duration_secs + val_report.duration_secs,
            );
            self.metrics.add_custom_metric("lr", lr);
            self.next_epoch = epoch + 1;
        }

        self.advance(Phase::Done)?;
        info!(
            pipeline = %self.pipeline,
            best_epoch = self.best.epoch,
            best_top1 = self.best.top1,
            best_top5 = self.best.top5,
            "Training complete"
        );
        Ok(RunSummary {
            last_epoch: self.next_epoch - 1,
            best: self.best,
            metrics: self.metrics.clone(),
        })
    }

    /// Drive the run from its current phase to completion.
    ///
    /// A fresh distillation run initializes, pretrains, freezes and trains
    /// jointly; a fresh baseline run initializes and trains. A resumed run
    /// picks up at the phase [`Orchestrator::resume`] restored.
    pub fn run<S, V>(&mut self, train: &mut S, validation: &mut V) -> Result<RunSummary, TrainError>
    where
        S: DataSource<Batch = M::Batch>,
        V: DataSource<Batch = M::Batch>,
    {
        if self.phase == Phase::Init {
            if !self.initialized {
                self.initialize()?;
            }
            if self.pipeline == Pipeline::Distillation {
                self.pretrain_auxiliary(train)?;
                self.freeze_auxiliary()?;
            }
        }
        self.train_joint(train, validation)
    }

    /// Restore state from the run directory's latest checkpoint.
    ///
    /// An epoch-0 checkpoint leaves the run at [`Phase::Init`] with the
    /// snapshot already written. A later checkpoint restores all module
    /// states and continues at the next epoch; distillation runs also
    /// freeze the paraphraser and move to [`Phase::FreezeAux`]. The best
    /// marker comes from `model_best.json`, unless the latest checkpoint
    /// scored higher, in which case it is promoted and rewritten as the
    /// best. Optimizer momentum is not restored.
    pub fn resume(&mut self) -> Result<Phase, TrainError> {
        if self.phase != Phase::Init || self.initialized {
            return Err(TrainError::InvalidTransition {
                from: self.phase,
                to: Phase::Init,
            });
        }
        let roles: RoleSet = self.modules.roles();
        let latest = self.store.load_latest(&roles)?;
        latest.restore_into(&mut self.model)?;
        self.initialized = true;

        if latest.epoch == 0 {
            info!("Resuming from the initial checkpoint");
            return Ok(self.phase);
        }

        let mut best = match self.store.load_best(&roles)? {
            Some(best) => BestMarker::from_checkpoint(&best),
            None => {
                warn!("No best checkpoint found");
                BestMarker::default()
            }
        };
        if latest.top1 > best.top1 {
            warn!(
                epoch = latest.epoch,
                top1 = latest.top1,
                recorded_top1 = best.top1,
                "Latest checkpoint beats the recorded best; promoting it"
            );
            self.store.save_best(&latest)?;
            best = BestMarker::from_checkpoint(&latest);
        }
        self.best = best;

        if self.pipeline == Pipeline::Distillation {
            self.modules.set_trainable(Role::Paraphraser, false)?;
            self.observers.on_phase(self.phase, Phase::FreezeAux);
            self.phase = Phase::FreezeAux;
        }
        self.next_epoch = latest.epoch + 1;
        info!(
            epoch = latest.epoch,
            next_epoch = self.next_epoch,
            best_top1 = self.best.top1,
            "Resumed from checkpoint"
        );
        Ok(self.phase)
    }

    /// Evaluate the current model on `source`, e.g. the held-out test set.
    pub fn evaluate<S>(&mut self, source: &mut S) -> Result<EpochReport, TrainError>
    where
        S: DataSource<Batch = M::Batch>,
    {
        let epoch = self.next_epoch.saturating_sub(1);
        let print_freq = self.config.print_freq;
        let evaluator = StageController::new(&self.evaluation, &self.modules, print_freq);
        let report = evaluator.evaluate(&mut self.model, source, epoch, &mut self.observers)?;
        self.observers.on_epoch_end(&report);
        Ok(report)
    }
}

fn pipeline_modules(pipeline: Pipeline) -> ModuleSet {
    match pipeline {
        Pipeline::Distillation => ModuleSet::distillation(),
        Pipeline::Baseline => ModuleSet::new([Role::Student]),
    }
}

fn scores(report: &EpochReport) -> Result<(f64, f64), TrainError> {
    match (report.top1, report.top5) {
        (Some(top1), Some(top5)) => Ok((top1, top5)),
        _ => Err(TrainError::model(format!(
            "{} pass produced no accuracy",
            report.stage
        ))),
    }
}
