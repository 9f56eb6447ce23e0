//! Stage controller: one epoch of a stage over a fixed trainable set and
//! loss composition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use crate::data::{DataSource, LabeledBatch};
use crate::error::TrainError;
use crate::model::{
    LossComposition, LossKind, Mode, Model, ModuleSet, Optimizer as _, Role, RoleSet,
};
use crate::training::accuracy::{TOP_K, top_k_accuracy};
use crate::training::callbacks::{ProgressRecord, RunObserver};
use crate::training::metrics::{Meter, MeterSnapshot};

/// Which kind of pass a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    ParaphraserPretrain,
    Joint,
    /// Single-network classification training of a baseline run.
    Supervised,
    Evaluation,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::ParaphraserPretrain => "paraphraser_pretrain",
            StageKind::Joint => "joint",
            StageKind::Supervised => "supervised",
            StageKind::Evaluation => "evaluation",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed shape of a stage: what it trains, what it optimizes, and whether
/// it scores classification accuracy.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub kind: StageKind,
    pub trainable: RoleSet,
    pub composition: LossComposition,
    pub classifies: bool,
}

impl StageSpec {
    /// Paraphraser learns to reconstruct teacher features; nothing else trains.
    pub fn paraphraser_pretrain() -> Self {
        Self {
            kind: StageKind::ParaphraserPretrain,
            trainable: RoleSet::from([Role::Paraphraser]),
            composition: LossComposition::reconstruction(),
            classifies: false,
        }
    }

    /// Student and translator train on classification plus factor transfer.
    pub fn joint(distillation_weight: f64) -> Result<Self, TrainError> {
        Ok(Self {
            kind: StageKind::Joint,
            trainable: RoleSet::from([Role::Student, Role::Translator]),
            composition: LossComposition::joint(distillation_weight)?,
            classifies: true,
        })
    }

    /// The student alone trains on classification; no auxiliary modules.
    pub fn supervised() -> Self {
        Self {
            kind: StageKind::Supervised,
            trainable: RoleSet::from([Role::Student]),
            composition: LossComposition::classification(),
            classifies: true,
        }
    }

    /// Scoring of `composition` with every module in eval mode.
    pub fn evaluation(composition: LossComposition) -> Self {
        Self {
            kind: StageKind::Evaluation,
            trainable: RoleSet::new(),
            composition,
            classifies: true,
        }
    }
}

/// Aggregated result of one epoch (or one evaluation pass).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub stage: StageKind,
    pub epoch: usize,
    pub batches: usize,
    pub samples: usize,
    /// Weighted total loss, sample-averaged.
    pub loss: f64,
    /// Weighted per-term loss, sample-averaged.
    pub terms: BTreeMap<LossKind, f64>,
    pub top1: Option<f64>,
    pub top5: Option<f64>,
    pub learning_rate: Option<f64>,
    pub batch_time: f64,
    pub data_time: f64,
    pub duration_secs: f64,
}

struct PassMeters {
    terms: Vec<(LossKind, Meter)>,
    loss: Meter,
    top1: Meter,
    top5: Meter,
    batch_time: Meter,
    data_time: Meter,
}

impl PassMeters {
    fn new(composition: &LossComposition) -> Self {
        Self {
            terms: composition
                .kinds()
                .into_iter()
                .map(|k| (k, Meter::new(k.short())))
                .collect(),
            loss: Meter::new("loss"),
            top1: Meter::new("prec@1"),
            top5: Meter::new("prec@5"),
            batch_time: Meter::new("batch_time"),
            data_time: Meter::new("data_time"),
        }
    }

    fn progress(&self, classifies: bool) -> BTreeMap<String, MeterSnapshot> {
        let mut meters: Vec<&Meter> = self.terms.iter().map(|(_, m)| m).collect();
        meters.push(&self.loss);
        if classifies {
            meters.push(&self.top1);
            meters.push(&self.top5);
        }
        meters.push(&self.batch_time);
        meters.push(&self.data_time);
        meters
            .into_iter()
            .map(|m| (m.name().to_string(), m.snapshot()))
            .collect()
    }
}

/// Runs training epochs and evaluation passes for one [`StageSpec`].
pub struct StageController<'s> {
    spec: &'s StageSpec,
    modules: &'s ModuleSet,
    print_freq: usize,
}

impl<'s> StageController<'s> {
    pub fn new(spec: &'s StageSpec, modules: &'s ModuleSet, print_freq: usize) -> Self {
        Self {
            spec,
            modules,
            print_freq: print_freq.max(1),
        }
    }

    pub fn spec(&self) -> &StageSpec {
        self.spec
    }

    /// One training epoch: forward, weighted loss, backward and optimizer
    /// step for every batch of `source`.
    pub fn train_epoch<M, S>(
        &self,
        model: &mut M,
        optimizer: &mut M::Optimizer,
        source: &mut S,
        epoch: usize,
        observer: &mut dyn RunObserver,
    ) -> Result<EpochReport, TrainError>
    where
        M: Model,
        S: DataSource<Batch = M::Batch>,
    {
        self.modules.apply_modes(model, &self.spec.trainable);
        self.run_pass(model, Some(optimizer), source, epoch, observer)
    }

    /// One pass over `source` with every module in eval mode and no
    /// parameter updates.
    pub fn evaluate<M, S>(
        &self,
        model: &mut M,
        source: &mut S,
        epoch: usize,
        observer: &mut dyn RunObserver,
    ) -> Result<EpochReport, TrainError>
    where
        M: Model,
        S: DataSource<Batch = M::Batch>,
    {
        self.modules.apply_modes(model, &RoleSet::new());
        self.run_pass(model, None, source, epoch, observer)
    }

    fn run_pass<M, S>(
        &self,
        model: &mut M,
        mut optimizer: Option<&mut M::Optimizer>,
        source: &mut S,
        epoch: usize,
        observer: &mut dyn RunObserver,
    ) -> Result<EpochReport, TrainError>
    where
        M: Model,
        S: DataSource<Batch = M::Batch>,
    {
        let spec = self.spec;
        let kinds = spec.composition.kinds();
        let mode = if optimizer.is_some() {
            Mode::Train
        } else {
            Mode::Eval
        };
        let num_batches = source.num_batches();
        let learning_rate = optimizer.as_deref().map(|o| o.learning_rate());

        let mut meters = PassMeters::new(&spec.composition);
        let mut batches = 0;
        let mut samples = 0;
        let started = Instant::now();
        let mut tick = Instant::now();

        for (index, batch) in source.epoch(epoch)?.enumerate() {
            let batch = batch?;
            meters.data_time.record(tick.elapsed().as_secs_f64());
            let batch_no = index + 1;

            let pass = model.forward(&batch, &kinds, mode)?;
            let weighted = spec.composition.weigh(&pass.losses)?;
            let total: f64 = weighted.iter().map(|(_, v)| v).sum();

            let diverged: Option<(&str, f64)> = weighted
                .iter()
                .map(|(k, v)| (k.as_str(), *v))
                .chain(std::iter::once(("loss", total)))
                .find(|(_, v)| !v.is_finite())
                .or_else(|| {
                    pass.representations
                        .first_non_finite()
                        .map(|(name, v)| (name, f64::from(v)))
                });
            if let Some((term, value)) = diverged {
                return Err(TrainError::DivergedTraining {
                    stage: spec.kind.to_string(),
                    epoch,
                    batch: batch_no,
                    term: term.to_string(),
                    value,
                });
            }

            if let Some(opt) = optimizer.as_deref_mut() {
                model.backward(&spec.composition)?;
                model.step(opt)?;
            }

            let n = batch.len() as f64;
            for ((_, meter), (_, value)) in meters.terms.iter_mut().zip(&weighted) {
                meter.update(*value, n);
            }
            meters.loss.update(total, n);

            if spec.classifies {
                let scores = pass.scores.as_ref().ok_or_else(|| {
                    TrainError::model(format!(
                        "{} pass needs class scores but the forward pass reported none",
                        spec.kind
                    ))
                })?;
                let acc = top_k_accuracy(scores, batch.labels(), &TOP_K)?;
                meters.top1.update(acc[0], n);
                meters.top5.update(acc[1], n);
            }

            batches += 1;
            samples += batch.len();
            meters.batch_time.record(tick.elapsed().as_secs_f64());
            tick = Instant::now();

            if batch_no % self.print_freq == 0 {
                observer.on_progress(&ProgressRecord {
                    stage: spec.kind,
                    epoch,
                    batch: batch_no,
                    num_batches,
                    meters: meters.progress(spec.classifies),
                });
            }
        }

        let terms = meters
            .terms
            .iter()
            .map(|(k, m)| m.average().map(|avg| (*k, avg)))
            .collect::<Result<_, _>>()?;
        let (top1, top5) = if spec.classifies {
            (Some(meters.top1.average()?), Some(meters.top5.average()?))
        } else {
            (None, None)
        };

        Ok(EpochReport {
            stage: spec.kind,
            epoch,
            batches,
            samples,
            loss: meters.loss.average()?,
            terms,
            top1,
            top5,
            learning_rate,
            batch_time: meters.batch_time.average()?,
            data_time: meters.data_time.average()?,
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }
}
