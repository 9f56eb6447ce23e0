//! Run observers: progress records, epoch reports and best-score updates.
//!
//! Observers are purely observational. Nothing they do can change the
//! course of a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::training::checkpoint::BestMarker;
use crate::training::metrics::MeterSnapshot;
use crate::training::orchestrator::Phase;
use crate::training::stage::{EpochReport, StageKind};

/// Intermediate meter values emitted every `print_freq` batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub stage: StageKind,
    pub epoch: usize,
    /// 1-indexed batch number within the epoch.
    pub batch: usize,
    pub num_batches: usize,
    pub meters: BTreeMap<String, MeterSnapshot>,
}

impl ProgressRecord {
    /// One-line rendering: `Epoch[3]:[050/391] Cls:1.2034(1.4410) ...`.
    pub fn render(&self) -> String {
        let width = self.num_batches.to_string().len().max(3);
        let mut line = format!(
            "Epoch[{}]:[{:0width$}/{:0width$}]",
            self.epoch, self.batch, self.num_batches
        );
        for (name, snap) in &self.meters {
            match snap.average {
                Some(avg) => line.push_str(&format!(" {name}:{:.4}({avg:.4})", snap.current)),
                None => line.push_str(&format!(" {name}:{:.4}", snap.current)),
            }
        }
        line
    }
}

/// Hooks invoked by the orchestrator as a run progresses.
pub trait RunObserver {
    fn on_phase(&mut self, _from: Phase, _to: Phase) {}

    fn on_progress(&mut self, _record: &ProgressRecord) {}

    fn on_epoch_end(&mut self, _report: &EpochReport) {}

    fn on_best(&mut self, _best: &BestMarker) {}
}

/// Fans every event out to each registered observer in order.
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Box<dyn RunObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set that logs through `tracing`.
    pub fn with_logging() -> Self {
        let mut set = Self::new();
        set.push(Box::new(LoggingObserver));
        set
    }

    pub fn push(&mut self, observer: Box<dyn RunObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl RunObserver for ObserverSet {
    fn on_phase(&mut self, from: Phase, to: Phase) {
        for o in &mut self.observers {
            o.on_phase(from, to);
        }
    }

    fn on_progress(&mut self, record: &ProgressRecord) {
        for o in &mut self.observers {
            o.on_progress(record);
        }
    }

    fn on_epoch_end(&mut self, report: &EpochReport) {
        for o in &mut self.observers {
            o.on_epoch_end(report);
        }
    }

    fn on_best(&mut self, best: &BestMarker) {
        for o in &mut self.observers {
            o.on_best(best);
        }
    }
}

/// Emits structured `tracing` events for every hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl RunObserver for LoggingObserver {
    fn on_phase(&mut self, from: Phase, to: Phase) {
        info!(%from, %to, "Phase transition");
    }

    fn on_progress(&mut self, record: &ProgressRecord) {
        info!(
            stage = %record.stage,
            epoch = record.epoch,
            batch = record.batch,
            num_batches = record.num_batches,
            "{}",
            record.render()
        );
    }

    fn on_epoch_end(&mut self, report: &EpochReport) {
        info!(
            stage = %report.stage,
            epoch = report.epoch,
            loss = report.loss,
            top1 = report.top1,
            top5 = report.top5,
            lr = report.learning_rate,
            duration_secs = report.duration_secs,
            "Epoch complete"
        );
    }

    fn on_best(&mut self, best: &BestMarker) {
        info!(
            epoch = best.epoch,
            top1 = best.top1,
            top5 = best.top5,
            "New best validation accuracy"
        );
    }
}

/// Everything a [`RecordingObserver`] has seen.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    pub phases: Vec<(Phase, Phase)>,
    pub progress: Vec<ProgressRecord>,
    pub epochs: Vec<EpochReport>,
    pub bests: Vec<BestMarker>,
}

/// Records events into shared storage; clone the observer before handing it
/// to a run to keep a handle for inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything recorded so far.
    pub fn snapshot(&self) -> Recording {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        // A panic in another holder leaves plain data behind; keep using it.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RunObserver for RecordingObserver {
    fn on_phase(&mut self, from: Phase, to: Phase) {
        self.lock().phases.push((from, to));
    }

    fn on_progress(&mut self, record: &ProgressRecord) {
        self.lock().progress.push(record.clone());
    }

    fn on_epoch_end(&mut self, report: &EpochReport) {
        self.lock().epochs.push(report.clone());
    }

    fn on_best(&mut self, best: &BestMarker) {
        self.lock().bests.push(*best);
    }
}
