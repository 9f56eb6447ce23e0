//! Running-average meters and per-run metric history.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::TrainError;

/// Running weighted average of one scalar quantity.
///
/// Not shared across epochs or threads: the stage that owns a meter is the
/// only thing that updates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    name: String,
    current: f64,
    sum: f64,
    count: f64,
}

impl Meter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: 0.0,
            sum: 0.0,
            count: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reset(&mut self) {
        self.current = 0.0;
        self.sum = 0.0;
        self.count = 0.0;
    }

    /// Record `value` observed over `weight` samples.
    pub fn update(&mut self, value: f64, weight: f64) {
        self.current = value;
        self.sum += value * weight;
        self.count += weight;
    }

    /// Record a single-sample value.
    pub fn record(&mut self, value: f64) {
        self.update(value, 1.0);
    }

    /// Most recent value passed to [`Meter::update`].
    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn average(&self) -> Result<f64, TrainError> {
        if self.count == 0.0 {
            return Err(TrainError::no_samples(&self.name));
        }
        Ok(self.sum / self.count)
    }

    /// Current value and average, for progress reporting.
    pub fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            current: self.current,
            average: self.average().ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterSnapshot {
    pub current: f64,
    pub average: Option<f64>,
}

/// Per-epoch history of a joint-stage run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    pub train_loss_history: Vec<f64>,
    pub val_top1_history: Vec<f64>,
    pub val_top5_history: Vec<f64>,
    pub custom_metrics: HashMap<String, Vec<f64>>,
    pub best_epoch: Option<usize>,
    pub best_top1: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_epoch(
        &mut self,
        epoch: usize,
        train_loss: f64,
        val_top1: f64,
        val_top5: f64,
        elapsed_secs: f64,
    ) {
        self.train_loss_history.push(train_loss);
        self.val_top1_history.push(val_top1);
        self.val_top5_history.push(val_top5);
        self.epochs_completed += 1;
        self.total_training_time_secs += elapsed_secs;

        if self.best_top1.is_none_or(|best| val_top1 > best) {
            self.best_top1 = Some(val_top1);
            self.best_epoch = Some(epoch);
        }
    }

    pub fn add_custom_metric(&mut self, name: &str, value: f64) {
        self.custom_metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}
