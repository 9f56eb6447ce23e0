//! Learning-rate policies for the joint stage.
//!
//! Two interchangeable strategies, selected once at orchestration start:
//! - [`CosineAnnealing`] - smooth decay from the initial rate toward a floor
//! - [`PiecewiseSchedule`] - constant blocks that drop at block boundaries

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::config::{ScheduleKind, TrainConfig};
use crate::error::TrainError;

/// Maps a 1-indexed epoch to a learning rate.
pub trait LearningRateSchedule {
    fn rate_for_epoch(&self, epoch: usize) -> Result<f64, TrainError>;

    /// Last epoch the schedule defines a rate for.
    fn last_epoch(&self) -> usize;
}

/// Cosine annealing over `total_epochs`.
///
/// `lr(e) = min_lr + (initial_lr - min_lr) * (1 + cos(pi * (e - 1) / T)) / 2`,
/// so epoch 1 trains at `initial_lr` and the rate never increases within
/// `1..=T`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosineAnnealing {
    initial_lr: f64,
    min_lr: f64,
    total_epochs: usize,
}

impl CosineAnnealing {
    pub fn new(initial_lr: f64, total_epochs: usize, min_lr: f64) -> Result<Self, TrainError> {
        if total_epochs == 0 {
            return Err(TrainError::config(
                "cosine schedule needs at least one epoch",
            ));
        }
        if !(initial_lr.is_finite() && min_lr.is_finite() && 0.0 <= min_lr && min_lr < initial_lr)
        {
            return Err(TrainError::config(format!(
                "cosine schedule needs 0 <= min_lr < initial_lr, got {min_lr} and {initial_lr}"
            )));
        }
        Ok(Self {
            initial_lr,
            min_lr,
            total_epochs,
        })
    }
}

impl LearningRateSchedule for CosineAnnealing {
    fn rate_for_epoch(&self, epoch: usize) -> Result<f64, TrainError> {
        if epoch == 0 || epoch > self.total_epochs {
            return Err(TrainError::EpochOutOfRange {
                epoch,
                last: self.total_epochs,
            });
        }
        let progress = (epoch - 1) as f64 / self.total_epochs as f64;
        let decay = 0.5 * (1.0 + (PI * progress).cos());
        Ok(self.min_lr + (self.initial_lr - self.min_lr) * decay)
    }

    fn last_epoch(&self) -> usize {
        self.total_epochs
    }
}

/// An inclusive epoch range trained at one rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrBlock {
    pub first: usize,
    pub last: usize,
    pub lr: f64,
}

/// Consecutive, non-overlapping constant-rate blocks starting at epoch 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiecewiseSchedule {
    blocks: Vec<LrBlock>,
}

impl PiecewiseSchedule {
    pub fn new(blocks: Vec<LrBlock>) -> Result<Self, TrainError> {
        if blocks.is_empty() {
            return Err(TrainError::config(
                "piecewise schedule needs at least one block",
            ));
        }
        let mut expected_first = 1;
        for block in &blocks {
            if block.first != expected_first || block.last < block.first {
                return Err(TrainError::config(format!(
                    "schedule block [{}, {}] does not continue from epoch {expected_first}",
                    block.first, block.last
                )));
            }
            if !block.lr.is_finite() || block.lr <= 0.0 {
                return Err(TrainError::config(format!(
                    "schedule block [{}, {}] has invalid rate {}",
                    block.first, block.last, block.lr
                )));
            }
            expected_first = block.last + 1;
        }
        Ok(Self { blocks })
    }

    /// `initial_lr`, then `initial_lr * scale`, `initial_lr * scale^2`, ...
    /// over blocks of the given lengths.
    pub fn step_decay(
        initial_lr: f64,
        scale: f64,
        block_lengths: &[usize],
    ) -> Result<Self, TrainError> {
        let mut blocks = Vec::with_capacity(block_lengths.len());
        let mut first = 1;
        let mut lr = initial_lr;
        for &len in block_lengths {
            if len == 0 {
                return Err(TrainError::config(
                    "schedule blocks must be at least one epoch",
                ));
            }
            blocks.push(LrBlock {
                first,
                last: first + len - 1,
                lr,
            });
            first += len;
            lr *= scale;
        }
        Self::new(blocks)
    }

    pub fn blocks(&self) -> &[LrBlock] {
        &self.blocks
    }
}

impl LearningRateSchedule for PiecewiseSchedule {
    fn rate_for_epoch(&self, epoch: usize) -> Result<f64, TrainError> {
        self.blocks
            .iter()
            .find(|b| (b.first..=b.last).contains(&epoch))
            .map(|b| b.lr)
            .ok_or(TrainError::EpochOutOfRange {
                epoch,
                last: self.last_epoch(),
            })
    }

    fn last_epoch(&self) -> usize {
        self.blocks.last().map_or(0, |b| b.last)
    }
}

/// The strategy chosen for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrPolicy {
    Cosine(CosineAnnealing),
    Piecewise(PiecewiseSchedule),
}

impl LrPolicy {
    pub fn from_config(config: &TrainConfig) -> Result<Self, TrainError> {
        match config.schedule.kind {
            ScheduleKind::Cosine => Ok(LrPolicy::Cosine(CosineAnnealing::new(
                config.initial_lr,
                config.total_epochs,
                config.schedule.min_lr,
            )?)),
            ScheduleKind::Step => Ok(LrPolicy::Piecewise(PiecewiseSchedule::step_decay(
                config.initial_lr,
                config.schedule.step_scale,
                &config.schedule.block_lengths,
            )?)),
        }
    }

    /// Rates for `1..=epochs`, stopping at the first epoch out of range.
    pub fn table(&self, epochs: usize) -> Vec<(usize, f64)> {
        (1..=epochs)
            .map_while(|e| self.rate_for_epoch(e).ok().map(|lr| (e, lr)))
            .collect()
    }
}

impl LearningRateSchedule for LrPolicy {
    fn rate_for_epoch(&self, epoch: usize) -> Result<f64, TrainError> {
        match self {
            LrPolicy::Cosine(s) => s.rate_for_epoch(epoch),
            LrPolicy::Piecewise(s) => s.rate_for_epoch(epoch),
        }
    }

    fn last_epoch(&self) -> usize {
        match self {
            LrPolicy::Cosine(s) => s.last_epoch(),
            LrPolicy::Piecewise(s) => s.last_epoch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_blocks() -> PiecewiseSchedule {
        PiecewiseSchedule::new(vec![
            LrBlock {
                first: 1,
                last: 100,
                lr: 0.1,
            },
            LrBlock {
                first: 101,
                last: 150,
                lr: 0.01,
            },
            LrBlock {
                first: 151,
                last: 200,
                lr: 0.001,
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_piecewise_boundaries() {
        let schedule = three_blocks();
        assert_eq!(schedule.rate_for_epoch(1).unwrap(), 0.1);
        assert_eq!(schedule.rate_for_epoch(100).unwrap(), 0.1);
        assert_eq!(schedule.rate_for_epoch(101).unwrap(), 0.01);
        assert_eq!(schedule.rate_for_epoch(200).unwrap(), 0.001);
        assert!(matches!(
            schedule.rate_for_epoch(201),
            Err(TrainError::EpochOutOfRange {
                epoch: 201,
                last: 200
            })
        ));
        assert!(schedule.rate_for_epoch(0).is_err());
    }

    #[test]
    fn test_step_decay_matches_explicit_blocks() {
        let built = PiecewiseSchedule::step_decay(0.1, 0.1, &[100, 50, 50]).unwrap();
        assert_eq!(built.blocks().len(), 3);
        assert_eq!(built.blocks()[1].first, 101);
        assert_eq!(built.blocks()[2].last, 200);
        assert!((built.rate_for_epoch(175).unwrap() - 0.001).abs() < 1e-15);
    }

    #[test]
    fn test_piecewise_rejects_gaps_and_overlaps() {
        let gap = vec![
            LrBlock {
                first: 1,
                last: 10,
                lr: 0.1,
            },
            LrBlock {
                first: 12,
                last: 20,
                lr: 0.01,
            },
        ];
        assert!(PiecewiseSchedule::new(gap).is_err());

        let overlap = vec![
            LrBlock {
                first: 1,
                last: 10,
                lr: 0.1,
            },
            LrBlock {
                first: 10,
                last: 20,
                lr: 0.01,
            },
        ];
        assert!(PiecewiseSchedule::new(overlap).is_err());
        assert!(PiecewiseSchedule::new(vec![]).is_err());
    }

    #[test]
    fn test_cosine_endpoints() {
        let cosine = CosineAnnealing::new(0.1, 200, 0.0).unwrap();
        assert_eq!(cosine.rate_for_epoch(1).unwrap(), 0.1);
        let last = cosine.rate_for_epoch(200).unwrap();
        assert!(last > 0.0 && last < 1e-5);
        assert!(cosine.rate_for_epoch(201).is_err());
        assert!(cosine.rate_for_epoch(0).is_err());
    }

    #[test]
    fn test_cosine_single_epoch() {
        let cosine = CosineAnnealing::new(0.05, 1, 0.0).unwrap();
        assert_eq!(cosine.rate_for_epoch(1).unwrap(), 0.05);
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = TrainConfig::default();
        let step = LrPolicy::from_config(&config).unwrap();
        assert!(matches!(step, LrPolicy::Piecewise(_)));
        assert_eq!(step.last_epoch(), 200);

        config.schedule.kind = ScheduleKind::Cosine;
        config.total_epochs = 10;
        let cosine = LrPolicy::from_config(&config).unwrap();
        assert_eq!(cosine.table(20).len(), 10);
    }
}
