//! Property-based tests for core components using proptest.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tempfile::TempDir;

use factorkd_core::config::CheckpointConfig;
use factorkd_core::data::{SplitIndices, SubsetSampler};
use factorkd_core::training::accuracy::{ScoreMatrix, top_k_accuracy};
use factorkd_core::training::checkpoint::{Checkpoint, CheckpointStore, ModuleState};
use factorkd_core::training::metrics::Meter;
use factorkd_core::training::schedule::{
    CosineAnnealing, LearningRateSchedule, PiecewiseSchedule,
};
use factorkd_core::{Role, RoleSet};

// --- Meter properties ---

proptest! {
    #[test]
    fn meter_average_is_weighted_mean(
        samples in prop::collection::vec((-1e3f64..1e3, 1u32..256), 1..64)
    ) {
        let mut meter = Meter::new("loss");
        for (value, weight) in &samples {
            meter.update(*value, f64::from(*weight));
        }
        let num: f64 = samples.iter().map(|(v, w)| v * f64::from(*w)).sum();
        let den: f64 = samples.iter().map(|(_, w)| f64::from(*w)).sum();
        let avg = meter.average().unwrap();
        prop_assert!((avg - num / den).abs() <= 1e-9 * (1.0 + avg.abs()));
        prop_assert_eq!(meter.current(), samples.last().unwrap().0);
    }

    #[test]
    fn meter_reset_clears_everything(values in prop::collection::vec(-10f64..10.0, 0..16)) {
        let mut meter = Meter::new("prec@1");
        for v in values {
            meter.record(v);
        }
        meter.reset();
        prop_assert!(meter.average().is_err());
        prop_assert_eq!(meter.count(), 0.0);
    }
}

// --- Learning-rate properties ---

proptest! {
    #[test]
    fn cosine_is_non_increasing(lr0 in 1e-4f64..1.0, total in 1usize..400) {
        let schedule = CosineAnnealing::new(lr0, total, 0.0).unwrap();
        let rates: Vec<f64> = (1..=total).map(|e| schedule.rate_for_epoch(e).unwrap()).collect();
        for pair in rates.windows(2) {
            prop_assert!(pair[1] <= pair[0]);
        }
        prop_assert_eq!(rates[0], lr0);
        if total > 1 {
            prop_assert!(rates[total - 1] < rates[0]);
        }
        prop_assert!(schedule.rate_for_epoch(total + 1).is_err());
    }

    #[test]
    fn step_decay_is_constant_within_blocks(
        lr0 in 1e-3f64..1.0,
        scale in 0.05f64..0.95,
        lengths in prop::collection::vec(1usize..40, 1..5)
    ) {
        let schedule = PiecewiseSchedule::step_decay(lr0, scale, &lengths).unwrap();
        let last: usize = lengths.iter().sum();
        prop_assert_eq!(schedule.last_epoch(), last);
        for block in schedule.blocks() {
            for epoch in block.first..=block.last {
                prop_assert_eq!(schedule.rate_for_epoch(epoch).unwrap(), block.lr);
            }
        }
        for pair in schedule.blocks().windows(2) {
            prop_assert_eq!(pair[1].first, pair[0].last + 1);
            prop_assert!(pair[1].lr < pair[0].lr);
        }
        prop_assert!(schedule.rate_for_epoch(last + 1).is_err());
    }
}

// --- Split and sampler properties ---

proptest! {
    #[test]
    fn split_is_a_disjoint_partition(
        len in 0usize..2000,
        fraction in 0.0f64..0.9,
        seed in any::<u64>()
    ) {
        let split = SplitIndices::new(len, fraction, seed).unwrap();
        let mut all: Vec<usize> =
            split.train().iter().chain(split.validation()).copied().collect();
        all.sort_unstable();
        prop_assert_eq!(all, (0..len).collect::<Vec<_>>());
        prop_assert_eq!(split.validation().len(), (fraction * len as f64).floor() as usize);
        prop_assert_eq!(split, SplitIndices::new(len, fraction, seed).unwrap());
    }

    #[test]
    fn sampler_order_is_a_permutation(
        indices in prop::collection::btree_set(0usize..10_000, 0..200),
        seed in any::<u64>(),
        epoch in 1usize..500
    ) {
        let indices: Vec<usize> = indices.into_iter().collect();
        let sampler = SubsetSampler::shuffled(indices.clone(), seed);
        let mut order = sampler.order_for_epoch(epoch);
        prop_assert_eq!(&order, &sampler.order_for_epoch(epoch));
        order.sort_unstable();
        prop_assert_eq!(order, indices);
    }
}

// --- Top-k properties ---

proptest! {
    #[test]
    fn top_k_is_monotone_in_k(
        (classes, rows) in (2usize..12).prop_flat_map(|c| {
            (Just(c), prop::collection::vec(
                (prop::collection::vec(-5.0f32..5.0, c), 0..c),
                1..32,
            ))
        })
    ) {
        let scores = ScoreMatrix::from_rows(
            &rows.iter().map(|(s, _)| s.clone()).collect::<Vec<_>>(),
        ).unwrap();
        let labels: Vec<usize> = rows.iter().map(|(_, l)| *l).collect();
        let ks: Vec<usize> = (1..=classes).collect();
        let acc = top_k_accuracy(&scores, &labels, &ks).unwrap();
        for pair in acc.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
        prop_assert_eq!(acc[classes - 1], 100.0);
        prop_assert!(top_k_accuracy(&scores, &labels, &[classes + 1]).is_err());
    }
}

// --- Checkpoint properties ---

fn finite_score() -> impl Strategy<Value = f64> {
    prop_oneof![
        0.0f64..=100.0,
        prop::num::f64::NORMAL | prop::num::f64::SUBNORMAL | prop::num::f64::ZERO,
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn checkpoint_scores_survive_save_and_load(
        epoch in 0usize..500,
        top1 in finite_score(),
        top5 in finite_score()
    ) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), &CheckpointConfig::default());
        let checkpoint = Checkpoint {
            epoch,
            module_states: BTreeMap::from([
                (Role::Student, ModuleState::new(b"student:3".to_vec())),
            ]),
            top1,
            top5,
        };

        store.save(&checkpoint).unwrap();
        let loaded = store.load_latest(&RoleSet::from([Role::Student])).unwrap();
        prop_assert_eq!(loaded, checkpoint);
    }
}
