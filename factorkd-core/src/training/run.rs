//! Run directory setup: config and environment snapshots, seeded data
//! split and samplers, and the checkpoint store for a run.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::TrainConfig;
use crate::data::{SplitIndices, SubsetSampler};
use crate::error::TrainError;
use crate::persistence;
use crate::training::checkpoint::CheckpointStore;
use crate::training::reproducibility::{EnvironmentSnapshot, SeedManager};

pub const CONFIG_SNAPSHOT_FILE: &str = "config.json";
pub const ENVIRONMENT_FILE: &str = "environment.json";
pub const SPLIT_FILE: &str = "split.json";
pub const LOG_FILE: &str = "log.jsonl";

/// Everything a run needs before its first epoch.
#[derive(Debug)]
pub struct RunContext<'a> {
    config: &'a TrainConfig,
    run_dir: PathBuf,
    seeds: SeedManager,
    environment: EnvironmentSnapshot,
}

impl<'a> RunContext<'a> {
    /// Create `save_root/note` and record the config and environment in it.
    pub fn prepare(config: &'a TrainConfig) -> Result<Self, TrainError> {
        config.validate()?;
        let run_dir = config.run_dir();
        std::fs::create_dir_all(&run_dir)?;

        let environment = EnvironmentSnapshot::capture(config)?;
        persistence::atomic_write_json(&run_dir.join(CONFIG_SNAPSHOT_FILE), config)?;
        persistence::atomic_write_json(&run_dir.join(ENVIRONMENT_FILE), &environment)?;

        info!(
            run_dir = %run_dir.display(),
            dataset = %config.dataset,
            seed = config.random_seed,
            config_hash = %environment.config_hash,
            "Prepared run directory"
        );
        Ok(Self {
            config,
            run_dir,
            seeds: SeedManager::new(config.random_seed),
            environment,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        self.config
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn environment(&self) -> &EnvironmentSnapshot {
        &self.environment
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join(LOG_FILE)
    }

    /// Train/validation split of a `len`-sample training set.
    ///
    /// A run directory that already holds `split.json` keeps that split, so
    /// a resumed run validates on the same samples. Otherwise a seeded split
    /// is drawn and written there.
    pub fn split(&mut self, len: usize) -> Result<SplitIndices, TrainError> {
        let seed = self.seeds.get_seed("split");
        let path = self.run_dir.join(SPLIT_FILE);
        if let Some(saved) = persistence::load_json::<SplitIndices>(&path)? {
            if saved.len() != len {
                return Err(TrainError::config(format!(
                    "{} splits {} samples but the training set has {len}",
                    path.display(),
                    saved.len()
                )));
            }
            info!(path = %path.display(), seed = saved.seed(), "Reusing saved split");
            return Ok(saved);
        }

        let split = SplitIndices::new(len, self.config.data.split_fraction, seed)?;
        persistence::atomic_write_json(&path, &split)?;
        Ok(split)
    }

    /// Samplers over a split: the training subset reshuffles every epoch,
    /// the validation subset is also drawn in a seeded random order.
    pub fn samplers(&mut self, split: &SplitIndices) -> (SubsetSampler, SubsetSampler) {
        let train = SubsetSampler::shuffled(
            split.train().to_vec(),
            self.seeds.get_seed("train_sampler"),
        );
        let validation = SubsetSampler::shuffled(
            split.validation().to_vec(),
            self.seeds.get_seed("validation_sampler"),
        );
        (train, validation)
    }

    pub fn store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.run_dir, &self.config.checkpoint)
    }

    pub fn seeds(&self) -> &SeedManager {
        &self.seeds
    }
}
