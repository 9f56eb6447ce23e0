//! Checkpoint management for distillation runs.
//!
//! A run directory holds three checkpoint files:
//! - `checkpoint.json`: the latest completed joint epoch
//! - `model_best.json`: the epoch with the best validation top-1 so far
//! - `initial.json`: the untrained epoch-0 snapshot
//!
//! Each is written atomically and is never modified in place afterwards.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CheckpointConfig;
use crate::error::TrainError;
use crate::model::{Model, Role, RoleSet};
use crate::persistence;

pub const LATEST_FILE: &str = "checkpoint.json";
pub const BEST_FILE: &str = "model_best.json";
pub const INITIAL_FILE: &str = "initial.json";

/// Opaque serialized state of one module, stored as base64 in checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleState(Vec<u8>);

impl ModuleState {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for ModuleState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for ModuleState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(ModuleState)
            .map_err(serde::de::Error::custom)
    }
}

/// A training checkpoint: module states plus the validation scores of the
/// epoch that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub module_states: BTreeMap<Role, ModuleState>,
    #[serde(rename = "prec@1")]
    pub top1: f64,
    #[serde(rename = "prec@5")]
    pub top5: f64,
}

impl Checkpoint {
    /// Export the state of every role in `roles` from `model`.
    pub fn capture<M: Model>(
        model: &M,
        roles: &RoleSet,
        epoch: usize,
        top1: f64,
        top5: f64,
    ) -> Result<Self, TrainError> {
        let module_states = roles
            .iter()
            .map(|role| model.export_state(*role).map(|state| (*role, state)))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            epoch,
            module_states,
            top1,
            top5,
        })
    }

    pub fn roles(&self) -> RoleSet {
        self.module_states.keys().copied().collect()
    }

    /// Import every stored module state back into `model`.
    pub fn restore_into<M: Model>(&self, model: &mut M) -> Result<(), TrainError> {
        for (role, state) in &self.module_states {
            model.import_state(*role, state)?;
        }
        Ok(())
    }

    /// Parse a checkpoint file without checking its role set.
    pub fn read(path: &Path) -> Result<Self, TrainError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrainError::CheckpointNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents)
            .map_err(|e| TrainError::checkpoint_format(path, e.to_string()))
    }
}

/// Where and how a checkpoint was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedCheckpoint {
    pub path: PathBuf,
    pub epoch: usize,
    pub sha256: String,
    pub size_bytes: u64,
    pub written_at: DateTime<Utc>,
}

/// Reads and writes the checkpoint files of one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    run_dir: PathBuf,
    write_attempts: usize,
    retry_backoff: Duration,
}

impl CheckpointStore {
    pub fn new(run_dir: impl Into<PathBuf>, config: &CheckpointConfig) -> Self {
        Self {
            run_dir: run_dir.into(),
            write_attempts: config.write_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.run_dir.join(LATEST_FILE)
    }

    pub fn best_path(&self) -> PathBuf {
        self.run_dir.join(BEST_FILE)
    }

    pub fn initial_path(&self) -> PathBuf {
        self.run_dir.join(INITIAL_FILE)
    }

    /// Write `checkpoint` as the latest checkpoint.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<SavedCheckpoint, TrainError> {
        self.write(&self.latest_path(), checkpoint)
    }

    /// Write `checkpoint` as the best checkpoint so far.
    pub fn save_best(&self, checkpoint: &Checkpoint) -> Result<SavedCheckpoint, TrainError> {
        self.write(&self.best_path(), checkpoint)
    }

    /// Write the epoch-0 snapshot.
    pub fn save_initial(&self, checkpoint: &Checkpoint) -> Result<SavedCheckpoint, TrainError> {
        self.write(&self.initial_path(), checkpoint)
    }

    /// Load a checkpoint and check it carries exactly `expected_roles`.
    pub fn load(&self, source: &Path, expected_roles: &RoleSet) -> Result<Checkpoint, TrainError> {
        let checkpoint = Checkpoint::read(source)?;
        let found = checkpoint.roles();
        if &found != expected_roles {
            return Err(TrainError::checkpoint_format(
                source,
                format!(
                    "roles {} do not match expected {}",
                    join_roles(&found),
                    join_roles(expected_roles)
                ),
            ));
        }
        debug!(path = %source.display(), epoch = checkpoint.epoch, "Loaded checkpoint");
        Ok(checkpoint)
    }

    pub fn load_latest(&self, expected_roles: &RoleSet) -> Result<Checkpoint, TrainError> {
        self.load(&self.latest_path(), expected_roles)
    }

    /// The best checkpoint, or `None` if no epoch has improved yet.
    pub fn load_best(&self, expected_roles: &RoleSet) -> Result<Option<Checkpoint>, TrainError> {
        let path = self.best_path();
        if !path.exists() {
            return Ok(None);
        }
        self.load(&path, expected_roles).map(Some)
    }

    fn write(&self, path: &Path, checkpoint: &Checkpoint) -> Result<SavedCheckpoint, TrainError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        let mut attempt = 1;
        loop {
            match persistence::atomic_write(path, &bytes) {
                Ok(()) => break,
                Err(e) if attempt < self.write_attempts => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        max_attempts = self.write_attempts,
                        error = %e,
                        "Checkpoint write failed, retrying"
                    );
                    std::thread::sleep(self.retry_backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let saved = SavedCheckpoint {
            path: path.to_path_buf(),
            epoch: checkpoint.epoch,
            sha256: format!("{:x}", Sha256::digest(&bytes)),
            size_bytes: bytes.len() as u64,
            written_at: Utc::now(),
        };
        debug!(
            path = %saved.path.display(),
            epoch = saved.epoch,
            size_bytes = saved.size_bytes,
            "Checkpoint written"
        );
        Ok(saved)
    }
}

fn join_roles(roles: &RoleSet) -> String {
    let names: Vec<&str> = roles.iter().map(Role::as_str).collect();
    format!("[{}]", names.join(", "))
}

/// Best validation scores seen so far in the joint stage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BestMarker {
    pub top1: f64,
    pub top5: f64,
    /// Epoch that set the marker; `None` before any improvement.
    pub epoch: Option<usize>,
}

impl BestMarker {
    /// Record an epoch's scores. Returns `true` only on strict top-1
    /// improvement, in which case the marker now points at `epoch`.
    pub fn observe(&mut self, epoch: usize, top1: f64, top5: f64) -> bool {
        if top1 > self.top1 {
            *self = Self {
                top1,
                top5,
                epoch: Some(epoch),
            };
            true
        } else {
            false
        }
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            top1: checkpoint.top1,
            top5: checkpoint.top5,
            epoch: Some(checkpoint.epoch),
        }
    }
}
