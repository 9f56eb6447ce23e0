//! Configuration for factorkd runs.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> explicit overrides. The resolved [`TrainConfig`] is built once
//! at startup and passed by reference to everything that needs it.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::data::{Dataset, DatasetProfile};
use crate::error::TrainError;
use crate::training::accuracy::TOP_K;

/// Top-level configuration for a distillation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Learning rate of the joint stage at epoch 1.
    pub initial_lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Number of joint-stage epochs.
    pub total_epochs: usize,
    pub batch_size: usize,
    /// Weight of the factor-transfer loss (lambda_kd).
    pub distillation_weight: f64,
    /// Paraphraser channel compression ratio (k).
    pub paraphraser_compression_ratio: f64,
    pub random_seed: u64,
    pub cuda_enabled: bool,
    pub dataset: Dataset,
    /// Training sequence: factor-transfer distillation or a single baseline network.
    pub pipeline: Pipeline,
    /// Root directory for run outputs.
    pub save_root: PathBuf,
    /// Run name; outputs go to `save_root/note`.
    pub note: String,
    /// Emit a progress record every this many batches.
    pub print_freq: usize,
    pub paraphraser: ParaphraserConfig,
    pub schedule: ScheduleConfig,
    pub data: DataConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            initial_lr: 0.1,
            momentum: 0.9,
            weight_decay: 1e-4,
            total_epochs: 200,
            batch_size: 128,
            distillation_weight: 200.0,
            paraphraser_compression_ratio: 0.5,
            random_seed: 2,
            cuda_enabled: true,
            dataset: Dataset::Cifar10,
            pipeline: Pipeline::default(),
            save_root: PathBuf::from("./results"),
            note: "try".to_string(),
            print_freq: 50,
            paraphraser: ParaphraserConfig::default(),
            schedule: ScheduleConfig::default(),
            data: DataConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

/// Paraphraser pretraining stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParaphraserConfig {
    pub epochs: usize,
    /// Fraction of `initial_lr` used as the fixed pretraining rate.
    pub lr_scale: f64,
}

impl Default for ParaphraserConfig {
    fn default() -> Self {
        Self {
            epochs: 30,
            lr_scale: 0.1,
        }
    }
}

/// Which training sequence a run follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pipeline {
    /// Paraphraser pretraining followed by joint student training.
    #[default]
    Distillation,
    /// One network trained on classification alone, e.g. a teacher or a
    /// reference student.
    Baseline,
}

impl Pipeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::Distillation => "distillation",
            Pipeline::Baseline => "baseline",
        }
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Pipeline {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "distillation" => Ok(Pipeline::Distillation),
            "baseline" => Ok(Pipeline::Baseline),
            other => Err(TrainError::config(format!(
                "unknown pipeline '{other}' (expected distillation or baseline)"
            ))),
        }
    }
}

/// Which learning-rate strategy governs the joint stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Smooth cosine annealing over `total_epochs`.
    Cosine,
    /// Piecewise-constant blocks decaying by `step_scale`.
    #[default]
    Step,
}

impl std::str::FromStr for ScheduleKind {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(ScheduleKind::Cosine),
            "step" => Ok(ScheduleKind::Step),
            other => Err(TrainError::config(format!(
                "unknown schedule '{other}' (expected cosine or step)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub kind: ScheduleKind,
    /// Floor of the cosine curve.
    pub min_lr: f64,
    /// Multiplier applied at every step-block boundary.
    pub step_scale: f64,
    /// Length in epochs of each step block, in order.
    pub block_lengths: Vec<usize>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            kind: ScheduleKind::Step,
            min_lr: 0.0,
            step_scale: 0.1,
            block_lengths: vec![100, 50, 50],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Share of the training set held out for validation.
    pub split_fraction: f64,
    pub eval_batch_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            split_fraction: 0.1,
            eval_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Attempts for a checkpoint write before the I/O error is surfaced.
    pub write_attempts: usize,
    pub retry_backoff_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

/// SGD settings handed to the model collaborator when building an optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl TrainConfig {
    pub fn profile(&self) -> DatasetProfile {
        self.dataset.profile()
    }

    pub fn num_classes(&self) -> usize {
        self.dataset.num_classes()
    }

    /// Directory holding this run's checkpoints, logs and snapshots.
    pub fn run_dir(&self) -> PathBuf {
        self.save_root.join(&self.note)
    }

    /// Optimizer for paraphraser pretraining: fixed, reduced rate.
    pub fn pretrain_optimizer(&self) -> OptimizerSettings {
        OptimizerSettings {
            learning_rate: self.initial_lr * self.paraphraser.lr_scale,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            nesterov: false,
        }
    }

    /// Optimizer for the joint stage; the rate is overwritten every epoch.
    pub fn joint_optimizer(&self) -> OptimizerSettings {
        OptimizerSettings {
            learning_rate: self.initial_lr,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            nesterov: true,
        }
    }

    /// SHA-256 over the canonical JSON form, recorded with every run.
    pub fn fingerprint(&self) -> Result<String, TrainError> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&json)))
    }

    /// Reject option combinations that cannot produce a valid run.
    pub fn validate(&self) -> Result<(), TrainError> {
        fn positive(name: &str, v: f64) -> Result<(), TrainError> {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(TrainError::config(format!(
                    "{name} must be positive, got {v}"
                )))
            }
        }

        positive("initial_lr", self.initial_lr)?;
        positive("paraphraser.lr_scale", self.paraphraser.lr_scale)?;
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(TrainError::config(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(TrainError::config("weight_decay must be non-negative"));
        }
        if !self.distillation_weight.is_finite() || self.distillation_weight < 0.0 {
            return Err(TrainError::config(
                "distillation_weight must be non-negative",
            ));
        }
        if !(self.paraphraser_compression_ratio > 0.0 && self.paraphraser_compression_ratio <= 1.0)
        {
            return Err(TrainError::config(format!(
                "paraphraser_compression_ratio must be in (0, 1], got {}",
                self.paraphraser_compression_ratio
            )));
        }
        if self.total_epochs == 0 {
            return Err(TrainError::config("total_epochs must be at least 1"));
        }
        if self.batch_size == 0 || self.data.eval_batch_size == 0 {
            return Err(TrainError::config("batch sizes must be at least 1"));
        }
        if self.print_freq == 0 {
            return Err(TrainError::config("print_freq must be at least 1"));
        }
        if self.checkpoint.write_attempts == 0 {
            return Err(TrainError::config(
                "checkpoint.write_attempts must be at least 1",
            ));
        }
        if !(0.0..1.0).contains(&self.data.split_fraction) {
            return Err(TrainError::config(format!(
                "data.split_fraction must be in [0, 1), got {}",
                self.data.split_fraction
            )));
        }
        if self.note.is_empty() {
            return Err(TrainError::config("note must not be empty"));
        }

        let num_classes = self.num_classes();
        if let Some(&k) = TOP_K.iter().find(|&&k| k > num_classes) {
            return Err(TrainError::InvalidK { k, num_classes });
        }

        match self.schedule.kind {
            ScheduleKind::Cosine => {
                if !self.schedule.min_lr.is_finite()
                    || self.schedule.min_lr < 0.0
                    || self.schedule.min_lr >= self.initial_lr
                {
                    return Err(TrainError::config(
                        "schedule.min_lr must be in [0, initial_lr)",
                    ));
                }
            }
            ScheduleKind::Step => {
                positive("schedule.step_scale", self.schedule.step_scale)?;
                let covered: usize = self.schedule.block_lengths.iter().sum();
                if self.schedule.block_lengths.contains(&0) {
                    return Err(TrainError::config(
                        "schedule.block_lengths must be non-zero",
                    ));
                }
                if covered < self.total_epochs {
                    return Err(TrainError::config(format!(
                        "step schedule covers {covered} epochs but total_epochs is {}",
                        self.total_epochs
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Command-line overrides; unset fields leave lower layers untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_lr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distillation_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<Dataset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Merged as `schedule.kind`, not as a top-level key.
    #[serde(skip)]
    pub schedule: Option<ScheduleKind>,
}

/// Workspace-relative location of the config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".factorkd").join("config.toml")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (prefixed with `FACTORKD_`, `__` for nesting)
/// 3. Explicit config file, or the workspace config (`.factorkd/config.toml`)
/// 4. User config (`~/.config/factorkd/config.toml`)
/// 5. Built-in defaults
///
/// The result is validated before it is returned.
pub fn load_config(
    workspace: Option<&Path>,
    file: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<TrainConfig, TrainError> {
    let mut figment = Figment::from(Serialized::defaults(TrainConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "factorkd", "factorkd") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    match (file, workspace) {
        (Some(path), _) => {
            if !path.exists() {
                return Err(TrainError::config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        (None, Some(ws)) => {
            let ws_config = workspace_config_path(ws);
            if ws_config.exists() {
                figment = figment.merge(Toml::file(&ws_config));
            }
        }
        (None, None) => {}
    }

    // FACTORKD_INITIAL_LR, FACTORKD_SCHEDULE__KIND, ...
    figment = figment.merge(Env::prefixed("FACTORKD_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
        if let Some(kind) = overrides.schedule {
            figment = figment.merge(Serialized::default("schedule.kind", kind));
        }
    }

    let config: TrainConfig = figment
        .extract()
        .map_err(|e| TrainError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrainConfig::default();
        assert_eq!(config.initial_lr, 0.1);
        assert_eq!(config.total_epochs, 200);
        assert_eq!(config.distillation_weight, 200.0);
        assert_eq!(config.paraphraser.epochs, 30);
        assert_eq!(config.schedule.kind, ScheduleKind::Step);
        assert_eq!(config.run_dir(), PathBuf::from("./results/try"));
        config.validate().unwrap();
    }

    #[test]
    fn test_stage_optimizers() {
        let config = TrainConfig::default();
        let pretrain = config.pretrain_optimizer();
        assert!((pretrain.learning_rate - 0.01).abs() < 1e-12);
        assert!(!pretrain.nesterov);
        let joint = config.joint_optimizer();
        assert_eq!(joint.learning_rate, 0.1);
        assert!(joint.nesterov);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = TrainConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: TrainConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_short_step_schedule() {
        let mut config = TrainConfig::default();
        config.total_epochs = 250;
        assert!(matches!(config.validate(), Err(TrainError::Config(_))));

        config.schedule.kind = ScheduleKind::Cosine;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TrainConfig::default();
        config.initial_lr = 0.0;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.momentum = 1.0;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.paraphraser_compression_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.data.split_fraction = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let a = TrainConfig::default();
        let mut b = TrainConfig::default();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        b.random_seed = 3;
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let path = workspace_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"
dataset = "CIFAR100"
total_epochs = 120
note = "wrn16-from-wrn40"

[schedule]
kind = "cosine"

[paraphraser]
epochs = 10
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None, None).unwrap();
        assert_eq!(config.dataset, Dataset::Cifar100);
        assert_eq!(config.total_epochs, 120);
        assert_eq!(config.schedule.kind, ScheduleKind::Cosine);
        assert_eq!(config.paraphraser.epochs, 10);
        assert_eq!(config.paraphraser.lr_scale, 0.1);
    }

    #[test]
    fn test_load_config_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "total_epochs = 150\nbatch_size = 64\n").unwrap();

        let overrides = ConfigOverrides {
            total_epochs: Some(20),
            note: Some("smoke".into()),
            schedule: Some(ScheduleKind::Cosine),
            ..Default::default()
        };
        let config = load_config(None, Some(&path), Some(&overrides)).unwrap();
        assert_eq!(config.total_epochs, 20);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.note, "smoke");
        assert_eq!(config.schedule.kind, ScheduleKind::Cosine);
    }

    #[test]
    fn test_pipeline_from_file_and_str() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "pipeline = \"baseline\"\n").unwrap();
        let config = load_config(None, Some(&path), None).unwrap();
        assert_eq!(config.pipeline, Pipeline::Baseline);

        let parsed: Pipeline = "Distillation".parse().unwrap();
        assert_eq!(parsed, Pipeline::Distillation);
        assert!("teacher".parse::<Pipeline>().is_err());
        assert_eq!(TrainConfig::default().pipeline, Pipeline::Distillation);
    }

    #[test]
    fn test_load_config_unknown_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "dataset = \"MNIST\"\n").unwrap();
        assert!(matches!(
            load_config(None, Some(&path), None),
            Err(TrainError::Config(_))
        ));
    }

    #[test]
    fn test_load_config_missing_file() {
        let missing = Path::new("/nonexistent/run.toml");
        assert!(load_config(None, Some(missing), None).is_err());
    }
}
