//! Reproducibility tracking: environment snapshots and seed management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::TrainConfig;
use crate::error::TrainError;

/// Snapshot of the environment a run started in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub factorkd_version: String,
    pub platform: String,
    pub arch: String,
    pub timestamp: DateTime<Utc>,
    pub random_seed: u64,
    pub cuda_enabled: bool,
    /// SHA-256 of the resolved configuration.
    pub config_hash: String,
    /// Hash of the device-selection environment (CUDA_VISIBLE_DEVICES, ...).
    pub env_vars_hash: String,
}

impl EnvironmentSnapshot {
    pub fn capture(config: &TrainConfig) -> Result<Self, TrainError> {
        Ok(Self {
            factorkd_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            timestamp: Utc::now(),
            random_seed: config.random_seed,
            cuda_enabled: config.cuda_enabled,
            config_hash: config.fingerprint()?,
            env_vars_hash: Self::compute_env_vars_hash(),
        })
    }

    fn compute_env_vars_hash() -> String {
        let mut hasher = Sha256::new();
        for var in &["CUDA_VISIBLE_DEVICES", "CUBLAS_WORKSPACE_CONFIG", "OMP_NUM_THREADS"] {
            let value = std::env::var(var).unwrap_or_default();
            hasher.update(var.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Derives independent, stable seeds for the random components of a run
/// from the single configured seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedManager {
    pub global_seed: u64,
    pub component_seeds: BTreeMap<String, u64>,
}

impl SeedManager {
    pub fn new(global_seed: u64) -> Self {
        Self {
            global_seed,
            component_seeds: BTreeMap::new(),
        }
    }

    /// Seed for `component`; the same name always yields the same seed.
    pub fn get_seed(&mut self, component: &str) -> u64 {
        let global = self.global_seed;
        *self
            .component_seeds
            .entry(component.to_string())
            .or_insert_with(|| derive_seed(global, component))
    }
}

fn derive_seed(global: u64, component: &str) -> u64 {
    let digest = Sha256::new()
        .chain_update(global.to_le_bytes())
        .chain_update(component.as_bytes())
        .finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
