use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::monitor::{DriftConfig, PerformanceConfig};
use crate::transfer::TransferConfig;
use crate::validation::ValidationConfig;

pub const SERVICE_NAME: &str = "model-lifecycle";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub models_dir: PathBuf,
    pub source_dir: PathBuf,
    pub registry_file: PathBuf,
    pub transfer_log: PathBuf,
    /// Where performance buffers are written on shutdown; unset keeps them in memory only.
    pub performance_flush: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            models_dir: "data/models".into(),
            source_dir: "data/training_output".into(),
            registry_file: "data/models/registry.json".into(),
            transfer_log: "data/models/transfers.jsonl".into(),
            performance_flush: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub service_name: String,
    pub health_port: u16,
    pub storage: StorageConfig,
    pub validation: ValidationConfig,
    pub performance: PerformanceConfig,
    pub drift: DriftConfig,
    pub transfer: TransferConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.into(),
            health_port: 8086,
            storage: StorageConfig::default(),
            validation: ValidationConfig::default(),
            performance: PerformanceConfig::default(),
            drift: DriftConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// Defaults, then `SWARM_CONFIG_FILE`, then `SWARM__*` environment overrides.
    pub fn load() -> anyhow::Result<Self> { lifecycle_core::load_config(SERVICE_NAME) }
}
