#![allow(dead_code)]

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use model_lifecycle::monitor::{DriftConfig, PerformanceConfig};
use model_lifecycle::transfer::TransferConfig;
use model_lifecycle::validation::sha256_file;
use model_lifecycle::{DeploymentStatus, ModelManager, ModelPackage, PerformanceMonitor, Registry, TransferService, ValidationEngine};

pub const FAMILY: &str = "wifi-anomaly";
pub const FEATURES: [&str; 3] = ["rssi", "noise", "tx_rate"];

/// Writes a complete package directory `<root>/<version>`. `means_len` lets a test produce a
/// model whose input dimension disagrees with the declared features.
pub fn package(root: &Path, version: &str, f1: f64, means_len: usize) -> PathBuf {
    let dir = root.join(version);
    std::fs::create_dir_all(&dir).unwrap();
    let model = json!({"format": "zscore", "means": vec![0.0; means_len], "stds": vec![1.0; means_len], "threshold": 2.0});
    std::fs::write(dir.join("model.json"), model.to_string()).unwrap();
    let metadata = json!({
        "model_info": {"model_type": "zscore", "family": FAMILY, "created_at": chrono::Utc::now().to_rfc3339(), "description": "integration fixture"},
        "training_info": {"n_samples": 1200, "feature_names": FEATURES},
        "evaluation_info": {"f1_score": f1, "precision": 0.9, "recall": 0.9, "roc_auc": 0.93}
    });
    std::fs::write(dir.join("metadata.json"), metadata.to_string()).unwrap();
    for optional in ["usage_example.txt", "README.md", "requirements.txt"] {
        std::fs::write(dir.join(optional), "fixture").unwrap();
    }
    let files: Vec<_> = ["model.json", "metadata.json"].iter().map(|f| json!({"filename": f, "sha256": sha256_file(&dir.join(f)).unwrap()})).collect();
    std::fs::write(dir.join("manifest.json"), json!({ "files": files }).to_string()).unwrap();
    dir
}

pub fn good_package(root: &Path, version: &str) -> PathBuf { package(root, version, 0.9, FEATURES.len()) }

pub struct Harness {
    pub root: tempfile::TempDir,
    pub source: PathBuf,
    pub models: PathBuf,
    pub registry: Arc<Registry>,
    pub manager: Arc<ModelManager>,
    pub transfer: TransferService,
}

impl Harness {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("training_output");
        let models = root.path().join("models");
        std::fs::create_dir_all(&source).unwrap();
        let registry = Arc::new(Registry::open(root.path().join("registry.json")).unwrap());
        let validator = Arc::new(ValidationEngine::default());
        let monitor = Arc::new(PerformanceMonitor::new(PerformanceConfig::default(), DriftConfig::default()));
        let manager = Arc::new(ModelManager::new(registry.clone(), validator.clone(), monitor, &models));
        let retry = TransferConfig { retry_attempts: 1, retry_base_delay_ms: 1 };
        let transfer = TransferService::open(&source, &models, root.path().join("transfers.jsonl"), registry.clone(), validator, &retry).unwrap();
        Self { root, source, models, registry, manager, transfer }
    }

    /// Register a package straight into local storage with the given status.
    pub fn available(&self, dir: PathBuf) -> String {
        let pkg = ModelPackage::from_dir(&dir, DeploymentStatus::Imported).unwrap();
        let version = pkg.version.clone();
        self.registry.register(pkg).unwrap();
        self.registry.set_status(&version, DeploymentStatus::Available).unwrap();
        version
    }

    pub fn status(&self, version: &str) -> DeploymentStatus { self.registry.get(version).unwrap().status }

    pub fn deployed_count(&self) -> usize {
        self.registry.list().iter().filter(|p| p.family == FAMILY && p.status == DeploymentStatus::Deployed).count()
    }
}
