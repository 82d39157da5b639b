//! Package fixtures for unit tests.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::package::{MANIFEST_FILE, METADATA_FILE, MODEL_FILE, SCALER_FILE};
use crate::validation::sha256_file;

pub struct PackageFixture {
    pub version: String,
    pub family: String,
    pub features: Vec<String>,
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub roc_auc: f64,
    pub created_at: DateTime<Utc>,
    pub optional_files: bool,
    pub manifest: bool,
    pub scaler: bool,
    pub model_json: Option<String>,
}

impl Default for PackageFixture {
    fn default() -> Self {
        Self {
            version: "20261019_120000".into(),
            family: "wifi-anomaly".into(),
            features: vec!["rssi".into(), "noise".into(), "tx_rate".into()],
            f1: 0.9,
            precision: 0.9,
            recall: 0.9,
            roc_auc: 0.95,
            created_at: Utc::now(),
            optional_files: true,
            manifest: true,
            scaler: false,
            model_json: None,
        }
    }
}

impl PackageFixture {
    pub fn version(version: &str) -> Self { Self { version: version.into(), ..Default::default() } }
}

pub fn write_package(root: &Path, fx: &PackageFixture) -> PathBuf {
    let dir = root.join(&fx.version);
    std::fs::create_dir_all(&dir).unwrap();
    let n = fx.features.len();
    let model = fx.model_json.clone().unwrap_or_else(|| {
        json!({"format": "zscore", "means": vec![0.0; n], "stds": vec![1.0; n], "threshold": 2.0}).to_string()
    });
    std::fs::write(dir.join(MODEL_FILE), model).unwrap();
    let metadata = json!({
        "model_info": {"model_type": "zscore", "family": fx.family, "created_at": fx.created_at.to_rfc3339(), "description": "fixture"},
        "training_info": {"n_samples": 5000, "feature_names": fx.features},
        "evaluation_info": {"f1_score": fx.f1, "precision": fx.precision, "recall": fx.recall, "roc_auc": fx.roc_auc},
        "deployment_info": {"notes": "fixture"}
    });
    std::fs::write(dir.join(METADATA_FILE), serde_json::to_vec_pretty(&metadata).unwrap()).unwrap();
    let mut listed = vec![MODEL_FILE, METADATA_FILE];
    if fx.scaler {
        std::fs::write(dir.join(SCALER_FILE), json!({"mean": vec![0.0; n], "scale": vec![1.0; n]}).to_string()).unwrap();
        listed.push(SCALER_FILE);
    }
    if fx.optional_files {
        std::fs::write(dir.join("usage_example.txt"), "POST /predict {\"rssi\": -60}").unwrap();
        std::fs::write(dir.join("README.md"), "# fixture model").unwrap();
        std::fs::write(dir.join("requirements.txt"), "").unwrap();
    }
    if fx.manifest {
        let files: Vec<_> = listed.iter().map(|f| json!({"filename": f, "sha256": sha256_file(&dir.join(f)).unwrap()})).collect();
        std::fs::write(dir.join(MANIFEST_FILE), json!({"files": files}).to_string()).unwrap();
    }
    dir
}
