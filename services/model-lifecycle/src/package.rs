//! On-disk model package layout and the records the registry keeps about each version.
//!
//! A package is one directory named after its version:
//! - `model.json` serialized predictor (required)
//! - `metadata.json` model / training / evaluation info (required)
//! - `scaler.json` feature scaler (optional)
//! - `manifest.json` per-file sha256 digests (optional)
//! - `usage_example.txt`, `README.md`, `requirements.txt` companions (optional)

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{LifecycleError, Result};

pub const MODEL_FILE: &str = "model.json";
pub const SCALER_FILE: &str = "scaler.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus { Imported, Available, Deployed, Failed }

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Imported => "imported",
            DeploymentStatus::Available => "available",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Failed => "failed",
        }
    }

    /// `imported -> available <-> deployed`, `available|deployed -> failed`, revalidation `failed -> available`.
    /// Setting the current status again is a no-op and always allowed.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        self == next || matches!((self, next),
            (Imported, Available) | (Imported, Failed)
            | (Available, Deployed) | (Available, Failed)
            | (Deployed, Available) | (Deployed, Failed)
            | (Failed, Available))
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingInfo {
    #[serde(default)]
    pub n_samples: u64,
    pub feature_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationInfo {
    #[serde(default, alias = "f1")]
    pub f1_score: Option<f64>,
    #[serde(default)]
    pub precision: Option<f64>,
    #[serde(default)]
    pub recall: Option<f64>,
    #[serde(default)]
    pub roc_auc: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_info: ModelInfo,
    pub training_info: TrainingInfo,
    pub evaluation_info: EvaluationInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_info: Option<serde_json::Value>,
}

impl ModelMetadata {
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let bytes = std::fs::read(&path).map_err(|e| LifecycleError::io(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| LifecycleError::Parse { what: path.display().to_string(), source })
    }

    pub fn family(&self) -> &str {
        self.model_info.family.as_deref().filter(|f| !f.is_empty()).unwrap_or(&self.model_info.model_type)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> { parse_timestamp(&self.model_info.created_at) }
}

/// Accepts RFC 3339 and naive ISO-8601 (assumed UTC), the two forms training jobs emit.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) { return Some(ts.with_timezone(&Utc)); }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok().map(|n| n.and_utc())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub sha256: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    Listed { files: Vec<ManifestEntry> },
    Keyed(BTreeMap<String, String>),
}

/// Reads `manifest.json` if present. Both `{"files": [{filename, sha256}]}` and `{filename: sha256}` are accepted.
pub fn read_manifest(dir: &Path) -> Result<Option<Vec<ManifestEntry>>> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() { return Ok(None); }
    let bytes = std::fs::read(&path).map_err(|e| LifecycleError::io(&path, e))?;
    let doc: ManifestDocument = serde_json::from_slice(&bytes).map_err(|source| LifecycleError::Parse { what: path.display().to_string(), source })?;
    Ok(Some(match doc {
        ManifestDocument::Listed { files } => files,
        ManifestDocument::Keyed(map) => map.into_iter().map(|(filename, sha256)| ManifestEntry { filename, sha256 }).collect(),
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub score: f64,
    pub is_valid: bool,
    pub validated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPackage {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub family: String,
    pub path: PathBuf,
    #[serde(alias = "model_path")]
    pub artifact_path: PathBuf,
    #[serde(default)]
    pub scaler_path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: ModelMetadata,
    #[serde(alias = "deployment_status")]
    pub status: DeploymentStatus,
    #[serde(default)]
    pub manifest: Vec<ManifestEntry>,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub status_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub validation: Option<ValidationSummary>,
}

impl ModelPackage {
    /// Build a record from a package directory; the directory name is the version.
    pub fn from_dir(dir: &Path, status: DeploymentStatus) -> Result<Self> {
        let version = version_of(dir).ok_or_else(|| LifecycleError::Registry(format!("cannot derive version from {}", dir.display())))?;
        let metadata = ModelMetadata::read(dir)?;
        let manifest = read_manifest(dir)?.unwrap_or_default();
        let scaler = dir.join(SCALER_FILE);
        let now = Utc::now();
        Ok(Self {
            family: metadata.family().to_string(),
            version,
            path: dir.to_path_buf(),
            artifact_path: dir.join(MODEL_FILE),
            scaler_path: scaler.exists().then_some(scaler),
            metadata,
            status,
            manifest,
            registered_at: now,
            status_changed_at: now,
            validation: None,
        })
    }

    /// Record for a package whose metadata could not be read; only ever registered as `failed`.
    pub fn unreadable(version: &str, dir: &Path) -> Self {
        let now = Utc::now();
        Self {
            version: version.to_string(),
            family: "unknown".into(),
            path: dir.to_path_buf(),
            artifact_path: dir.join(MODEL_FILE),
            scaler_path: None,
            metadata: ModelMetadata::default(),
            status: DeploymentStatus::Failed,
            manifest: Vec::new(),
            registered_at: now,
            status_changed_at: now,
            validation: None,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> { self.metadata.created_at() }
}

pub fn version_of(dir: &Path) -> Option<String> {
    dir.file_name().and_then(|n| n.to_str()).filter(|n| !n.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_never_skip_available() {
        use DeploymentStatus::*;
        assert!(!Imported.can_transition_to(Deployed));
        assert!(Imported.can_transition_to(Available));
        assert!(Available.can_transition_to(Deployed));
        assert!(Deployed.can_transition_to(Available));
        assert!(Deployed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Deployed));
        assert!(Deployed.can_transition_to(Deployed));
    }

    #[test]
    fn family_falls_back_to_model_type() {
        let mut meta = ModelMetadata::default();
        meta.model_info.model_type = "isolation_forest".into();
        assert_eq!(meta.family(), "isolation_forest");
        meta.model_info.family = Some("wifi-anomaly".into());
        assert_eq!(meta.family(), "wifi-anomaly");
    }

    #[test]
    fn timestamps_with_and_without_offset() {
        assert!(parse_timestamp("2026-10-01T12:00:00Z").is_some());
        assert!(parse_timestamp("2026-10-01T12:00:00.123456").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn keyed_manifest_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), r#"{"model.json": "abc"}"#).unwrap();
        let entries = read_manifest(dir.path()).unwrap().unwrap();
        assert_eq!(entries, vec![ManifestEntry { filename: "model.json".into(), sha256: "abc".into() }]);
    }
}
