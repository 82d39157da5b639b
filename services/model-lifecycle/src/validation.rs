//! Structural, integrity, loadability and quality validation of a candidate package.
//!
//! Score starts at 1.0, loses 0.2 per error and 0.05 per warning, clamped to [0, 1].
//! A package is valid when it has no errors and its score reaches `min_score`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Component, Path};
use tracing::{debug, info};

use lifecycle_core::LIFECYCLE_METRICS;
use crate::model::{load_artifacts, LoadError, LoadedArtifacts};
use crate::package::{read_manifest, ModelMetadata, ModelPackage, ValidationSummary, METADATA_FILE, MODEL_FILE, SCALER_FILE};

const ERROR_PENALTY: f64 = 0.2;
const WARNING_PENALTY: f64 = 0.05;

const F1_ERROR: f64 = 0.5;
const F1_WARNING: f64 = 0.7;
const ROC_AUC_ERROR: f64 = 0.6;
const ROC_AUC_WARNING: f64 = 0.8;
const PRECISION_WARNING: f64 = 0.5;
const RECALL_WARNING: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub min_score: f64,
    pub optional_files: Vec<String>,
    pub aging_after_days: i64,
    pub stale_after_days: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_score: 0.6,
            optional_files: vec!["usage_example.txt".into(), "README.md".into(), "requirements.txt".into()],
            aging_after_days: 7,
            stale_after_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub score: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub feature_count: usize,
    pub age_days: Option<i64>,
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    pub fn summary(&self) -> ValidationSummary {
        ValidationSummary { score: self.score, is_valid: self.is_valid, validated_at: self.validated_at }
    }

    /// Errors joined for a single-line error message.
    pub fn reason(&self) -> String {
        if self.errors.is_empty() { format!("score {:.2} below threshold", self.score) } else { self.errors.join("; ") }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCompatibility {
    pub compatible: bool,
    /// Declared by the package but absent from the target list.
    pub missing: Vec<String>,
    /// Present in the target list but unknown to the package.
    pub extra: Vec<String>,
    pub mismatch_score: f64,
}

pub fn check_feature_compatibility(declared: &[String], target: &[String]) -> FeatureCompatibility {
    let declared: BTreeSet<&str> = declared.iter().map(String::as_str).collect();
    let target: BTreeSet<&str> = target.iter().map(String::as_str).collect();
    let missing: Vec<String> = declared.difference(&target).map(|s| s.to_string()).collect();
    let extra: Vec<String> = target.difference(&declared).map(|s| s.to_string()).collect();
    let union = declared.union(&target).count();
    let mismatch_score = if union == 0 { 0.0 } else { (missing.len() + extra.len()) as f64 / union as f64 };
    FeatureCompatibility { compatible: missing.is_empty() && extra.is_empty(), missing, extra, mismatch_score }
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 { break; }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Default)]
struct Findings { errors: Vec<String>, warnings: Vec<String>, recommendations: Vec<String> }

impl Findings {
    fn error(&mut self, msg: impl Into<String>) { self.errors.push(msg.into()); }
    fn warn(&mut self, msg: impl Into<String>) { self.warnings.push(msg.into()); }
    fn advise(&mut self, warning: impl Into<String>, recommendation: impl Into<String>) {
        self.warnings.push(warning.into());
        self.recommendations.push(recommendation.into());
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationEngine { config: ValidationConfig }

impl ValidationEngine {
    pub fn new(config: ValidationConfig) -> Self { Self { config } }

    pub fn validate(&self, dir: &Path) -> ValidationResult { self.validate_at(dir, Utc::now()) }

    pub fn validate_at(&self, dir: &Path, now: DateTime<Utc>) -> ValidationResult {
        let mut f = Findings::default();
        let mut feature_count = 0;
        let mut age_days = None;

        if !dir.is_dir() {
            f.error(format!("package directory {} does not exist", dir.display()));
            return self.finish(dir, f, feature_count, age_days, now);
        }

        let model_path = dir.join(MODEL_FILE);
        let has_model = model_path.is_file();
        if !has_model { f.error(format!("missing required file {MODEL_FILE}")); }

        let metadata = if dir.join(METADATA_FILE).is_file() {
            match ModelMetadata::read(dir) {
                Ok(meta) => Some(meta),
                Err(e) => { f.error(format!("{METADATA_FILE} unreadable: {e}")); None }
            }
        } else {
            f.error(format!("missing required file {METADATA_FILE}"));
            None
        };

        for optional in &self.config.optional_files {
            if !dir.join(optional).exists() { f.warn(format!("optional file {optional} missing")); }
        }

        self.check_integrity(dir, &mut f);

        if let Some(meta) = &metadata {
            feature_count = meta.training_info.feature_names.len();
            if feature_count == 0 { f.error("training_info.feature_names is empty"); }
            if has_model && feature_count > 0 {
                let scaler = dir.join(SCALER_FILE);
                if let Err(e) = load_artifacts(&model_path, scaler.exists().then_some(scaler.as_path()), feature_count) {
                    f.error(format!("model not loadable: {e}"));
                }
            }
            self.check_quality(meta, &mut f);
            age_days = self.check_freshness(meta, now, &mut f);
        }

        self.finish(dir, f, feature_count, age_days, now)
    }

    /// Loadability check shared with the model manager.
    pub fn check_loadability(&self, pkg: &ModelPackage) -> Result<LoadedArtifacts, LoadError> {
        load_artifacts(&pkg.artifact_path, pkg.scaler_path.as_deref(), pkg.metadata.training_info.feature_names.len())
    }

    pub fn check_package_features(&self, pkg: &ModelPackage, target: &[String]) -> FeatureCompatibility {
        check_feature_compatibility(&pkg.metadata.training_info.feature_names, target)
    }

    fn check_integrity(&self, dir: &Path, f: &mut Findings) {
        let entries = match read_manifest(dir) {
            Ok(Some(entries)) => entries,
            Ok(None) => return,
            Err(e) => { f.error(format!("manifest unreadable: {e}")); return; }
        };
        for entry in entries {
            let rel = Path::new(&entry.filename);
            if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
                f.error(format!("manifest entry {} escapes the package directory", entry.filename));
                continue;
            }
            let path = dir.join(rel);
            match sha256_file(&path) {
                Ok(actual) if actual.eq_ignore_ascii_case(&entry.sha256) => {}
                Ok(actual) => f.error(format!("checksum mismatch for {}: expected {} got {actual}", entry.filename, entry.sha256)),
                Err(_) if !path.exists() => f.error(format!("manifest lists {} but it is missing", entry.filename)),
                Err(e) => f.error(format!("cannot hash {}: {e}", entry.filename)),
            }
        }
    }

    fn check_quality(&self, meta: &ModelMetadata, f: &mut Findings) {
        let eval = &meta.evaluation_info;
        match eval.f1_score {
            None => f.warn("F1 score not reported"),
            Some(v) if v < F1_ERROR => f.error(format!("F1 below 0.5 ({v:.3})")),
            Some(v) if v < F1_WARNING => f.advise(format!("F1 score {v:.3} below 0.7"), "collect more labelled anomalies or rebalance classes to lift F1"),
            Some(_) => {}
        }
        match eval.roc_auc {
            None => f.warn("ROC-AUC not reported"),
            Some(v) if v < ROC_AUC_ERROR => f.error(format!("ROC-AUC below 0.6 ({v:.3})")),
            Some(v) if v < ROC_AUC_WARNING => f.advise(format!("ROC-AUC {v:.3} below 0.8"), "revisit feature engineering; the model separates classes poorly"),
            Some(_) => {}
        }
        match eval.precision {
            None => f.warn("precision not reported"),
            Some(v) if v < PRECISION_WARNING => f.advise(format!("precision {v:.3} below 0.5"), "raise the anomaly threshold to cut false positives"),
            Some(_) => {}
        }
        match eval.recall {
            None => f.warn("recall not reported"),
            Some(v) if v < RECALL_WARNING => f.advise(format!("recall {v:.3} below 0.5"), "lower the anomaly threshold or add anomaly examples to catch more incidents"),
            Some(_) => {}
        }
    }

    fn check_freshness(&self, meta: &ModelMetadata, now: DateTime<Utc>, f: &mut Findings) -> Option<i64> {
        let Some(created) = meta.created_at() else {
            f.warn("model_info.created_at missing or unparseable");
            return None;
        };
        let days = (now - created).num_days();
        if days > self.config.stale_after_days {
            f.advise(format!("model is {days} days old: stale, consider retraining"), "retrain on recent traffic before deploying");
        } else if days >= self.config.aging_after_days {
            f.warn(format!("model is {days} days old"));
        }
        Some(days)
    }

    fn finish(&self, dir: &Path, f: Findings, feature_count: usize, age_days: Option<i64>, now: DateTime<Utc>) -> ValidationResult {
        let score = (1.0 - ERROR_PENALTY * f.errors.len() as f64 - WARNING_PENALTY * f.warnings.len() as f64).clamp(0.0, 1.0);
        let is_valid = f.errors.is_empty() && score >= self.config.min_score;
        LIFECYCLE_METRICS.validations_total.with_label_values(&[if is_valid { "valid" } else { "invalid" }]).inc();
        if is_valid {
            info!(package = %dir.display(), score, warnings = f.warnings.len(), "package validated");
        } else {
            debug!(package = %dir.display(), score, errors = ?f.errors, "package rejected");
        }
        ValidationResult { is_valid, score, errors: f.errors, warnings: f.warnings, recommendations: f.recommendations, feature_count, age_days, validated_at: now }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_package, PackageFixture};
    use chrono::Duration;

    fn engine() -> ValidationEngine { ValidationEngine::default() }

    #[test]
    fn complete_package_scores_exactly_one() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_package(root.path(), &PackageFixture::default());
        let res = engine().validate(&dir);
        assert!(res.errors.is_empty(), "{:?}", res.errors);
        assert!(res.warnings.is_empty(), "{:?}", res.warnings);
        assert_eq!(res.score, 1.0);
        assert!(res.is_valid);
        assert_eq!(res.feature_count, 3);
    }

    #[test]
    fn low_f1_is_an_error_regardless_of_other_metrics() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_package(root.path(), &PackageFixture { f1: 0.45, ..Default::default() });
        let res = engine().validate(&dir);
        assert!(!res.is_valid);
        assert!(res.errors.iter().any(|e| e.contains("F1 below 0.5")));
        assert!((res.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn weak_metrics_warn_and_recommend() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_package(root.path(), &PackageFixture { f1: 0.65, roc_auc: 0.75, precision: 0.4, recall: 0.3, ..Default::default() });
        let res = engine().validate(&dir);
        assert!(res.errors.is_empty());
        assert_eq!(res.warnings.len(), 4);
        assert_eq!(res.recommendations.len(), 4);
        assert!((res.score - 0.8).abs() < 1e-9);
        assert!(res.is_valid);
    }

    #[test]
    fn missing_optional_files_only_warn() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_package(root.path(), &PackageFixture { optional_files: false, ..Default::default() });
        let res = engine().validate(&dir);
        assert!(res.is_valid);
        assert_eq!(res.warnings.len(), 3);
        assert!((res.score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn missing_model_file_is_invalid() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_package(root.path(), &PackageFixture { manifest: false, ..Default::default() });
        std::fs::remove_file(dir.join(MODEL_FILE)).unwrap();
        let res = engine().validate(&dir);
        assert!(!res.is_valid);
        assert!(res.errors.iter().any(|e| e.contains("missing required file model.json")));
    }

    #[test]
    fn tampered_file_fails_integrity() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_package(root.path(), &PackageFixture::default());
        let mut meta: serde_json::Value = serde_json::from_slice(&std::fs::read(dir.join(METADATA_FILE)).unwrap()).unwrap();
        meta["model_info"]["description"] = "edited after packaging".into();
        std::fs::write(dir.join(METADATA_FILE), serde_json::to_vec(&meta).unwrap()).unwrap();
        let res = engine().validate(&dir);
        assert!(!res.is_valid);
        assert!(res.errors.iter().any(|e| e.starts_with("checksum mismatch for metadata.json")));
    }

    #[test]
    fn unsupported_format_is_not_loadable() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_package(root.path(), &PackageFixture { model_json: Some(r#"{"format": "pickle"}"#.into()), ..Default::default() });
        let res = engine().validate(&dir);
        assert!(res.errors.iter().any(|e| e.starts_with("model not loadable")));
    }

    #[test]
    fn freshness_bands() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_package(root.path(), &PackageFixture::default());
        let now = Utc::now();
        let aging = engine().validate_at(&dir, now + Duration::days(10));
        assert_eq!(aging.warnings.len(), 1);
        assert!(aging.recommendations.is_empty());
        let stale = engine().validate_at(&dir, now + Duration::days(45));
        assert!(stale.warnings[0].contains("stale, consider retraining"));
        assert_eq!(stale.age_days, Some(45));
    }

    #[test]
    fn score_is_clamped_at_zero() {
        let root = tempfile::tempdir().unwrap();
        let res = engine().validate(&root.path().join("does-not-exist"));
        assert_eq!(res.score, 0.8);
        let dir = root.path().join("empty");
        std::fs::create_dir(&dir).unwrap();
        let cfg = ValidationConfig { optional_files: (0..30).map(|i| format!("extra_{i}.txt")).collect(), ..Default::default() };
        let res = ValidationEngine::new(cfg).validate(&dir);
        assert_eq!(res.score, 0.0);
        assert!(!res.is_valid);
    }

    #[test]
    fn feature_compatibility_score() {
        let declared: Vec<String> = ["rssi", "noise", "tx_rate"].iter().map(|s| s.to_string()).collect();
        let target: Vec<String> = ["rssi", "noise", "channel"].iter().map(|s| s.to_string()).collect();
        let c = check_feature_compatibility(&declared, &target);
        assert_eq!(c.missing, vec!["tx_rate".to_string()]);
        assert_eq!(c.extra, vec!["channel".to_string()]);
        assert!((c.mismatch_score - 0.5).abs() < 1e-9);
        assert!(!c.compatible);
        assert_eq!(check_feature_compatibility(&[], &[]).mismatch_score, 0.0);
    }
}
