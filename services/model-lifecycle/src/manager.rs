//! In-memory serving model plus the deploy / rollback / validate transitions against the registry.
//!
//! The serving model lives behind an `ArcSwapOption`: predictions take a lock-free snapshot and a
//! load only becomes visible after it fully succeeded. Status changes for one family are
//! serialized by an async guard; a second caller arriving while one is in flight gets
//! `DeploymentConflict` instead of queueing.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use lifecycle_core::{publish_status, LIFECYCLE_METRICS};
use crate::error::{LifecycleError, Result};
use crate::model::{AnomalyModel, StandardScaler, ANOMALY_LABEL};
use crate::monitor::{DriftReport, PerformanceMonitor};
use crate::package::{DeploymentStatus, ModelPackage};
use crate::registry::Registry;
use crate::validation::{FeatureCompatibility, ValidationEngine, ValidationResult};

/// Model currently answering predictions.
#[derive(Debug)]
pub struct ActiveModel {
    pub version: String,
    pub family: String,
    pub feature_names: Vec<String>,
    predictor: Arc<dyn AnomalyModel>,
    scaler: Option<StandardScaler>,
    pub loaded_at: DateTime<Utc>,
}

impl ActiveModel {
    /// Order the named inputs by the declared feature list. Absent names become 0.0.
    fn vectorize(&self, features: &HashMap<String, f64>) -> Vec<f64> {
        let raw: Vec<f64> = self.feature_names.iter().map(|name| features.get(name).copied().unwrap_or(0.0)).collect();
        match &self.scaler {
            Some(s) => s.transform(&raw),
            None => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResult {
    pub prediction: i32,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub model_version: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub version: String,
    pub family: String,
    pub status: DeploymentStatus,
    pub model_type: String,
    pub created_at: Option<DateTime<Utc>>,
    pub feature_count: usize,
    pub f1_score: Option<f64>,
    pub validation_score: Option<f64>,
    pub path: PathBuf,
}

impl From<&ModelPackage> for ModelSummary {
    fn from(pkg: &ModelPackage) -> Self {
        Self {
            version: pkg.version.clone(),
            family: pkg.family.clone(),
            status: pkg.status,
            model_type: pkg.metadata.model_info.model_type.clone(),
            created_at: pkg.created_at(),
            feature_count: pkg.metadata.training_info.feature_names.len(),
            f1_score: pkg.metadata.evaluation_info.f1_score,
            validation_score: pkg.validation.as_ref().map(|v| v.score),
            path: pkg.path.clone(),
        }
    }
}

type FamilyGuard = Arc<tokio::sync::Mutex<()>>;

pub struct ModelManager {
    registry: Arc<Registry>,
    validator: Arc<ValidationEngine>,
    monitor: Arc<PerformanceMonitor>,
    models_dir: PathBuf,
    current: ArcSwapOption<ActiveModel>,
    family_guards: parking_lot::Mutex<HashMap<String, FamilyGuard>>,
}

impl ModelManager {
    pub fn new(registry: Arc<Registry>, validator: Arc<ValidationEngine>, monitor: Arc<PerformanceMonitor>, models_dir: impl Into<PathBuf>) -> Self {
        Self { registry, validator, monitor, models_dir: models_dir.into(), current: ArcSwapOption::empty(), family_guards: parking_lot::Mutex::new(HashMap::new()) }
    }

    pub fn registry(&self) -> &Arc<Registry> { &self.registry }
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> { &self.monitor }
    pub fn models_dir(&self) -> &Path { &self.models_dir }

    pub fn current(&self) -> Option<Arc<ActiveModel>> { self.current.load_full() }
    pub fn current_version(&self) -> Option<String> { self.current.load().as_ref().map(|m| m.version.clone()) }

    fn family_guard(&self, family: &str) -> FamilyGuard {
        self.family_guards.lock().entry(family.to_string()).or_default().clone()
    }

    /// Decode and probe a registered version off the async runtime. Nothing is swapped in.
    async fn prepare(&self, pkg: &ModelPackage) -> Result<ActiveModel> {
        let validator = self.validator.clone();
        let probe = pkg.clone();
        let loaded = tokio::task::spawn_blocking(move || validator.check_loadability(&probe)).await?
            .map_err(|e| LifecycleError::Validation { version: pkg.version.clone(), reason: e.to_string() })?;
        Ok(ActiveModel {
            version: pkg.version.clone(),
            family: pkg.family.clone(),
            feature_names: pkg.metadata.training_info.feature_names.clone(),
            predictor: loaded.predictor,
            scaler: loaded.scaler,
            loaded_at: Utc::now(),
        })
    }

    fn install(&self, model: ActiveModel) {
        info!(version = %model.version, family = %model.family, features = model.feature_names.len(), scaler = model.scaler.is_some(), "serving model swapped");
        publish_status("deployed_version", model.version.clone());
        self.current.store(Some(Arc::new(model)));
    }

    /// Load a registered version as the serving model without touching its registry status.
    /// On failure the previous model keeps serving.
    #[instrument(skip(self))]
    pub async fn load(&self, version: &str) -> Result<()> {
        let pkg = self.registry.get(version)?;
        let model = self.prepare(&pkg).await.inspect_err(|e| warn!(version, error = %e, "load failed, keeping previous model"))?;
        self.install(model);
        Ok(())
    }

    pub async fn deploy(&self, version: &str) -> Result<ModelPackage> { self.promote(version, "deploy").await }

    /// Same contract as `deploy`; the currently deployed version of the family returns to `available`.
    pub async fn rollback(&self, version: &str) -> Result<ModelPackage> { self.promote(version, "rollback").await }

    #[instrument(skip(self))]
    async fn promote(&self, version: &str, operation: &'static str) -> Result<ModelPackage> {
        let family = self.registry.get(version)?.family;
        let guard = self.family_guard(&family);
        let Ok(_held) = guard.try_lock() else {
            LIFECYCLE_METRICS.deployments_total.with_label_values(&[operation, "conflict"]).inc();
            return Err(LifecycleError::DeploymentConflict { family });
        };

        let pkg = self.registry.get(version)?;
        match pkg.status {
            DeploymentStatus::Available => {}
            DeploymentStatus::Deployed => {
                if self.current_version().as_deref() != Some(version) {
                    let model = self.prepare(&pkg).await?;
                    self.install(model);
                }
                debug!(version, "already deployed");
                return Ok(pkg);
            }
            from => {
                LIFECYCLE_METRICS.deployments_total.with_label_values(&[operation, "rejected"]).inc();
                return Err(LifecycleError::InvalidTransition { version: version.to_string(), from, to: DeploymentStatus::Deployed });
            }
        }

        let model = match self.prepare(&pkg).await {
            Ok(m) => m,
            Err(e) => {
                warn!(version, error = %e, "load failed, previous deployment stays authoritative");
                let failed = version.to_string();
                if let Err(mark) = self.registry.with_blocking(move |r| r.set_status(&failed, DeploymentStatus::Failed)).await {
                    warn!(version, error = %mark, "could not mark version failed");
                }
                LIFECYCLE_METRICS.deployments_total.with_label_values(&[operation, "failed"]).inc();
                return Err(e);
            }
        };
        let previous = self.registry.deployed(&family).map(|p| p.version);
        let target = version.to_string();
        let updated = self.registry.with_blocking(move |r| r.set_status(&target, DeploymentStatus::Deployed)).await?;
        self.install(model);
        LIFECYCLE_METRICS.deployments_total.with_label_values(&[operation, "ok"]).inc();
        info!(version, family = %family, previous = ?previous, operation, "deployment changed");
        Ok(updated)
    }

    /// Demote the family's deployed version to `available` and stop serving it.
    #[instrument(skip(self))]
    pub async fn undeploy(&self, family: &str) -> Result<Option<ModelPackage>> {
        let guard = self.family_guard(family);
        let Ok(_held) = guard.try_lock() else {
            return Err(LifecycleError::DeploymentConflict { family: family.to_string() });
        };
        let Some(deployed) = self.registry.deployed(family) else { return Ok(None) };
        let updated = self.registry.with_blocking(move |r| r.set_status(&deployed.version, DeploymentStatus::Available)).await?;
        if self.current.load().as_ref().is_some_and(|m| m.family == family) {
            self.current.store(None);
            publish_status("deployed_version", serde_json::Value::Null);
        }
        LIFECYCLE_METRICS.deployments_total.with_label_values(&["undeploy", "ok"]).inc();
        info!(version = %updated.version, family, "undeployed");
        Ok(Some(updated))
    }

    /// Run the full validation and apply its verdict: `imported`/`failed` become `available` on
    /// success; `imported`/`available` become `failed` otherwise. A deployed version that no longer
    /// validates keeps serving and is only reported.
    ///
    /// A passing package that is not deployed has its record re-read from disk first, so metadata
    /// repaired after import (family, features, artifacts) is what later deploys use.
    #[instrument(skip(self))]
    pub async fn validate(&self, version: &str) -> Result<ValidationResult> {
        let pkg = self.registry.get(version)?;
        let guard = self.family_guard(&pkg.family);
        let _held = guard.lock().await;

        let validator = self.validator.clone();
        let dir = pkg.path.clone();
        let result = tokio::task::spawn_blocking(move || validator.validate(&dir)).await?;
        if result.is_valid && pkg.status != DeploymentStatus::Deployed {
            let mut fresh = ModelPackage::from_dir(&pkg.path, pkg.status)?;
            fresh.version = version.to_string();
            let refreshed = self.registry.with_blocking(move |r| r.refresh(fresh)).await?;
            if refreshed.family != pkg.family {
                info!(version, from = %pkg.family, to = %refreshed.family, "family corrected by revalidation");
            }
        }
        let (owned, summary) = (version.to_string(), result.summary());
        let pkg = self.registry.with_blocking(move |r| r.record_validation(&owned, summary)).await?;

        let next = match (pkg.status, result.is_valid) {
            (DeploymentStatus::Imported | DeploymentStatus::Failed, true) => Some(DeploymentStatus::Available),
            (DeploymentStatus::Imported | DeploymentStatus::Available, false) => Some(DeploymentStatus::Failed),
            (DeploymentStatus::Deployed, false) => {
                warn!(version, score = result.score, reason = %result.reason(), "deployed version no longer validates");
                None
            }
            _ => None,
        };
        if let Some(status) = next {
            let owned = version.to_string();
            self.registry.with_blocking(move |r| r.set_status(&owned, status)).await?;
        }
        Ok(result)
    }

    /// Compare a registered version's declared features against the caller's feature set.
    pub fn check_features(&self, version: &str, target: &[String]) -> Result<FeatureCompatibility> {
        let pkg = self.registry.get(version)?;
        Ok(self.validator.check_package_features(&pkg, target))
    }

    pub fn predict(&self, features: &HashMap<String, f64>) -> Result<PredictResult> {
        let model = self.current.load_full().ok_or(LifecycleError::NotLoaded)?;
        Ok(self.predict_with(&model, features))
    }

    /// Every item is scored against the same model snapshot.
    pub fn batch_predict(&self, batch: &[HashMap<String, f64>]) -> Result<Vec<PredictResult>> {
        let model = self.current.load_full().ok_or(LifecycleError::NotLoaded)?;
        Ok(batch.iter().map(|features| self.predict_with(&model, features)).collect())
    }

    fn predict_with(&self, model: &ActiveModel, features: &HashMap<String, f64>) -> PredictResult {
        let started = Instant::now();
        let input = model.vectorize(features);
        let anomaly_score = model.predictor.score_anomaly(&input);
        let prediction = model.predictor.predict(&input);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let is_anomaly = prediction == ANOMALY_LABEL;

        self.monitor.record(&model.version, elapsed_ms, anomaly_score, is_anomaly);
        LIFECYCLE_METRICS.predictions_total.with_label_values(&[&model.version, if is_anomaly { "anomaly" } else { "normal" }]).inc();
        LIFECYCLE_METRICS.prediction_latency_ms.with_label_values(&[&model.version]).observe(elapsed_ms);

        PredictResult { prediction, anomaly_score, is_anomaly, model_version: model.version.clone(), timestamp: Utc::now() }
    }

    /// Newest first by `created_at`; versions without a parseable timestamp go last.
    pub fn list_models(&self) -> Vec<ModelSummary> {
        let mut out: Vec<ModelSummary> = self.registry.list().iter().map(ModelSummary::from).collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.version.cmp(&a.version)));
        out
    }

    pub fn get_model(&self, version: &str) -> Result<ModelPackage> { self.registry.get(version) }

    /// Explicit retention: per family keep the deployed version plus the newest `keep` others.
    /// Removed packages under local storage are deleted from disk.
    ///
    /// Each family is pruned while holding its guard, waiting for an in-flight deploy to finish,
    /// so the deployed version is decided against current state. A version that cannot be removed
    /// is logged and skipped; the result lists exactly what was retired.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, keep: usize) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for family in self.registry.families() {
            let guard = self.family_guard(&family);
            let _held = guard.lock().await;

            let mut pkgs: Vec<ModelPackage> = self.registry.list().into_iter()
                .filter(|p| p.family == family && p.status != DeploymentStatus::Deployed)
                .collect();
            pkgs.sort_by(|a, b| b.version.cmp(&a.version));
            for pkg in pkgs.into_iter().skip(keep) {
                let version = pkg.version.clone();
                let pkg = match self.registry.with_blocking(move |r| r.remove(&version)).await {
                    Ok(pkg) => pkg,
                    Err(e) => {
                        warn!(version = %pkg.version, family = %family, error = %e, "could not retire version, skipping");
                        continue;
                    }
                };
                if pkg.path.starts_with(&self.models_dir) && tokio::fs::metadata(&pkg.path).await.is_ok() {
                    if let Err(e) = tokio::fs::remove_dir_all(&pkg.path).await {
                        warn!(version = %pkg.version, path = %pkg.path.display(), error = %e, "could not delete package directory");
                    }
                }
                debug!(version = %pkg.version, family = %family, "retired");
                removed.push(pkg.version);
            }
        }
        if !removed.is_empty() { info!(count = removed.len(), keep, "retention cleanup finished"); }
        Ok(removed)
    }

    /// Serve the most recently promoted deployed version after a restart.
    pub async fn restore_deployed(&self) -> Result<Option<String>> {
        let mut deployed = self.registry.all_deployed();
        deployed.sort_by(|a, b| b.status_changed_at.cmp(&a.status_changed_at));
        for pkg in deployed {
            match self.prepare(&pkg).await {
                Ok(model) => {
                    self.install(model);
                    return Ok(Some(pkg.version));
                }
                Err(e) => warn!(version = %pkg.version, error = %e, "deployed version failed to load at startup"),
            }
        }
        Ok(None)
    }

    /// Drift check for the serving version; a detected drift is logged and counted, never acted on.
    pub fn check_current_drift(&self) -> Option<DriftReport> {
        let version = self.current_version()?;
        let report = self.monitor.check_drift(&version);
        if let Some(w) = report.warning() {
            LIFECYCLE_METRICS.drift_warnings_total.with_label_values(&[&w.version]).inc();
            warn!(version = %w.version, drift_score = w.drift_score, threshold = w.threshold,
                anomaly_rate_change = w.indicators.anomaly_rate_change, score_change = w.indicators.score_change,
                inference_time_change = w.indicators.inference_time_change, "model drift detected");
        }
        Some(report)
    }

    /// Periodic drift checks at the monitor's configured interval.
    pub fn spawn_drift_watch(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let every = Duration::from_secs(self.monitor.drift_config().check_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(report) = self.check_current_drift() {
                    debug!(version = %report.version, drift_score = report.drift_score, insufficient = report.insufficient_data, "drift check");
                }
            }
        })
    }
}
