//! Operation surface consumed by the (external) HTTP layer.
//!
//! Every call answers with an `OperationResponse` envelope; errors carry the stable code from
//! `LifecycleError::code` so callers can branch without parsing messages.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, Result};
use crate::manager::ModelManager;
use crate::monitor::PerformanceMonitor;
use crate::registry::Registry;
use crate::transfer::TransferService;
use crate::validation::ValidationEngine;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationResponse {
    pub fn ok(result: Value) -> Self { Self { status: "ok".into(), result: Some(result), error_code: None, message: None } }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self { status: "error".into(), result: None, error_code: Some(code.into()), message: Some(message.into()) }
    }

    pub fn is_ok(&self) -> bool { self.status == "ok" }
}

impl From<LifecycleError> for OperationResponse {
    fn from(e: LifecycleError) -> Self { OperationResponse::error(e.code(), e.to_string()) }
}

fn respond<T: Serialize>(outcome: Result<T>) -> OperationResponse {
    match outcome {
        Ok(value) => match serde_json::to_value(value) {
            Ok(v) => OperationResponse::ok(v),
            Err(e) => {
                error!(error = %e, "response serialization failed");
                OperationResponse::error("INTERNAL_ERROR", e.to_string())
            }
        },
        Err(e) => e.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportTarget {
    Latest,
    Path(PathBuf),
}

impl ImportTarget {
    /// `"latest"` selects the newest candidate; anything else is a package path.
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("latest") { ImportTarget::Latest } else { ImportTarget::Path(raw.into()) }
    }
}

pub struct LifecycleService {
    manager: Arc<ModelManager>,
    transfer: Arc<TransferService>,
}

impl LifecycleService {
    pub fn new(manager: Arc<ModelManager>, transfer: Arc<TransferService>) -> Self { Self { manager, transfer } }

    pub fn from_config(cfg: &LifecycleConfig) -> Result<Self> {
        let storage = &cfg.storage;
        let registry = Arc::new(Registry::open(&storage.registry_file)?);
        let validator = Arc::new(ValidationEngine::new(cfg.validation.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(cfg.performance.clone(), cfg.drift.clone()));
        let manager = Arc::new(ModelManager::new(registry.clone(), validator.clone(), monitor, &storage.models_dir));
        let transfer = Arc::new(TransferService::open(&storage.source_dir, &storage.models_dir, &storage.transfer_log, registry, validator, &cfg.transfer)?);
        info!(models_dir = %storage.models_dir.display(), source_dir = %storage.source_dir.display(), "lifecycle service assembled");
        Ok(Self::new(manager, transfer))
    }

    pub fn manager(&self) -> &Arc<ModelManager> { &self.manager }

    pub fn list_models(&self) -> OperationResponse { respond(Ok(self.manager.list_models())) }

    pub fn get_model(&self, version: &str) -> OperationResponse { respond(self.manager.get_model(version)) }

    pub async fn deploy(&self, version: &str) -> OperationResponse { respond(self.manager.deploy(version).await) }

    pub async fn rollback(&self, version: &str) -> OperationResponse { respond(self.manager.rollback(version).await) }

    pub async fn undeploy(&self, family: &str) -> OperationResponse { respond(self.manager.undeploy(family).await) }

    pub async fn validate(&self, version: &str) -> OperationResponse { respond(self.manager.validate(version).await) }

    /// Declared features of `version` against the caller's feature names.
    pub fn check_features(&self, version: &str, target: &[String]) -> OperationResponse {
        respond(self.manager.check_features(version, target))
    }

    pub fn predict(&self, features: &HashMap<String, f64>) -> OperationResponse { respond(self.manager.predict(features)) }

    pub fn batch_predict(&self, batch: &[HashMap<String, f64>]) -> OperationResponse { respond(self.manager.batch_predict(batch)) }

    pub async fn scan_source(&self) -> OperationResponse { respond(self.transfer.scan_source().await) }

    pub async fn import(&self, target: ImportTarget, validate: bool) -> OperationResponse {
        let outcome = match target {
            ImportTarget::Latest => self.transfer.import_latest(validate).await,
            ImportTarget::Path(path) => self.transfer.import_one(&path, validate).await.map(Some),
        };
        respond(outcome.map(|o| o.map(|o| json!({"transfer": o.record, "model": o.package, "validation": o.validation}))))
    }

    /// Performance summary for `version`, or for the serving version when none is given.
    pub fn performance(&self, version: Option<&str>) -> OperationResponse {
        respond(self.resolve(version).map(|v| self.manager.monitor().summary(&v)))
    }

    pub fn check_drift(&self, version: Option<&str>) -> OperationResponse {
        respond(self.resolve(version).map(|v| self.manager.monitor().check_drift(&v)))
    }

    pub fn transfer_history(&self, version: Option<&str>) -> OperationResponse {
        respond(Ok(match version {
            Some(v) => self.transfer.history_for(v),
            None => self.transfer.history(),
        }))
    }

    pub async fn cleanup(&self, keep: usize) -> OperationResponse { respond(self.manager.cleanup(keep).await) }

    pub fn status(&self) -> OperationResponse {
        let registry = self.manager.registry();
        respond(Ok(json!({
            "current_version": self.manager.current_version(),
            "registered": registry.len(),
            "families": registry.families(),
            "deployed": registry.all_deployed().into_iter().map(|p| json!({"family": p.family, "version": p.version})).collect::<Vec<_>>(),
        })))
    }

    fn resolve(&self, version: Option<&str>) -> Result<String> {
        match version {
            Some(v) => Ok(v.to_string()),
            None => self.manager.current_version().ok_or(LifecycleError::NotLoaded),
        }
    }
}
