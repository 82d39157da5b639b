//! Imports model packages from the training output location into local managed storage.
//!
//! Copies land in `<models_dir>/.staging/<version>-<uuid>` and are only moved into place and
//! registered after the copy and validation finish, so a cancelled import never leaves a
//! registered half-copy behind. Every attempt writes an `in_progress` line to the JSON-lines audit
//! log when it starts and a terminal line when it ends; an import dropped mid-flight is closed out
//! as `failed` from its drop guard. In memory the history keeps the latest state per transfer.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use lifecycle_core::{retry_async, RetryConfig, LIFECYCLE_METRICS};
use crate::error::{LifecycleError, Result, TransferError};
use crate::package::{version_of, DeploymentStatus, ModelMetadata, ModelPackage, METADATA_FILE, MODEL_FILE};
use crate::registry::Registry;
use crate::validation::{ValidationEngine, ValidationResult};

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub retry_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for TransferConfig { fn default() -> Self { Self { retry_attempts: 3, retry_base_delay_ms: 100 } } }

impl TransferConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig { max_retries: self.retry_attempts, base_delay: std::time::Duration::from_millis(self.retry_base_delay_ms), ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus { InProgress, Completed, ValidationFailed, Failed, Duplicate }

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::InProgress => "in_progress",
            TransferStatus::Completed => "completed",
            TransferStatus::ValidationFailed => "validation_failed",
            TransferStatus::Failed => "failed",
            TransferStatus::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub version: String,
    pub source_path: PathBuf,
    pub local_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    pub status: TransferStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub bytes_copied: u64,
    #[serde(default)]
    pub validation_score: Option<f64>,
}

impl TransferRecord {
    fn begin(version: &str, source: &Path) -> Self {
        Self {
            transfer_id: Uuid::new_v4().to_string(),
            version: version.to_string(),
            source_path: source.to_path_buf(),
            local_path: None,
            timestamp: Utc::now(),
            status: TransferStatus::InProgress,
            message: None,
            bytes_copied: 0,
            validation_score: None,
        }
    }

    fn finish(&mut self, status: TransferStatus, message: Option<String>) {
        self.status = status;
        self.message = message;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateModel {
    pub version: String,
    pub path: PathBuf,
    pub model_type: Option<String>,
    pub created_at: Option<String>,
    pub has_model: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub record: TransferRecord,
    pub package: ModelPackage,
    pub validation: Option<ValidationResult>,
}

/// Removes the staging directory unless the copy was promoted into place.
struct StagingGuard { path: PathBuf, armed: bool }

impl StagingGuard {
    fn disarm(&mut self) { self.armed = false; }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) { warn!(path = %self.path.display(), error = %e, "failed to clean staging directory"); }
        }
    }
}

/// Owns the record of an import in flight. If the import future is dropped before `settle`,
/// the record is closed out as failed with a synchronous write.
struct InFlight<'a> { service: &'a TransferService, record: TransferRecord, settled: bool }

impl InFlight<'_> {
    fn settle(&mut self) -> TransferRecord {
        self.settled = true;
        self.record.clone()
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled { return; }
        self.record.finish(TransferStatus::Failed, Some("import cancelled".into()));
        warn!(transfer_id = %self.record.transfer_id, version = %self.record.version, "import cancelled before completion");
        self.service.append_blocking(&self.record);
    }
}

pub struct TransferService {
    source_dir: PathBuf,
    models_dir: PathBuf,
    log_path: PathBuf,
    registry: Arc<Registry>,
    validator: Arc<ValidationEngine>,
    retry: RetryConfig,
    history: RwLock<Vec<TransferRecord>>,
    import_lock: tokio::sync::Mutex<()>,
}

impl TransferService {
    /// Opens the service, replaying the existing audit log into memory.
    pub fn open(source_dir: impl Into<PathBuf>, models_dir: impl Into<PathBuf>, log_path: impl Into<PathBuf>, registry: Arc<Registry>, validator: Arc<ValidationEngine>, cfg: &TransferConfig) -> Result<Self> {
        let log_path = log_path.into();
        let mut history = Vec::new();
        if log_path.exists() {
            let text = std::fs::read_to_string(&log_path).map_err(|e| LifecycleError::io(&log_path, e))?;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<TransferRecord>(line) {
                    Ok(rec) => upsert(&mut history, rec),
                    Err(e) => warn!(error = %e, "skipping malformed transfer log line"),
                }
            }
        }
        let unfinished = history.iter().filter(|r: &&TransferRecord| r.status == TransferStatus::InProgress).count();
        if unfinished > 0 {
            warn!(unfinished, "transfer log has imports that never finished");
        }
        Ok(Self {
            source_dir: source_dir.into(),
            models_dir: models_dir.into(),
            log_path,
            registry,
            validator,
            retry: cfg.retry(),
            history: RwLock::new(history),
            import_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Package directories in the source location that are not registered yet, ascending by version.
    pub async fn scan_source(&self) -> Result<Vec<CandidateModel>> {
        let mut entries = tokio::fs::read_dir(&self.source_dir).await
            .map_err(|_| TransferError::SourceUnreachable { path: self.source_dir.clone() })?;
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| TransferError::from_io(&self.source_dir, e))? {
            let path = entry.path();
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) { continue; }
            let Some(version) = version_of(&path) else { continue };
            if version.starts_with('.') || self.registry.contains(&version) { continue; }
            let has_model = tokio::fs::metadata(path.join(MODEL_FILE)).await.is_ok();
            let has_metadata = tokio::fs::metadata(path.join(METADATA_FILE)).await.is_ok();
            if !has_model && !has_metadata { continue; }
            let meta = if has_metadata { ModelMetadata::read(&path).ok() } else { None };
            candidates.push(CandidateModel {
                version,
                size_bytes: dir_size(&path).await,
                model_type: meta.as_ref().map(|m| m.model_info.model_type.clone()),
                created_at: meta.map(|m| m.model_info.created_at),
                has_model,
                path,
            });
        }
        candidates.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(candidates)
    }

    /// Import the newest unregistered candidate, if any.
    pub async fn import_latest(&self, validate: bool) -> Result<Option<ImportOutcome>> {
        let Some(latest) = self.scan_source().await?.pop() else {
            info!(source = %self.source_dir.display(), "no new models to import");
            return Ok(None);
        };
        self.import_one(&latest.path, validate).await.map(Some)
    }

    #[instrument(skip(self, source), fields(source = %source.display()))]
    pub async fn import_one(&self, source: &Path, validate: bool) -> Result<ImportOutcome> {
        let _serial = self.import_lock.lock().await;
        let version = version_of(source);
        let label = version.clone().unwrap_or_else(|| source.display().to_string());
        let mut flight = InFlight { service: self, record: TransferRecord::begin(&label, source), settled: false };
        self.append(&flight.record).await;

        let result = self.transfer(version.as_deref(), source, validate, &mut flight.record).await;
        if let Err(e) = &result {
            flight.record.finish(TransferStatus::Failed, Some(e.to_string()));
            warn!(version = %label, error = %e, "import failed");
        }
        let record = flight.settle();
        self.append(&record).await;
        result.map(|(package, validation)| ImportOutcome { record, package, validation })
    }

    async fn transfer(&self, version: Option<&str>, source: &Path, validate: bool, record: &mut TransferRecord) -> Result<(ModelPackage, Option<ValidationResult>)> {
        let version = version.ok_or_else(|| TransferError::NotAPackage { path: source.to_path_buf() })?;
        if let Ok(existing) = self.registry.get(version) {
            record.local_path = Some(existing.path.clone());
            record.finish(TransferStatus::Duplicate, Some("version already registered".into()));
            info!(version, "import skipped, already registered");
            return Ok((existing, None));
        }

        match tokio::fs::metadata(source).await {
            Ok(m) if m.is_dir() => {}
            Ok(_) => return Err(TransferError::NotAPackage { path: source.to_path_buf() }.into()),
            Err(_) => return Err(TransferError::SourceUnreachable { path: source.to_path_buf() }.into()),
        }

        let staging_root = self.models_dir.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging_root).await.map_err(|e| TransferError::from_io(&staging_root, e))?;
        let staging = staging_root.join(format!("{version}-{}", Uuid::new_v4().simple()));
        let mut guard = StagingGuard { path: staging.clone(), armed: true };

        record.bytes_copied = retry_async(&self.retry, |_attempt| {
            let staging = staging.clone();
            async move {
                if tokio::fs::metadata(&staging).await.is_ok() {
                    tokio::fs::remove_dir_all(&staging).await.map_err(|e| TransferError::from_io(&staging, e))?;
                }
                copy_dir(source, &staging).await
            }
        }, TransferError::is_transient).await?;

        let validation = if validate {
            let validator = self.validator.clone();
            let dir = staging.clone();
            Some(tokio::task::spawn_blocking(move || validator.validate(&dir)).await?)
        } else {
            None
        };

        let target = self.models_dir.join(version);
        if tokio::fs::metadata(&target).await.is_ok() {
            warn!(version, target = %target.display(), "replacing unregistered package directory");
            tokio::fs::remove_dir_all(&target).await.map_err(|e| TransferError::from_io(&target, e))?;
        }
        tokio::fs::rename(&staging, &target).await.map_err(|e| TransferError::from_io(&target, e))?;
        guard.disarm();

        let passed = validation.as_ref().map(|v| v.is_valid).unwrap_or(true);
        let package = match ModelPackage::from_dir(&target, if passed { DeploymentStatus::Imported } else { DeploymentStatus::Failed }) {
            Ok(pkg) => pkg,
            Err(e) => {
                warn!(version, error = %e, "metadata unreadable, registering as failed");
                ModelPackage::unreadable(version, &target)
            }
        };
        let mut package = self.registry.with_blocking(move |r| r.register(package)).await?;
        if let Some(v) = &validation {
            let (owned, summary) = (version.to_string(), v.summary());
            package = self.registry.with_blocking(move |r| r.record_validation(&owned, summary)).await?;
            record.validation_score = Some(v.score);
        }

        record.local_path = Some(target);
        if package.status == DeploymentStatus::Failed {
            let reason = validation.as_ref().map(|v| v.reason()).unwrap_or_else(|| "metadata unreadable".into());
            record.finish(TransferStatus::ValidationFailed, Some(reason));
        } else {
            record.finish(TransferStatus::Completed, None);
        }
        info!(version, status = %package.status, bytes = record.bytes_copied, "model imported");
        Ok((package, validation))
    }

    async fn append(&self, record: &TransferRecord) {
        LIFECYCLE_METRICS.imports_total.with_label_values(&[record.status.as_str()]).inc();
        upsert(&mut self.history.write(), record.clone());
        if let Err(e) = self.append_log(record).await {
            warn!(transfer_id = %record.transfer_id, error = %e, "failed to append transfer log");
        }
    }

    /// Drop-path variant of `append`; there is no runtime to await on.
    fn append_blocking(&self, record: &TransferRecord) {
        LIFECYCLE_METRICS.imports_total.with_label_values(&[record.status.as_str()]).inc();
        upsert(&mut self.history.write(), record.clone());
        let written = (|| -> std::io::Result<()> {
            if let Some(parent) = self.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
            line.push(b'\n');
            std::fs::OpenOptions::new().create(true).append(true).open(&self.log_path)?.write_all(&line)
        })();
        if let Err(e) = written {
            warn!(transfer_id = %record.transfer_id, error = %e, "failed to append transfer log");
        }
    }

    async fn append_log(&self, record: &TransferRecord) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.log_path).await?;
        file.write_all(&line).await?;
        file.flush().await
    }

    pub fn history(&self) -> Vec<TransferRecord> { self.history.read().clone() }

    pub fn history_for(&self, version: &str) -> Vec<TransferRecord> {
        self.history.read().iter().filter(|r| r.version == version).cloned().collect()
    }
}

/// Later lines for the same transfer replace earlier ones.
fn upsert(history: &mut Vec<TransferRecord>, record: TransferRecord) {
    match history.iter().rposition(|r| r.transfer_id == record.transfer_id) {
        Some(i) => history[i] = record,
        None => history.push(record),
    }
}

/// Recursive copy without async recursion; returns bytes copied.
async fn copy_dir(from: &Path, to: &Path) -> Result<u64, TransferError> {
    let mut stack = vec![(from.to_path_buf(), to.to_path_buf())];
    let mut bytes = 0;
    while let Some((src, dst)) = stack.pop() {
        tokio::fs::create_dir_all(&dst).await.map_err(|e| TransferError::from_io(&dst, e))?;
        let mut entries = tokio::fs::read_dir(&src).await.map_err(|e| TransferError::from_io(&src, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| TransferError::from_io(&src, e))? {
            let ty = entry.file_type().await.map_err(|e| TransferError::from_io(&entry.path(), e))?;
            let target = dst.join(entry.file_name());
            if ty.is_dir() {
                stack.push((entry.path(), target));
            } else if ty.is_file() {
                bytes += tokio::fs::copy(entry.path(), &target).await.map_err(|e| TransferError::from_io(&target, e))?;
            }
        }
    }
    Ok(bytes)
}

async fn dir_size(dir: &Path) -> u64 {
    let mut stack = vec![dir.to_path_buf()];
    let mut total = 0;
    while let Some(d) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&d).await else { continue };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.metadata().await {
                Ok(m) if m.is_dir() => stack.push(entry.path()),
                Ok(m) => total += m.len(),
                Err(_) => {}
            }
        }
    }
    total
}
