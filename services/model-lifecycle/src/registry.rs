//! Durable registry of model versions and their deployment status.
//!
//! Single writer: every mutation happens under one write lock and is persisted before the lock is
//! released, so at most one version per family is ever observed as `deployed`. The file is
//! rewritten atomically (temp file + rename) in the current versioned shape; two legacy shapes,
//! a JSON array of records and a flat object keyed by version, are normalized on load.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, Result};
use crate::package::{DeploymentStatus, ModelPackage, ValidationSummary, METADATA_FILE};

pub const SCHEMA_VERSION: u32 = 2;

#[derive(Serialize, Deserialize)]
struct RegistryDocument {
    schema_version: u32,
    models: BTreeMap<String, ModelPackage>,
}

#[derive(Serialize)]
struct RegistryDocumentRef<'a> {
    schema_version: u32,
    models: &'a BTreeMap<String, ModelPackage>,
}

pub struct Registry {
    path: PathBuf,
    models: RwLock<BTreeMap<String, ModelPackage>>,
}

impl Registry {
    /// Load the registry file, or start empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let models = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| LifecycleError::io(&path, e))?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                BTreeMap::new()
            } else {
                let raw: Value = serde_json::from_slice(&bytes).map_err(|source| LifecycleError::Parse { what: path.display().to_string(), source })?;
                normalize(raw)?
            }
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), models = models.len(), "registry loaded");
        Ok(Self { path, models: RwLock::new(models) })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Run a mutation on the blocking pool so the synchronous file write never stalls a runtime worker.
    pub async fn with_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Registry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || f(&registry)).await?
    }

    fn persist(&self, models: &BTreeMap<String, ModelPackage>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LifecycleError::io(parent, e))?;
        }
        let doc = RegistryDocumentRef { schema_version: SCHEMA_VERSION, models };
        let bytes = serde_json::to_vec_pretty(&doc).map_err(|source| LifecycleError::Parse { what: "registry document".into(), source })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(|e| LifecycleError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| LifecycleError::io(&self.path, e))?;
        Ok(())
    }

    /// Add a version. Registering a known version is a no-op that returns the stored record.
    pub fn register(&self, mut pkg: ModelPackage) -> Result<ModelPackage> {
        if pkg.status == DeploymentStatus::Deployed {
            return Err(LifecycleError::InvalidTransition { version: pkg.version, from: DeploymentStatus::Imported, to: DeploymentStatus::Deployed });
        }
        let mut models = self.models.write();
        if let Some(existing) = models.get(&pkg.version) {
            debug!(version = %pkg.version, "already registered");
            return Ok(existing.clone());
        }
        if pkg.family.is_empty() { pkg.family = pkg.metadata.family().to_string(); }
        models.insert(pkg.version.clone(), pkg.clone());
        if let Err(e) = self.persist(&models) {
            models.remove(&pkg.version);
            return Err(e);
        }
        info!(version = %pkg.version, family = %pkg.family, status = %pkg.status, "model registered");
        Ok(pkg)
    }

    pub fn get(&self, version: &str) -> Result<ModelPackage> {
        self.models.read().get(version).cloned().ok_or_else(|| LifecycleError::UnknownVersion(version.to_string()))
    }

    pub fn contains(&self, version: &str) -> bool { self.models.read().contains_key(version) }

    pub fn len(&self) -> usize { self.models.read().len() }
    pub fn is_empty(&self) -> bool { self.models.read().is_empty() }

    /// All versions in ascending version order.
    pub fn list(&self) -> Vec<ModelPackage> { self.models.read().values().cloned().collect() }

    pub fn families(&self) -> BTreeSet<String> { self.models.read().values().map(|p| p.family.clone()).collect() }

    pub fn deployed(&self, family: &str) -> Option<ModelPackage> {
        self.models.read().values().find(|p| p.family == family && p.status == DeploymentStatus::Deployed).cloned()
    }

    pub fn all_deployed(&self) -> Vec<ModelPackage> {
        self.models.read().values().filter(|p| p.status == DeploymentStatus::Deployed).cloned().collect()
    }

    /// Change one version's status. Promoting to `deployed` demotes the family's current deployed
    /// version to `available` in the same operation; a failed write reverts both.
    pub fn set_status(&self, version: &str, status: DeploymentStatus) -> Result<ModelPackage> {
        let mut models = self.models.write();
        let current = models.get(version).ok_or_else(|| LifecycleError::UnknownVersion(version.to_string()))?;
        if !current.status.can_transition_to(status) {
            return Err(LifecycleError::InvalidTransition { version: version.to_string(), from: current.status, to: status });
        }
        if current.status == status { return Ok(current.clone()); }

        let family = current.family.clone();
        let now = Utc::now();
        let mut previous: Vec<ModelPackage> = Vec::new();
        if status == DeploymentStatus::Deployed {
            for pkg in models.values_mut().filter(|p| p.family == family && p.version != version && p.status == DeploymentStatus::Deployed) {
                previous.push(pkg.clone());
                pkg.status = DeploymentStatus::Available;
                pkg.status_changed_at = now;
            }
        }
        let updated = match models.get_mut(version) {
            Some(pkg) => {
                previous.push(pkg.clone());
                pkg.status = status;
                pkg.status_changed_at = now;
                pkg.clone()
            }
            None => return Err(LifecycleError::UnknownVersion(version.to_string())),
        };
        if let Err(e) = self.persist(&models) {
            for old in previous { models.insert(old.version.clone(), old); }
            warn!(version, error = %e, "status change reverted, registry write failed");
            return Err(e);
        }
        info!(version, family = %family, status = %status, demoted = previous.len().saturating_sub(1), "status changed");
        Ok(updated)
    }

    pub fn record_validation(&self, version: &str, summary: ValidationSummary) -> Result<ModelPackage> {
        let mut models = self.models.write();
        let pkg = models.get_mut(version).ok_or_else(|| LifecycleError::UnknownVersion(version.to_string()))?;
        let old = pkg.validation.replace(summary);
        let updated = pkg.clone();
        if let Err(e) = self.persist(&models) {
            if let Some(pkg) = models.get_mut(version) { pkg.validation = old; }
            return Err(e);
        }
        Ok(updated)
    }

    /// Replace a record's package contents (metadata, family, artifacts, manifest) with a fresh
    /// read from disk. Status and bookkeeping are kept. Deployed records are never rewritten.
    pub fn refresh(&self, fresh: ModelPackage) -> Result<ModelPackage> {
        let mut models = self.models.write();
        let pkg = models.get_mut(&fresh.version).ok_or_else(|| LifecycleError::UnknownVersion(fresh.version.clone()))?;
        if pkg.status == DeploymentStatus::Deployed {
            return Err(LifecycleError::Registry(format!("refusing to rewrite deployed version {}", fresh.version)));
        }
        let old = pkg.clone();
        pkg.family = fresh.family;
        pkg.path = fresh.path;
        pkg.artifact_path = fresh.artifact_path;
        pkg.scaler_path = fresh.scaler_path;
        pkg.metadata = fresh.metadata;
        pkg.manifest = fresh.manifest;
        let updated = pkg.clone();
        if let Err(e) = self.persist(&models) {
            models.insert(old.version.clone(), old);
            return Err(e);
        }
        debug!(version = %updated.version, family = %updated.family, "record refreshed from disk");
        Ok(updated)
    }

    /// Explicit retention: drop a non-deployed version from the registry.
    pub fn remove(&self, version: &str) -> Result<ModelPackage> {
        let mut models = self.models.write();
        let pkg = models.get(version).ok_or_else(|| LifecycleError::UnknownVersion(version.to_string()))?;
        if pkg.status == DeploymentStatus::Deployed {
            return Err(LifecycleError::Registry(format!("refusing to remove deployed version {version}")));
        }
        let removed = models.remove(version).ok_or_else(|| LifecycleError::UnknownVersion(version.to_string()))?;
        if let Err(e) = self.persist(&models) {
            models.insert(removed.version.clone(), removed);
            return Err(e);
        }
        info!(version, "model removed from registry");
        Ok(removed)
    }

    /// Register package directories placed by hand in local storage. Returns the new versions.
    pub fn scan_local(&self, models_dir: &Path) -> Result<Vec<String>> {
        if !models_dir.exists() { return Ok(Vec::new()); }
        let entries = std::fs::read_dir(models_dir).map_err(|e| LifecycleError::io(models_dir, e))?;
        let mut dirs: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path())
            .filter(|p| p.is_dir() && p.join(METADATA_FILE).is_file())
            .filter(|p| p.file_name().and_then(|n| n.to_str()).map(|n| !n.starts_with('.')).unwrap_or(false))
            .collect();
        dirs.sort();
        let mut added = Vec::new();
        for dir in dirs {
            let Some(version) = crate::package::version_of(&dir) else { continue };
            if self.contains(&version) { continue; }
            match ModelPackage::from_dir(&dir, DeploymentStatus::Imported) {
                Ok(pkg) => { self.register(pkg)?; added.push(version); }
                Err(e) => warn!(dir = %dir.display(), error = %e, "skipping unreadable package"),
            }
        }
        if !added.is_empty() { info!(count = added.len(), "registered packages found in local storage"); }
        Ok(added)
    }
}

/// Map any supported on-disk shape onto the in-memory representation.
fn normalize(raw: Value) -> Result<BTreeMap<String, ModelPackage>> {
    let parse = |v: Value, what: &str| -> Result<ModelPackage> {
        serde_json::from_value(v).map_err(|source| LifecycleError::Parse { what: what.to_string(), source })
    };
    let mut models = BTreeMap::new();
    match raw {
        Value::Object(map) if map.contains_key("schema_version") => {
            let doc: RegistryDocument = serde_json::from_value(Value::Object(map)).map_err(|source| LifecycleError::Parse { what: "registry document".into(), source })?;
            if doc.schema_version > SCHEMA_VERSION {
                return Err(LifecycleError::Registry(format!("registry schema {} is newer than supported {SCHEMA_VERSION}", doc.schema_version)));
            }
            for (key, pkg) in doc.models {
                models.insert(key.clone(), keyed(key, pkg));
            }
        }
        Value::Object(map) => {
            debug!("migrating legacy keyed registry");
            for (key, record) in map {
                let pkg = parse(record, &format!("legacy record {key}"))?;
                models.insert(key.clone(), keyed(key, pkg));
            }
        }
        Value::Array(items) => {
            debug!("migrating legacy list registry");
            for (i, record) in items.into_iter().enumerate() {
                let pkg = parse(record, &format!("legacy record #{i}"))?;
                if pkg.version.is_empty() {
                    return Err(LifecycleError::Registry(format!("legacy record #{i} has no version")));
                }
                models.insert(pkg.version.clone(), pkg);
            }
        }
        other => return Err(LifecycleError::Registry(format!("unsupported registry shape: {}", type_name(&other)))),
    }
    for pkg in models.values_mut() {
        if pkg.family.is_empty() { pkg.family = pkg.metadata.family().to_string(); }
    }
    repair_deployed(&mut models);
    Ok(models)
}

/// The map key is authoritative for the version of keyed records.
fn keyed(key: String, mut pkg: ModelPackage) -> ModelPackage {
    if !pkg.version.is_empty() && pkg.version != key {
        warn!(key = %key, recorded = %pkg.version, "record version disagrees with its key, using the key");
    }
    pkg.version = key;
    pkg
}

/// Older files could hold several deployed versions per family; keep the newest one.
fn repair_deployed(models: &mut BTreeMap<String, ModelPackage>) {
    let mut newest: BTreeMap<String, String> = BTreeMap::new();
    for pkg in models.values().filter(|p| p.status == DeploymentStatus::Deployed) {
        newest.insert(pkg.family.clone(), pkg.version.clone()); // ascending iteration leaves the highest version
    }
    for pkg in models.values_mut().filter(|p| p.status == DeploymentStatus::Deployed) {
        if newest.get(&pkg.family) != Some(&pkg.version) {
            warn!(version = %pkg.version, family = %pkg.family, "demoting duplicate deployed version found on load");
            pkg.status = DeploymentStatus::Available;
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_package, PackageFixture};
    use serde_json::json;

    fn registry_with(root: &Path, versions: &[&str]) -> Registry {
        let reg = Registry::open(root.join("registry.json")).unwrap();
        for v in versions {
            let dir = write_package(&root.join("models"), &PackageFixture::version(v));
            reg.register(ModelPackage::from_dir(&dir, DeploymentStatus::Imported).unwrap()).unwrap();
            reg.set_status(v, DeploymentStatus::Available).unwrap();
        }
        reg
    }

    fn deployed_count(reg: &Registry, family: &str) -> usize {
        reg.list().iter().filter(|p| p.family == family && p.status == DeploymentStatus::Deployed).count()
    }

    #[test]
    fn promoting_demotes_previous_deployment() {
        let root = tempfile::tempdir().unwrap();
        let reg = registry_with(root.path(), &["20261001_000000", "20261002_000000"]);
        reg.set_status("20261001_000000", DeploymentStatus::Deployed).unwrap();
        reg.set_status("20261002_000000", DeploymentStatus::Deployed).unwrap();
        assert_eq!(deployed_count(&reg, "wifi-anomaly"), 1);
        assert_eq!(reg.get("20261001_000000").unwrap().status, DeploymentStatus::Available);
        assert_eq!(reg.deployed("wifi-anomaly").unwrap().version, "20261002_000000");
    }

    #[test]
    fn imported_cannot_be_deployed_directly() {
        let root = tempfile::tempdir().unwrap();
        let reg = Registry::open(root.path().join("registry.json")).unwrap();
        let dir = write_package(root.path(), &PackageFixture::default());
        reg.register(ModelPackage::from_dir(&dir, DeploymentStatus::Imported).unwrap()).unwrap();
        let err = reg.set_status("20261019_120000", DeploymentStatus::Deployed).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    }

    #[test]
    fn state_survives_reopen() {
        let root = tempfile::tempdir().unwrap();
        {
            let reg = registry_with(root.path(), &["20261001_000000"]);
            reg.set_status("20261001_000000", DeploymentStatus::Deployed).unwrap();
        }
        let reopened = Registry::open(root.path().join("registry.json")).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("20261001_000000").unwrap().status, DeploymentStatus::Deployed);
        let raw: Value = serde_json::from_slice(&std::fs::read(root.path().join("registry.json")).unwrap()).unwrap();
        assert_eq!(raw["schema_version"], json!(SCHEMA_VERSION));
    }

    fn legacy_record(version: Option<&str>, status: &str) -> Value {
        let mut rec = json!({
            "path": format!("/models/{}", version.unwrap_or("x")),
            "model_path": "/models/x/model.json",
            "deployment_status": status,
            "metadata": {
                "model_info": {"model_type": "isolation_forest", "created_at": "2026-09-01T00:00:00"},
                "training_info": {"feature_names": ["rssi"]},
                "evaluation_info": {"f1_score": 0.8}
            }
        });
        if let Some(v) = version { rec["version"] = json!(v); }
        rec
    }

    #[test]
    fn legacy_shapes_normalize_identically() {
        let list = json!([legacy_record(Some("v1"), "available"), legacy_record(Some("v2"), "deployed")]);
        let keyed = json!({"v1": legacy_record(None, "available"), "v2": legacy_record(None, "deployed")});
        let from_list = normalize(list).unwrap();
        let from_keyed = normalize(keyed).unwrap();
        assert_eq!(from_list.keys().collect::<Vec<_>>(), from_keyed.keys().collect::<Vec<_>>());
        for (a, b) in from_list.values().zip(from_keyed.values()) {
            assert_eq!(a.version, b.version);
            assert_eq!(a.status, b.status);
            assert_eq!(a.family, "isolation_forest");
            assert_eq!(a.metadata, b.metadata);
        }
    }

    #[test]
    fn keyed_records_take_their_key_as_version() {
        let mut record = legacy_record(None, "available");
        record["version"] = json!("v9");
        let models = normalize(json!({"v1": record})).unwrap();
        assert_eq!(models["v1"].version, "v1");
    }

    #[test]
    fn refresh_rereads_package_contents() {
        let root = tempfile::tempdir().unwrap();
        let reg = Registry::open(root.path().join("registry.json")).unwrap();
        let dir = write_package(root.path(), &PackageFixture::default());
        reg.register(ModelPackage::unreadable("20261019_120000", &dir)).unwrap();
        let fresh = ModelPackage::from_dir(&dir, DeploymentStatus::Imported).unwrap();
        let pkg = reg.refresh(fresh).unwrap();
        assert_eq!(pkg.status, DeploymentStatus::Failed);
        assert_eq!(pkg.family, "wifi-anomaly");
        assert_eq!(pkg.metadata.training_info.feature_names.len(), 3);
    }

    #[tokio::test]
    async fn blocking_mutations_persist() {
        let root = tempfile::tempdir().unwrap();
        let reg = std::sync::Arc::new(registry_with(root.path(), &["20261001_000000"]));
        let pkg = reg.with_blocking(|r| r.set_status("20261001_000000", DeploymentStatus::Deployed)).await.unwrap();
        assert_eq!(pkg.status, DeploymentStatus::Deployed);
        let reopened = Registry::open(root.path().join("registry.json")).unwrap();
        assert_eq!(reopened.get("20261001_000000").unwrap().status, DeploymentStatus::Deployed);
    }

    #[test]
    fn duplicate_deployed_versions_are_repaired_on_load() {
        let list = json!([legacy_record(Some("v1"), "deployed"), legacy_record(Some("v2"), "deployed")]);
        let models = normalize(list).unwrap();
        assert_eq!(models["v1"].status, DeploymentStatus::Available);
        assert_eq!(models["v2"].status, DeploymentStatus::Deployed);
    }

    #[test]
    fn removing_deployed_version_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let reg = registry_with(root.path(), &["20261001_000000", "20261002_000000"]);
        reg.set_status("20261002_000000", DeploymentStatus::Deployed).unwrap();
        assert!(reg.remove("20261002_000000").is_err());
        reg.remove("20261001_000000").unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn scan_registers_hand_placed_packages_once() {
        let root = tempfile::tempdir().unwrap();
        let models = root.path().join("models");
        write_package(&models, &PackageFixture::version("20261001_000000"));
        write_package(&models, &PackageFixture::version("20261002_000000"));
        std::fs::create_dir_all(models.join(".staging")).unwrap();
        let reg = Registry::open(root.path().join("registry.json")).unwrap();
        assert_eq!(reg.scan_local(&models).unwrap().len(), 2);
        assert!(reg.scan_local(&models).unwrap().is_empty());
        assert!(reg.list().iter().all(|p| p.status == DeploymentStatus::Imported));
    }

    #[test]
    fn concurrent_promotions_keep_single_deployed() {
        let root = tempfile::tempdir().unwrap();
        let versions: Vec<String> = (1..=6).map(|i| format!("2026100{i}_000000")).collect();
        let refs: Vec<&str> = versions.iter().map(String::as_str).collect();
        let reg = std::sync::Arc::new(registry_with(root.path(), &refs));
        let handles: Vec<_> = versions.iter().cloned().map(|v| {
            let reg = reg.clone();
            std::thread::spawn(move || { for _ in 0..5 { reg.set_status(&v, DeploymentStatus::Deployed).unwrap(); assert!(deployed_count(&reg, "wifi-anomaly") <= 1); } })
        }).collect();
        for h in handles { h.join().unwrap(); }
        assert_eq!(deployed_count(&reg, "wifi-anomaly"), 1);
    }
}
