use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::package::DeploymentStatus;

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

const ENOSPC: i32 = 28;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source unreachable: {path}")]
    SourceUnreachable { path: PathBuf },
    #[error("not a model package directory: {path}")]
    NotAPackage { path: PathBuf },
    #[error("copy failed for {path}: {source}")]
    CopyFailed { path: PathBuf, #[source] source: io::Error },
    #[error("local storage full while writing {path}")]
    StorageFull { path: PathBuf },
}

impl TransferError {
    pub(crate) fn from_io(path: &Path, source: io::Error) -> Self {
        if source.raw_os_error() == Some(ENOSPC) {
            return TransferError::StorageFull { path: path.to_path_buf() };
        }
        TransferError::CopyFailed { path: path.to_path_buf(), source }
    }

    /// Missing files and permission problems will not fix themselves on retry.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            TransferError::CopyFailed { source, .. } => !matches!(source.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation failed for {version}: {reason}")]
    Validation { version: String, reason: String },
    #[error("no model loaded; load or deploy a version first")]
    NotLoaded,
    #[error("a deployment change is already in flight for family {family}")]
    DeploymentConflict { family: String },
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("unknown model version {0}")]
    UnknownVersion(String),
    #[error("version {version} cannot move from {from} to {to}")]
    InvalidTransition { version: String, from: DeploymentStatus, to: DeploymentStatus },
    #[error("registry error: {0}")]
    Registry(String),
    #[error("i/o error at {path}: {source}")]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("malformed {what}: {source}")]
    Parse { what: String, #[source] source: serde_json::Error },
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl LifecycleError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self { LifecycleError::Io { path: path.to_path_buf(), source } }

    /// Stable code surfaced to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::Validation { .. } => "VALIDATION_ERROR",
            LifecycleError::NotLoaded => "NOT_LOADED",
            LifecycleError::DeploymentConflict { .. } => "DEPLOYMENT_CONFLICT",
            LifecycleError::Transfer(_) => "TRANSFER_ERROR",
            LifecycleError::UnknownVersion(_) => "UNKNOWN_VERSION",
            LifecycleError::InvalidTransition { .. } => "INVALID_TRANSITION",
            LifecycleError::Registry(_) | LifecycleError::Io { .. } | LifecycleError::Parse { .. } => "REGISTRY_ERROR",
            LifecycleError::Task(_) => "INTERNAL_ERROR",
        }
    }

    /// Conflicts are the only errors a caller should simply retry.
    pub fn is_retryable(&self) -> bool { matches!(self, LifecycleError::DeploymentConflict { .. }) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_full_maps_to_storage_full() {
        let err = TransferError::from_io(Path::new("/models/v1"), io::Error::from_raw_os_error(ENOSPC));
        assert!(matches!(err, TransferError::StorageFull { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(LifecycleError::NotLoaded.code(), "NOT_LOADED");
        assert_eq!(LifecycleError::DeploymentConflict { family: "wifi".into() }.code(), "DEPLOYMENT_CONFLICT");
        let transfer: LifecycleError = TransferError::SourceUnreachable { path: "/nope".into() }.into();
        assert_eq!(transfer.code(), "TRANSFER_ERROR");
        assert!(LifecycleError::DeploymentConflict { family: "wifi".into() }.is_retryable());
    }
}
