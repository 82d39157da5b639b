//! Model lifecycle management: import, validate, version, deploy, roll back and monitor
//! anomaly-detection model packages for the inference agents.

pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod monitor;
pub mod package;
pub mod registry;
pub mod service;
pub mod transfer;
pub mod validation;

#[cfg(test)]
mod testutil;

pub use config::LifecycleConfig;
pub use error::{LifecycleError, Result, TransferError};
pub use manager::{ModelManager, ModelSummary, PredictResult};
pub use model::{AnomalyModel, StandardScaler};
pub use monitor::{DriftReport, DriftWarning, PerformanceMonitor, PerformanceSummary};
pub use package::{DeploymentStatus, ModelMetadata, ModelPackage};
pub use registry::Registry;
pub use service::{ImportTarget, LifecycleService, OperationResponse};
pub use transfer::{TransferRecord, TransferService, TransferStatus};
pub use validation::{check_feature_compatibility, FeatureCompatibility, ValidationEngine, ValidationResult};
