//! Predictor capability interface and the concrete adapters a `model.json` artifact can decode into.
//!
//! Artifacts are tagged by `"format"`; anything else fails to load (and therefore fails validation)
//! rather than failing at prediction time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Label returned for anomalous inputs; normal inputs are labelled `1`.
pub const ANOMALY_LABEL: i32 = -1;
pub const NORMAL_LABEL: i32 = 1;

pub trait AnomalyModel: Send + Sync + fmt::Debug {
    fn format(&self) -> &'static str;
    fn n_features(&self) -> usize;
    /// Higher means more anomalous.
    fn score_anomaly(&self, features: &[f64]) -> f64;
    fn predict(&self, features: &[f64]) -> i32;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZScoreModel {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    pub threshold: f64,
}

impl AnomalyModel for ZScoreModel {
    fn format(&self) -> &'static str { "zscore" }
    fn n_features(&self) -> usize { self.means.len() }

    fn score_anomaly(&self, features: &[f64]) -> f64 {
        if features.is_empty() { return 0.0; }
        let total: f64 = features.iter().zip(self.means.iter().zip(&self.stds))
            .map(|(x, (mean, std))| if *std <= 1e-9 { 0.0 } else { ((x - mean) / std).abs() })
            .sum();
        total / features.len() as f64
    }

    fn predict(&self, features: &[f64]) -> i32 {
        if self.score_anomaly(features) > self.threshold { ANOMALY_LABEL } else { NORMAL_LABEL }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    #[serde(default = "default_linear_threshold")]
    pub threshold: f64,
}

fn default_linear_threshold() -> f64 { 0.5 }

impl AnomalyModel for LinearModel {
    fn format(&self) -> &'static str { "linear" }
    fn n_features(&self) -> usize { self.weights.len() }

    fn score_anomaly(&self, features: &[f64]) -> f64 {
        let z: f64 = self.weights.iter().zip(features).map(|(w, x)| w * x).sum::<f64>() + self.bias;
        1.0 / (1.0 + (-z).exp())
    }

    fn predict(&self, features: &[f64]) -> i32 {
        if self.score_anomaly(features) > self.threshold { ANOMALY_LABEL } else { NORMAL_LABEL }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ModelArtifact {
    Zscore(ZScoreModel),
    Linear(LinearModel),
}

impl ModelArtifact {
    fn check_shape(&self) -> Result<(), LoadError> {
        match self {
            ModelArtifact::Zscore(m) if m.means.len() != m.stds.len() => Err(LoadError::Shape(format!("zscore means ({}) and stds ({}) differ in length", m.means.len(), m.stds.len()))),
            _ => Ok(()),
        }
    }

    pub fn into_model(self) -> Arc<dyn AnomalyModel> {
        match self {
            ModelArtifact::Zscore(m) => Arc::new(m),
            ModelArtifact::Linear(m) => Arc::new(m),
        }
    }
}

/// Standard scaler: `x' = (x - mean) / scale`, zero scale treated as 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn n_features(&self) -> usize { self.mean.len() }

    pub fn transform(&self, features: &[f64]) -> Vec<f64> {
        features.iter().enumerate().map(|(i, x)| {
            let mean = self.mean.get(i).copied().unwrap_or(0.0);
            let scale = self.scale.get(i).copied().filter(|s| s.abs() > 1e-12).unwrap_or(1.0);
            (x - mean) / scale
        }).collect()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("cannot decode {path}: {source}")]
    Decode { path: PathBuf, #[source] source: serde_json::Error },
    #[error("malformed artifact: {0}")]
    Shape(String),
    #[error("{what} expects {found} features but metadata declares {expected}")]
    DimensionMismatch { what: &'static str, expected: usize, found: usize },
    #[error("warm-up prediction produced a non-finite score")]
    NonFinite,
    #[error("warm-up prediction returned label {0}, expected -1 or 1")]
    BadLabel(i32),
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let bytes = std::fs::read(path).map_err(|source| LoadError::Read { path: path.to_path_buf(), source })?;
    serde_json::from_slice(&bytes).map_err(|source| LoadError::Decode { path: path.to_path_buf(), source })
}

/// A deserialized predictor plus its optional scaler, checked against the declared feature count.
#[derive(Debug, Clone)]
pub struct LoadedArtifacts {
    pub predictor: Arc<dyn AnomalyModel>,
    pub scaler: Option<StandardScaler>,
}

/// Shared loadability check: decode, check dimensions, run a zero-vector probe.
pub fn load_artifacts(artifact: &Path, scaler: Option<&Path>, n_features: usize) -> Result<LoadedArtifacts, LoadError> {
    let decoded: ModelArtifact = read_json(artifact)?;
    decoded.check_shape()?;
    let predictor = decoded.into_model();
    if predictor.n_features() != n_features {
        return Err(LoadError::DimensionMismatch { what: "model", expected: n_features, found: predictor.n_features() });
    }
    let scaler = match scaler {
        Some(path) => {
            let s: StandardScaler = read_json(path)?;
            if s.n_features() != n_features || s.scale.len() != n_features {
                return Err(LoadError::DimensionMismatch { what: "scaler", expected: n_features, found: s.n_features() });
            }
            Some(s)
        }
        None => None,
    };
    let zeros = vec![0.0; n_features];
    let input = scaler.as_ref().map(|s| s.transform(&zeros)).unwrap_or(zeros);
    warm_up(predictor.as_ref(), &input)?;
    Ok(LoadedArtifacts { predictor, scaler })
}

/// One prediction on a neutral input: the score must be finite and the label one of the two known ones.
fn warm_up(predictor: &dyn AnomalyModel, input: &[f64]) -> Result<(), LoadError> {
    if !predictor.score_anomaly(input).is_finite() { return Err(LoadError::NonFinite); }
    match predictor.predict(input) {
        ANOMALY_LABEL | NORMAL_LABEL => Ok(()),
        other => Err(LoadError::BadLabel(other)),
    }
}
