//! Per-version inference telemetry and a relative drift heuristic.
//!
//! Drift compares the most recent window of samples against the window before it. Each indicator
//! is `|recent_mean - older_mean| / |older_mean|` (0 when the older mean is 0), and the drift score
//! is their arithmetic mean. This is an approximation for operators, not a distributional test.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use tracing::debug;

use crate::error::{LifecycleError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub buffer_capacity: usize,
}

impl Default for PerformanceConfig { fn default() -> Self { Self { buffer_capacity: 1000 } } }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub threshold: f64,
    pub window: usize,
    pub min_samples: usize,
    pub check_interval_secs: u64,
}

impl Default for DriftConfig { fn default() -> Self { Self { threshold: 0.1, window: 10, min_samples: 20, check_interval_secs: 300 } } }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub inference_time_ms: f64,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftIndicators {
    pub anomaly_rate_change: f64,
    pub score_change: f64,
    pub inference_time_change: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub version: String,
    pub drift_detected: bool,
    pub drift_score: f64,
    pub indicators: DriftIndicators,
    pub threshold: f64,
    pub sample_count: usize,
    pub insufficient_data: bool,
    pub checked_at: DateTime<Utc>,
}

/// Operator signal raised when drift crosses the threshold. Never triggers a rollback by itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftWarning {
    pub version: String,
    pub drift_score: f64,
    pub threshold: f64,
    pub indicators: DriftIndicators,
}

impl DriftReport {
    pub fn warning(&self) -> Option<DriftWarning> {
        self.drift_detected.then(|| DriftWarning { version: self.version.clone(), drift_score: self.drift_score, threshold: self.threshold, indicators: self.indicators })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub version: String,
    pub sample_count: usize,
    pub mean_inference_ms: f64,
    pub p95_inference_ms: f64,
    pub anomaly_rate: f64,
    pub mean_anomaly_score: f64,
}

pub struct PerformanceMonitor {
    capacity: usize,
    drift: DriftConfig,
    buffers: RwLock<HashMap<String, VecDeque<PerformanceSample>>>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

fn relative_change(recent: f64, older: f64) -> f64 {
    if older == 0.0 { 0.0 } else { (recent - older).abs() / older.abs() }
}

impl PerformanceMonitor {
    pub fn new(perf: PerformanceConfig, drift: DriftConfig) -> Self {
        Self { capacity: perf.buffer_capacity.max(1), drift, buffers: RwLock::new(HashMap::new()) }
    }

    pub fn drift_config(&self) -> &DriftConfig { &self.drift }

    pub fn record(&self, version: &str, inference_time_ms: f64, anomaly_score: f64, is_anomaly: bool) {
        let sample = PerformanceSample { inference_time_ms, anomaly_score, is_anomaly, timestamp: Utc::now() };
        let mut buffers = self.buffers.write();
        let buf = buffers.entry(version.to_string()).or_insert_with(|| VecDeque::with_capacity(self.capacity.min(1024)));
        if buf.len() == self.capacity { buf.pop_front(); }
        buf.push_back(sample);
    }

    pub fn sample_count(&self, version: &str) -> usize { self.buffers.read().get(version).map(VecDeque::len).unwrap_or(0) }

    /// Copy of the newest `n` samples, oldest first.
    fn tail(&self, version: &str, n: usize) -> Vec<PerformanceSample> {
        let buffers = self.buffers.read();
        match buffers.get(version) {
            Some(buf) => buf.iter().skip(buf.len().saturating_sub(n)).copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn check_drift(&self, version: &str) -> DriftReport {
        let window = self.drift.window.max(1);
        let needed = self.drift.min_samples.max(2 * window);
        let total = self.sample_count(version);
        let snapshot = self.tail(version, 2 * window);
        let mut report = DriftReport {
            version: version.to_string(),
            drift_detected: false,
            drift_score: 0.0,
            indicators: DriftIndicators::default(),
            threshold: self.drift.threshold,
            sample_count: total,
            insufficient_data: true,
            checked_at: Utc::now(),
        };
        if total < needed || snapshot.len() < 2 * window {
            debug!(version, samples = total, needed, "not enough samples for drift check");
            return report;
        }
        let (older, recent) = snapshot.split_at(window);
        let rate = |s: &[PerformanceSample]| mean(s.iter().map(|x| if x.is_anomaly { 1.0 } else { 0.0 }));
        let score = |s: &[PerformanceSample]| mean(s.iter().map(|x| x.anomaly_score));
        let time = |s: &[PerformanceSample]| mean(s.iter().map(|x| x.inference_time_ms));
        let indicators = DriftIndicators {
            anomaly_rate_change: relative_change(rate(recent), rate(older)),
            score_change: relative_change(score(recent), score(older)),
            inference_time_change: relative_change(time(recent), time(older)),
        };
        report.drift_score = (indicators.anomaly_rate_change + indicators.score_change + indicators.inference_time_change) / 3.0;
        report.drift_detected = report.drift_score > self.drift.threshold;
        report.indicators = indicators;
        report.insufficient_data = false;
        report
    }

    pub fn summary(&self, version: &str) -> Option<PerformanceSummary> {
        let samples = self.tail(version, usize::MAX);
        if samples.is_empty() { return None; }
        let mut times: Vec<f64> = samples.iter().map(|s| s.inference_time_ms).collect();
        times.sort_by(|a, b| a.total_cmp(b));
        let p95_idx = ((times.len() as f64 * 0.95).ceil() as usize).saturating_sub(1).min(times.len() - 1);
        Some(PerformanceSummary {
            version: version.to_string(),
            sample_count: samples.len(),
            mean_inference_ms: mean(times.iter().copied()),
            p95_inference_ms: times[p95_idx],
            anomaly_rate: mean(samples.iter().map(|s| if s.is_anomaly { 1.0 } else { 0.0 })),
            mean_anomaly_score: mean(samples.iter().map(|s| s.anomaly_score)),
        })
    }

    pub fn versions(&self) -> Vec<String> {
        let mut v: Vec<String> = self.buffers.read().keys().cloned().collect();
        v.sort();
        v
    }

    pub fn clear(&self, version: &str) -> usize { self.buffers.write().remove(version).map(|b| b.len()).unwrap_or(0) }

    /// Write every buffer to `path` as JSON. Buffers are otherwise process-lifetime only.
    pub fn flush(&self, path: &Path) -> Result<()> {
        let snapshot: BTreeMap<String, Vec<PerformanceSample>> = self.buffers.read().iter().map(|(k, v)| (k.clone(), v.iter().copied().collect())).collect();
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|source| LifecycleError::Parse { what: "performance snapshot".into(), source })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LifecycleError::io(parent, e))?;
        }
        std::fs::write(path, bytes).map_err(|e| LifecycleError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> PerformanceMonitor { PerformanceMonitor::new(PerformanceConfig::default(), DriftConfig::default()) }

    #[test]
    fn fewer_than_twenty_samples_never_drift() {
        let m = monitor();
        for i in 0..19 { m.record("v1", 1.0 + i as f64 * 10.0, i as f64, i % 2 == 0); }
        let r = m.check_drift("v1");
        assert!(!r.drift_detected);
        assert!(r.insufficient_data);
        assert_eq!(r.indicators, DriftIndicators::default());
    }

    #[test]
    fn unknown_version_is_insufficient_data() {
        let r = monitor().check_drift("never-seen");
        assert!(!r.drift_detected);
        assert_eq!(r.sample_count, 0);
    }

    #[test]
    fn zero_older_anomaly_rate_contributes_nothing() {
        let m = monitor();
        for _ in 0..10 { m.record("v1", 2.0, 0.5, false); }
        for _ in 0..10 { m.record("v1", 2.0, 0.5, true); }
        let r = m.check_drift("v1");
        assert!(!r.insufficient_data);
        assert_eq!(r.indicators.anomaly_rate_change, 0.0);
        assert_eq!(r.indicators.score_change, 0.0);
        assert_eq!(r.drift_score, 0.0);
        assert!(!r.drift_detected);
    }

    #[test]
    fn latency_and_score_shift_is_detected() {
        let m = monitor();
        for _ in 0..10 { m.record("v1", 2.0, 0.4, true); }
        for _ in 0..10 { m.record("v1", 4.0, 0.6, true); }
        let r = m.check_drift("v1");
        assert!((r.indicators.inference_time_change - 1.0).abs() < 1e-9);
        assert!((r.indicators.score_change - 0.5).abs() < 1e-9);
        assert_eq!(r.indicators.anomaly_rate_change, 0.0);
        assert!((r.drift_score - 0.5).abs() < 1e-9);
        assert!(r.drift_detected);
        assert_eq!(r.warning().unwrap().version, "v1");
    }

    #[test]
    fn only_the_last_two_windows_count() {
        let m = monitor();
        for _ in 0..30 { m.record("v1", 100.0, 9.0, true); }
        for _ in 0..20 { m.record("v1", 1.0, 0.1, false); }
        assert!(!m.check_drift("v1").drift_detected);
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let m = PerformanceMonitor::new(PerformanceConfig { buffer_capacity: 5 }, DriftConfig::default());
        for i in 0..8 { m.record("v1", i as f64, 0.0, false); }
        assert_eq!(m.sample_count("v1"), 5);
        let s = m.summary("v1").unwrap();
        assert_eq!(s.mean_inference_ms, 5.0);
        assert_eq!(s.p95_inference_ms, 7.0);
    }

    #[test]
    fn flush_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor();
        m.record("v1", 1.0, 0.2, false);
        let path = dir.path().join("perf/snapshot.json");
        m.flush(&path).unwrap();
        let back: BTreeMap<String, Vec<PerformanceSample>> = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(back["v1"].len(), 1);
        assert_eq!(m.clear("v1"), 1);
        assert!(m.versions().is_empty());
    }
}
