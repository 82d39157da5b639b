//! Model lifecycle metrics registered in the default prometheus registry.
//!
//! Grouped so the health server's `/metrics` endpoint exposes them without extra wiring.

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};

pub struct LifecycleMetrics {
    pub predictions_total: IntCounterVec,
    pub prediction_latency_ms: HistogramVec,
    pub deployments_total: IntCounterVec,
    pub imports_total: IntCounterVec,
    pub validations_total: IntCounterVec,
    pub drift_warnings_total: IntCounterVec,
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("static metric definition");
    // duplicate registration only happens when two registries share a process; keep the local handle either way
    let _ = prometheus::default_registry().register(Box::new(c.clone()));
    c
}

fn histogram_vec(name: &str, help: &str, labels: &[&str], buckets: Vec<f64>) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels).expect("static metric definition");
    let _ = prometheus::default_registry().register(Box::new(h.clone()));
    h
}

pub static LIFECYCLE_METRICS: Lazy<LifecycleMetrics> = Lazy::new(|| {
    LifecycleMetrics {
        predictions_total: counter_vec("swarm_model_predictions_total", "Predictions served, by model version and verdict", &["version", "verdict"]),
        prediction_latency_ms: histogram_vec("swarm_model_prediction_latency_ms", "Per-call inference latency (ms)", &["version"], vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0]),
        deployments_total: counter_vec("swarm_model_deployments_total", "Deploy/rollback/undeploy attempts by outcome", &["operation", "outcome"]),
        imports_total: counter_vec("swarm_model_imports_total", "Transfer imports by terminal status", &["status"]),
        validations_total: counter_vec("swarm_model_validations_total", "Package validations by verdict", &["verdict"]),
        drift_warnings_total: counter_vec("swarm_model_drift_warnings_total", "Drift warnings raised for deployed versions", &["version"]),
    }
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_default_registry() {
        LIFECYCLE_METRICS.imports_total.with_label_values(&["completed"]).inc();
        let names: Vec<String> = prometheus::default_registry().gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.iter().any(|n| n == "swarm_model_imports_total"));
    }
}
