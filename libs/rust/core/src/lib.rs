//! Core shared utilities for SwarmGuard model lifecycle services.

use anyhow::Result;
use tracing::info;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use axum::{routing::get, Router, response::IntoResponse, http::{header, StatusCode}};
use prometheus::{Encoder, TextEncoder};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);
static STATUS_FIELDS: Lazy<RwLock<serde_json::Map<String, serde_json::Value>>> = Lazy::new(|| RwLock::new(serde_json::Map::new()));

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }

/// Publish a field on the `/status` endpoint (e.g. the deployed model version).
pub fn publish_status(key: &str, value: impl Into<serde_json::Value>) {
    STATUS_FIELDS.write().insert(key.to_string(), value.into());
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

/// Install the global subscriber once. `RUST_LOG` drives filtering, `SWARM_JSON_LOG=1` switches to JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if env_flag("SWARM_JSON_LOG") {
            registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "lifecycle_core", service, "tracing initialized");
    Ok(())
}

/// Layered config: struct defaults, then the file named by `SWARM_CONFIG_FILE`, then `SWARM__SECTION__KEY` env vars.
pub fn load_config<T: DeserializeOwned>(service: &str) -> Result<T> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?;
    if let Ok(file) = std::env::var("SWARM_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("SWARM").separator("__").try_parsing(true));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

pub fn health_router() -> Router {
    Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)})) }))
        .route("/status", get(|| async {
            let mut body = STATUS_FIELDS.read().clone();
            body.insert("live".into(), NODE_LIVENESS.load(Ordering::SeqCst).into());
            body.insert("ready".into(), NODE_READINESS.load(Ordering::SeqCst).into());
            axum::Json(serde_json::Value::Object(body))
        }))
        .route("/metrics", get(metrics_handler))
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0,0,0,0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(?addr, "Health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router()).await {
            tracing::error!(error=?e, "Health server failed");
        }
    });
    Ok(())
}

async fn metrics_handler() -> axum::response::Response {
    let metric_families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

mod resilience;
pub use resilience::{retry_async, RetryConfig};
mod metrics_ext;
pub use metrics_ext::{LIFECYCLE_METRICS, LifecycleMetrics};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample { service_name: String }

    #[test]
    fn config_defaults_include_service_name() {
        let cfg: Sample = load_config("unit-test").unwrap();
        assert_eq!(cfg.service_name, "unit-test");
    }

    #[test]
    fn shutdown_flags_flip_readiness_and_liveness() {
        mark_ready();
        assert!(NODE_READINESS.load(Ordering::SeqCst));
        clear_ready();
        mark_not_live();
        assert!(!NODE_READINESS.load(Ordering::SeqCst));
        assert!(!NODE_LIVENESS.load(Ordering::SeqCst));
    }

    #[test]
    fn status_fields_are_published() {
        publish_status("deployed_version", "v1");
        assert_eq!(STATUS_FIELDS.read().get("deployed_version"), Some(&serde_json::json!("v1")));
    }
}
