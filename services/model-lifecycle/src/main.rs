use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};

use lifecycle_core::{clear_ready, init_tracing, mark_not_live, mark_ready, start_health_server};
use model_lifecycle::{LifecycleConfig, LifecycleService};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = LifecycleConfig::load()?;
    init_tracing(&cfg.service_name)?;
    info!(?cfg, "config loaded");

    start_health_server(cfg.health_port).await?;

    let service = LifecycleService::from_config(&cfg)?;
    let manager = service.manager().clone();
    let added = manager.registry().scan_local(manager.models_dir())?;
    if !added.is_empty() { info!(?added, "registered packages from local storage"); }
    match manager.restore_deployed().await? {
        Some(version) => info!(version, "serving deployed model"),
        None => warn!("no deployed model; predictions fail until one is deployed"),
    }

    let watcher = manager.clone().spawn_drift_watch();
    mark_ready();
    info!("service ready");

    signal::ctrl_c().await?;
    clear_ready();
    watcher.abort();
    if let Some(path) = &cfg.storage.performance_flush {
        if let Err(e) = manager.monitor().flush(path) { warn!(error = %e, "performance flush failed"); }
    }
    mark_not_live();
    info!("shutdown");
    Ok(())
}
