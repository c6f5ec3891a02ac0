use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use rigbook::delivery::LogDelivery;
use rigbook::engine::Engine;
use rigbook::hub::EventHub;
use rigbook::{jobs, seed};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("RIGBOOK_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    rigbook::observability::init(metrics_port);

    let data_dir = std::env::var("RIGBOOK_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let seed_file = std::env::var("RIGBOOK_SEED_FILE").ok();
    let seed_demo = std::env::var("RIGBOOK_SEED_DEMO").is_ok_and(|v| v == "1" || v == "true");
    let compact_threshold: u64 = std::env::var("RIGBOOK_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let no_show_every: u64 = std::env::var("RIGBOOK_NO_SHOW_EVERY_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300);
    let dispatch_every: u64 = std::env::var("RIGBOOK_DISPATCH_EVERY_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("rigbook.wal");

    let hub = Arc::new(EventHub::new());
    let engine = Arc::new(Engine::new(wal_path, hub)?);

    if let Some(path) = seed_file {
        let loaded = seed::load_from_path(PathBuf::from(&path).as_path())?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_millis() as i64;
        if seed::apply(&engine, loaded, now).await? {
            info!("seeded store from {path}");
        } else {
            info!("store not empty, seed file {path} ignored");
        }
    } else if seed_demo {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_millis() as i64;
        if seed::apply(&engine, seed::demo(), now).await? {
            info!("seeded store with demo dataset");
        } else {
            info!("store not empty, demo seed ignored");
        }
    }

    info!("rigbook engine ready");
    info!("  data_dir: {data_dir}");
    info!("  compact_threshold: {compact_threshold}");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let no_show_job = tokio::spawn(jobs::run_no_show_job(
        engine.clone(),
        Duration::from_secs(no_show_every),
    ));
    let dispatch_job = tokio::spawn(jobs::run_dispatch_job(
        engine.clone(),
        Arc::new(LogDelivery),
        Duration::from_secs(dispatch_every),
    ));
    let compactor_job = tokio::spawn(jobs::run_compactor(engine.clone(), compact_threshold));

    // Graceful shutdown on SIGTERM/ctrl-c
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;
    info!("shutdown signal received");

    no_show_job.abort();
    dispatch_job.abort();
    compactor_job.abort();

    // Fold the WAL down so the next start replays a minimal log
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final WAL compaction failed: {e}");
    }

    info!("rigbook stopped");
    Ok(())
}
