use std::sync::Arc;

use tracing::info;

use slotbook::clock::SystemClock;
use slotbook::collab::{LoggingCalendar, LoggingNotifier};
use slotbook::config::ServiceConfig;
use slotbook::service::Service;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServiceConfig::from_env();
    slotbook::observability::init(config.metrics_port);

    info!("slotbook starting");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  workers: {}", config.workers);
    info!(
        "  cancellation notice: {} min",
        config.engine.cancellation_notice_ms / 60_000
    );
    info!("  reminder policy: {:?}", config.engine.reminder_policy);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let service = Arc::new(Service::open(
        config,
        Arc::new(SystemClock),
        Arc::new(LoggingCalendar),
        Arc::new(LoggingNotifier),
    )?);
    service.start();

    // Graceful shutdown on SIGTERM/ctrl-c: stop background tasks, compact.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received");
    service.shutdown().await;
    if let Err(e) = service.compact().await {
        tracing::error!("final compaction failed: {e}");
    }
    info!("slotbook stopped");
    Ok(())
}
