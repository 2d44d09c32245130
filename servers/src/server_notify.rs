use anyhow::Result;
use lib_notify::core::CloseReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod notify_logic;
use notify_logic::{config, downstream, logger, monitor, state, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;
    log::info!(
        "Starting {} ({}) on port {}",
        config.service_name(),
        config.env(),
        config.port()
    );

    let app_state = state::AppState::new(&config);
    let shutdown = CancellationToken::new();
    let monitor_stop = CancellationToken::new();
    let server_handle = axum_server::Handle::new();

    let upstream_task = tokio::spawn(upstream::run(
        config.clone(),
        Arc::clone(&app_state.dispatcher),
        shutdown.clone(),
    ));
    let downstream_task = tokio::spawn(downstream::run(
        config.clone(),
        app_state.clone(),
        server_handle.clone(),
        shutdown.clone(),
    ));
    let monitor_task = tokio::spawn(monitor::run(
        app_state.clone(),
        Duration::from_secs(config.stats_interval_seconds()),
        monitor_stop.clone(),
    ));

    tokio::select! {
        _ = shutdown_signal() => log::info!("Shutdown signal received, initiating shutdown."),
        _ = shutdown.cancelled() => log::warn!("A component failed, initiating shutdown."),
    }
    shutdown.cancel();

    // 1. Stop consuming; the in-flight event is settled, the rest stays upstream.
    let upstream_result = upstream_task.await?;

    // 2. Ask every client to close, flushing what is already queued.
    let closing = app_state.registry.close_all(CloseReason::Shutdown);
    log::info!("Closing {} client connections.", closing);

    // 3. Wait for the delivery workers, bounded by the drain budget.
    app_state.workers.close();
    let delivery = &app_state.delivery;
    let budget = delivery.drain_grace() + delivery.write_timeout() + Duration::from_secs(1);
    if tokio::time::timeout(budget, app_state.workers.wait()).await.is_err() {
        log::warn!(
            "{} delivery workers still running after {:?}; abandoning them.",
            app_state.workers.len(),
            budget
        );
    }

    // 4. Stop the HTTP server.
    server_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    let downstream_result = downstream_task.await?;

    monitor_stop.cancel();
    let _ = monitor_task.await;

    log::info!("Shutdown complete.");
    upstream_result.and(downstream_result)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
