use crate::notify_logic::state::AppState;
use lib_notify::core::OperationalSignal;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Logs slow-client signals as they happen and a stats line every `every`.
pub async fn run(app_state: AppState, every: Duration, shutdown: CancellationToken) {
    let mut signals = app_state.dispatcher.stats().subscribe();
    let mut stats_interval = interval(every);
    stats_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    stats_interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Monitor service received shutdown signal.");
                log_stats(&app_state);
                break;
            }
            signal = signals.recv() => match signal {
                Ok(signal) => log_signal(&signal),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Monitor fell behind; {} operational signals skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = stats_interval.tick() => log_stats(&app_state),
        }
    }
}

fn log_signal(signal: &OperationalSignal) {
    match signal {
        OperationalSignal::Degraded { connection_id, scope } => {
            log::warn!("Client {} in {} is not keeping up; dropping events", connection_id, scope);
        }
        OperationalSignal::ForcedClose {
            connection_id,
            scope,
            consecutive_drops,
        } => {
            log::warn!(
                "Client {} in {} disconnected after {} consecutive drops",
                connection_id,
                scope,
                consecutive_drops
            );
        }
    }
}

fn log_stats(app_state: &AppState) {
    let stats = app_state.stats();
    let dispatch = &stats.dispatch;
    log::info!(
        "Stats: connections={} scopes={} received={} unsubscribed={} enqueued={} dropped={} forced_closed={} requeued={}",
        stats.connections,
        stats.scopes,
        dispatch.events_received,
        dispatch.events_without_subscribers,
        dispatch.deliveries_enqueued,
        dispatch.deliveries_dropped,
        dispatch.connections_force_closed,
        dispatch.events_requeued
    );
    for scope in dispatch.dropped_by_scope.iter().take(5) {
        log::info!(
            "  dropped {} events in {}/{}",
            scope.dropped,
            scope.tenant_id,
            scope.workspace_id
        );
    }
}
