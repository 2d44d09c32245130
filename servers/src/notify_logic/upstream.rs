use crate::notify_logic::config::Config;
use lib_notify::core::Dispatcher;
use lib_notify::ingestors::RedisStreamSource;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Feeds the dispatcher from the Redis stream until `shutdown` fires. A fatal
/// source error cancels `shutdown` so the whole gateway stops.
pub async fn run(config: Config, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let source_config = config.source_config();
    log::info!(
        "Connecting to Redis stream {} at {}",
        source_config.stream_key,
        source_config.url
    );
    let mut source = RedisStreamSource::new(source_config);

    match dispatcher.run(&mut source, shutdown.clone()).await {
        Ok(()) => {
            log::info!("Upstream consumer stopped.");
            Ok(())
        }
        Err(e) => {
            log::error!("Upstream consumer failed: {}", e);
            shutdown.cancel();
            Err(e.into())
        }
    }
}
