use clap::Parser;
use lib_notify::core::{DeliveryConfig, DispatcherConfig, OverflowPolicy};
use lib_notify::ingestors::{Backoff, DEFAULT_BINDINGS, RedisSourceConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "server_notify.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Scope-keyed WebSocket notification gateway", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "NOTIFY_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "NOTIFY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "NOTIFY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "NOTIFY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SERVICE_NAME", help = "Service name reported by /health.")]
    pub service_name: Option<String>,

    #[clap(long, env = "ENV", help = "Deployment environment reported by /health.")]
    pub env: Option<String>,

    #[clap(long, env = "NOTIFY_REDIS_URL", help = "Redis connection URL.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "NOTIFY_STREAM_KEY", help = "Redis stream carrying the events.")]
    pub stream_key: Option<String>,

    #[clap(long, env = "NOTIFY_CONSUMER_GROUP", help = "Consumer group of this gateway.")]
    pub consumer_group: Option<String>,

    #[clap(long, env = "NOTIFY_CONSUMER_NAME", help = "Consumer name inside the group. Defaults to the hostname.")]
    pub consumer_name: Option<String>,

    #[clap(
        long,
        env = "NOTIFY_DEAD_LETTER_STREAM",
        help = "Stream receiving rejected events. Empty disables dead-lettering.",
    )]
    pub dead_letter_stream: Option<String>,

    #[clap(
        long,
        env = "NOTIFY_BINDINGS",
        value_delimiter = ',',
        help = "Comma-separated routing-key patterns to consume (`*` one word, `#` any).",
    )]
    pub bindings: Option<Vec<String>>,

    #[clap(long, env = "NOTIFY_PREFETCH", help = "Entries fetched per stream read.")]
    pub prefetch: Option<usize>,

    #[clap(long, env = "NOTIFY_BLOCK_MS", help = "Milliseconds a stream read waits for new entries.")]
    pub block_ms: Option<u64>,

    #[clap(
        long,
        env = "NOTIFY_RECONNECT_BASE_DELAY_MS",
        help = "Base delay in milliseconds for upstream reconnect attempts.",
    )]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "NOTIFY_RECONNECT_STEP_MS", help = "Delay added per failed reconnect attempt, in milliseconds.")]
    pub reconnect_step_ms: Option<u64>,

    #[clap(
        long,
        env = "NOTIFY_RECONNECT_MAX_DELAY_MS",
        help = "Maximum delay in milliseconds for upstream reconnect attempts.",
    )]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(
        long,
        env = "NOTIFY_RECONNECT_JITTER_MS",
        help = "Random jitter in milliseconds added to each reconnect delay.",
    )]
    pub reconnect_jitter_ms: Option<u64>,

    #[clap(long, env = "NOTIFY_QUEUE_CAPACITY", help = "Outbound queue capacity per client.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "NOTIFY_OVERFLOW_POLICY", help = "What a full client queue drops: drop_newest or drop_oldest.")]
    pub overflow_policy: Option<String>,

    #[clap(
        long,
        env = "NOTIFY_MAX_CONSECUTIVE_DROPS",
        help = "Consecutive drops after which a slow client is disconnected.",
    )]
    pub max_consecutive_drops: Option<u32>,

    #[clap(long, env = "NOTIFY_WRITE_TIMEOUT_MS", help = "Upper bound in milliseconds on a single frame write.")]
    pub write_timeout_ms: Option<u64>,

    #[clap(
        long,
        env = "NOTIFY_DRAIN_GRACE_MS",
        help = "Milliseconds allowed to flush queued events on a graceful close.",
    )]
    pub drain_grace_ms: Option<u64>,

    #[clap(long, env = "NOTIFY_STATS_INTERVAL_SECONDS", help = "Interval in seconds between statistics log lines.")]
    pub stats_interval_seconds: Option<u64>,

    #[clap(
        long,
        env = "NOTIFY_ALLOW_ORIGINS",
        value_delimiter = ',',
        help = "Comma-separated CORS origins, `*` for any.",
    )]
    pub allow_origins: Option<Vec<String>>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            service_name: other.service_name.or(self.service_name),
            env: other.env.or(self.env),
            redis_url: other.redis_url.or(self.redis_url),
            stream_key: other.stream_key.or(self.stream_key),
            consumer_group: other.consumer_group.or(self.consumer_group),
            consumer_name: other.consumer_name.or(self.consumer_name),
            dead_letter_stream: other.dead_letter_stream.or(self.dead_letter_stream),
            bindings: other.bindings.or(self.bindings),
            prefetch: other.prefetch.or(self.prefetch),
            block_ms: other.block_ms.or(self.block_ms),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_step_ms: other.reconnect_step_ms.or(self.reconnect_step_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            reconnect_jitter_ms: other.reconnect_jitter_ms.or(self.reconnect_jitter_ms),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            overflow_policy: other.overflow_policy.or(self.overflow_policy),
            max_consecutive_drops: other.max_consecutive_drops.or(self.max_consecutive_drops),
            write_timeout_ms: other.write_timeout_ms.or(self.write_timeout_ms),
            drain_grace_ms: other.drain_grace_ms.or(self.drain_grace_ms),
            stats_interval_seconds: other.stats_interval_seconds.or(self.stats_interval_seconds),
            allow_origins: other.allow_origins.or(self.allow_origins),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        let source = RedisSourceConfig::default();
        let dispatcher = DispatcherConfig::default();
        let delivery = DeliveryConfig::default();
        Config {
            port: Some(8040),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            service_name: Some("notification-service".to_string()),
            env: Some("dev".to_string()),
            redis_url: Some(source.url),
            stream_key: Some(source.stream_key),
            consumer_group: Some(source.group),
            consumer_name: Some(source.consumer),
            dead_letter_stream: source.dead_letter_stream,
            bindings: Some(DEFAULT_BINDINGS.iter().map(|b| b.to_string()).collect()),
            prefetch: Some(source.prefetch),
            block_ms: Some(source.block_ms),
            reconnect_base_delay_ms: Some(source.backoff.base_ms),
            reconnect_step_ms: Some(source.backoff.step_ms),
            reconnect_max_delay_ms: Some(source.backoff.max_ms),
            reconnect_jitter_ms: Some(source.backoff.jitter_ms),
            queue_capacity: Some(dispatcher.queue_capacity),
            overflow_policy: Some("drop_newest".to_string()),
            max_consecutive_drops: Some(dispatcher.max_consecutive_drops),
            write_timeout_ms: Some(delivery.write_timeout_ms),
            drain_grace_ms: Some(delivery.drain_grace_ms),
            stats_interval_seconds: Some(60),
            allow_origins: Some(vec!["*".to_string()]),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8040)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn service_name(&self) -> &str {
        self.service_name.as_deref().unwrap_or("notification-service")
    }

    pub fn env(&self) -> &str {
        self.env.as_deref().unwrap_or("dev")
    }

    pub fn stats_interval_seconds(&self) -> u64 {
        self.stats_interval_seconds.unwrap_or(60).max(1)
    }

    pub fn allow_origins(&self) -> Vec<String> {
        self.allow_origins.clone().unwrap_or_else(|| vec!["*".to_string()])
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        match self.overflow_policy.as_deref().map(|p| p.trim().to_lowercase().replace('-', "_")) {
            Some(p) if p == "drop_oldest" => OverflowPolicy::DropOldest,
            Some(p) if p == "drop_newest" => OverflowPolicy::DropNewest,
            Some(other) => {
                log::warn!("Unknown overflow policy '{}'; using drop_newest.", other);
                OverflowPolicy::DropNewest
            }
            None => OverflowPolicy::DropNewest,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let defaults = DispatcherConfig::default();
        DispatcherConfig {
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity).max(1),
            overflow_policy: self.overflow_policy(),
            max_consecutive_drops: self.max_consecutive_drops.unwrap_or(defaults.max_consecutive_drops),
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        let defaults = DeliveryConfig::default();
        DeliveryConfig {
            write_timeout_ms: self.write_timeout_ms.unwrap_or(defaults.write_timeout_ms),
            drain_grace_ms: self.drain_grace_ms.unwrap_or(defaults.drain_grace_ms),
        }
    }

    pub fn source_config(&self) -> RedisSourceConfig {
        let defaults = RedisSourceConfig::default();
        let backoff = Backoff {
            base_ms: self.reconnect_base_delay_ms.unwrap_or(defaults.backoff.base_ms),
            step_ms: self.reconnect_step_ms.unwrap_or(defaults.backoff.step_ms),
            max_ms: self.reconnect_max_delay_ms.unwrap_or(defaults.backoff.max_ms),
            jitter_ms: self.reconnect_jitter_ms.unwrap_or(defaults.backoff.jitter_ms),
        };
        RedisSourceConfig {
            url: self.redis_url.clone().unwrap_or(defaults.url),
            stream_key: self.stream_key.clone().unwrap_or(defaults.stream_key),
            group: self.consumer_group.clone().unwrap_or(defaults.group),
            consumer: self.consumer_name.clone().unwrap_or(defaults.consumer),
            dead_letter_stream: self.dead_letter_stream.clone().filter(|s| !s.trim().is_empty()),
            bindings: self.bindings.clone().unwrap_or(defaults.bindings),
            prefetch: self.prefetch.unwrap_or(defaults.prefetch),
            block_ms: self.block_ms.unwrap_or(defaults.block_ms),
            backoff,
        }
    }

    /// Both TLS files, when configured and present on disk.
    pub fn tls_paths(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }
}

pub fn load_config() -> Config {
    // A missing .env is not an error.
    let _ = dotenvy::dotenv();
    resolve(Config::parse())
}

/// Layers built-in defaults, then the config file, then CLI arguments and
/// environment variables.
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config = current_config.merge(cli);

    // Fall back to the LetsEncrypt layout under $HOME; only used if the files exist.
    if current_config.tls_cert_path.is_none() || current_config.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            if current_config.tls_cert_path.is_none() {
                current_config.tls_cert_path = Some(letsencrypt_dir.join("fullchain.pem"));
            }
            if current_config.tls_key_path.is_none() {
                current_config.tls_key_path = Some(letsencrypt_dir.join("privkey.pem"));
            }
        } else {
            log::warn!("Could not determine home directory for default TLS paths.");
        }
    }

    current_config
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}
