use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;

use crate::queue::{QueueType, WrappedQueueConfig};
use crate::shutdown::ShutdownConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Queue served by the daemon
    #[serde(default)]
    pub queue: WrappedQueueConfig,
    /// Shape every pushed JSON item must match
    #[serde(default)]
    pub exemplar: Option<Value>,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub otel: OtelConfig,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
}

/// Connection used when the queue runs on the `redis` backend without an
/// explicit backend payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_redis_key")]
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// OTLP gRPC endpoint
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Trace sampling ratio (0.0-1.0)
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSettings {
    /// Seconds queues get to drain before they are terminated
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_seconds: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_key() -> String {
    "ara:queue".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-work-queue".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

fn default_shutdown_timeout() -> u64 {
    15 // 15 seconds
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        Self::defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // ARA_QUEUE__UNDERLYING, ARA_QUEUE__MAX_ATTEMPTS, ARA_REDIS__URL, etc.
            .add_source(
                Environment::with_prefix("ARA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("queue.underlying", QueueType::MEMORY)?
            .set_default("queue.name", "ara")?
            .set_default("queue.queue_length", 100)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("shutdown.timeout_seconds", 15)
    }

    /// Queue configuration with the backend payload filled in from the
    /// `redis` section when the queue runs on Redis and has none of its own.
    pub fn queue_config(&self) -> WrappedQueueConfig {
        let mut queue = self.queue.clone();
        if queue.underlying.as_str() == QueueType::REDIS && queue.config.is_null() {
            queue.config = json!({
                "url": self.redis.url,
                "key": self.redis.key,
                "name": queue.name,
            });
        }
        queue
    }

    pub fn shutdown_config(&self) -> ShutdownConfig {
        ShutdownConfig {
            drain_timeout: Duration::from_secs(self.shutdown.timeout_seconds),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key: default_redis_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_shutdown_timeout(),
        }
    }
}
