//! Configuration module for invoicing-service.

use secrecy::SecretString;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct InvoicingServiceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub queues: QueueConfig,
    pub consumer: ConsumerConfig,
    pub retry: RetryConfig,
    pub softpymes: SoftpymesConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub cache_prefix: String,
    pub cache_ttl: Duration,
    pub events_channel: String,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub order_events: String,
    pub requests: String,
    pub responses: String,
    pub bulk_create: String,
    pub domain_events: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            order_events: "orders.events".to_string(),
            requests: "invoicing.requests".to_string(),
            responses: "invoicing.responses".to_string(),
            bulk_create: "invoicing.bulk_create".to_string(),
            domain_events: "invoicing.events".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub prefetch: usize,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub max_jitter: Duration,
    pub batch_size: i64,
    pub default_max_retries: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            max_jitter: Duration::from_secs(60),
            batch_size: 50,
            default_max_retries: crate::models::DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SoftpymesConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Referer header some Softpymes tenants require.
    pub referer: Option<String>,
    pub api_key: Option<SecretString>,
    pub api_secret: Option<SecretString>,
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl InvoicingServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let queues = QueueConfig::default();
        let retry = RetryConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "invoicing-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://redis:6379".to_string()),
                cache_prefix: env::var("INVOICING_CACHE_PREFIX")
                    .unwrap_or_else(|_| "probability:invoicing:config".to_string()),
                cache_ttl: Duration::from_secs(parse_or("INVOICING_CACHE_TTL_SECS", 3600)),
                events_channel: env::var("INVOICING_EVENTS_CHANNEL")
                    .unwrap_or_else(|_| "probability:invoicing:events".to_string()),
            },
            queues: QueueConfig {
                order_events: env::var("QUEUE_ORDER_EVENTS").unwrap_or(queues.order_events),
                requests: env::var("QUEUE_INVOICING_REQUESTS").unwrap_or(queues.requests),
                responses: env::var("QUEUE_INVOICING_RESPONSES").unwrap_or(queues.responses),
                bulk_create: env::var("QUEUE_INVOICING_BULK_CREATE").unwrap_or(queues.bulk_create),
                domain_events: env::var("QUEUE_INVOICING_EVENTS").unwrap_or(queues.domain_events),
            },
            consumer: ConsumerConfig {
                prefetch: parse_or("CONSUMER_PREFETCH", 8),
                poll_interval: Duration::from_millis(parse_or("CONSUMER_POLL_INTERVAL_MS", 1000)),
            },
            retry: RetryConfig {
                enabled: parse_or("RETRY_SWEEP_ENABLED", retry.enabled),
                interval: Duration::from_secs(parse_or("RETRY_SWEEP_INTERVAL_SECS", 300)),
                max_jitter: Duration::from_secs(parse_or("RETRY_SWEEP_JITTER_SECS", 60)),
                batch_size: parse_or("RETRY_SWEEP_BATCH_SIZE", retry.batch_size),
                default_max_retries: parse_or("INVOICING_MAX_RETRIES", retry.default_max_retries),
            },
            softpymes: SoftpymesConfig {
                base_url: env::var("SOFTPYMES_BASE_URL")
                    .unwrap_or_else(|_| "https://api-integracion.softpymes.com.co".to_string()),
                timeout: Duration::from_secs(parse_or("SOFTPYMES_TIMEOUT_SECS", 30)),
                referer: env::var("SOFTPYMES_REFERER").ok(),
                api_key: env::var("SOFTPYMES_API_KEY").ok().map(SecretString::new),
                api_secret: env::var("SOFTPYMES_API_SECRET").ok().map(SecretString::new),
            },
        })
    }
}
