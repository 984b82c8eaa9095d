use serde::Deserialize;

fn env_parse<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>()))
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Coalescing window for play-progress events, in seconds (default: 60)
    pub coalescing_window_seconds: u64,

    /// Maximum delivery attempts before a task is dead-lettered (default: 5)
    pub max_retry_attempts: u32,

    /// Base delay for exponential retry backoff, in milliseconds (default: 500)
    pub retry_backoff_base_ms: u64,

    /// Cap on the retry backoff delay, in milliseconds (default: 60000)
    pub retry_backoff_cap_ms: u64,

    /// Maximum concurrent sends per push platform (default: 32)
    pub per_platform_concurrency: usize,

    /// Fraction of admission capacity reserved for critical traffic (default: 0.2)
    pub critical_reserved_capacity_fraction: f64,

    /// Sustained admission rate for normal-priority emissions, events/sec (default: 1000)
    pub normal_events_per_second: u64,

    /// Steady drain rate for recommendation fan-out, events/sec (default: 500)
    pub recommendation_drain_per_second: u64,

    /// Maximum concurrent delivery sends across all platforms (default: 4 * per_platform)
    pub worker_count: usize,

    /// Tasks a worker claims from its queue per wakeup (default: 10)
    pub worker_batch_size: usize,

    /// Retained dead-letter entries (default: 10000)
    pub dead_letter_capacity: usize,

    /// Device registry shard count (default: 16)
    pub registry_shards: usize,

    /// API listen address (default: 0.0.0.0:3000)
    pub bind_addr: String,

    /// Push webhook endpoint; when unset, deliveries are logged and acked
    pub webhook_endpoint: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let per_platform_concurrency: usize = env_parse("PER_PLATFORM_CONCURRENCY", "32")?;

        Ok(Self {
            coalescing_window_seconds: env_parse("COALESCING_WINDOW_SECONDS", "60")?,
            max_retry_attempts: env_parse("MAX_RETRY_ATTEMPTS", "5")?,
            retry_backoff_base_ms: env_parse("RETRY_BACKOFF_BASE_MS", "500")?,
            retry_backoff_cap_ms: env_parse("RETRY_BACKOFF_CAP_MS", "60000")?,
            per_platform_concurrency,
            critical_reserved_capacity_fraction: env_parse(
                "CRITICAL_RESERVED_CAPACITY_FRACTION",
                "0.2",
            )?,
            normal_events_per_second: env_parse("NORMAL_EVENTS_PER_SECOND", "1000")?,
            recommendation_drain_per_second: env_parse("RECOMMENDATION_DRAIN_PER_SECOND", "500")?,
            worker_count: std::env::var("WORKER_COUNT")
                .ok()
                .map(|v| {
                    v.parse()
                        .map_err(|_| anyhow::anyhow!("WORKER_COUNT must be a valid usize"))
                })
                .transpose()?
                .unwrap_or(per_platform_concurrency * 4),
            worker_batch_size: env_parse("WORKER_BATCH_SIZE", "10")?,
            dead_letter_capacity: env_parse("DEAD_LETTER_CAPACITY", "10000")?,
            registry_shards: env_parse("REGISTRY_SHARDS", "16")?,
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            webhook_endpoint: std::env::var("WEBHOOK_ENDPOINT").ok(),
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            coalescing_window_seconds: 60,
            max_retry_attempts: 5,
            retry_backoff_base_ms: 500,
            retry_backoff_cap_ms: 60_000,
            per_platform_concurrency: 32,
            critical_reserved_capacity_fraction: 0.2,
            normal_events_per_second: 1_000,
            recommendation_drain_per_second: 500,
            worker_count: 128,
            worker_batch_size: 10,
            dead_letter_capacity: 10_000,
            registry_shards: 16,
            bind_addr: "0.0.0.0:3000".to_string(),
            webhook_endpoint: None,
        }
    }
}
