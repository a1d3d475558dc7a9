use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CONSUMER_TAG: &str = "notifications-consumer";

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string for the notification store
    pub redis_url: String,

    /// Redis connection string for the delay-queue broker (defaults to `redis_url`)
    pub broker_url: String,

    /// HTTP port for the API server
    pub port: u16,

    /// Longest delay the broker expresses natively; later records wait for the reconciler
    pub delay_horizon_secs: u64,

    /// Default expiry of the delayed channel
    pub delayed_queue_ttl_secs: u64,

    /// Reconciler tick interval in seconds (default: 5)
    pub reconciler_tick_secs: u64,

    /// Records overdue by more than this are skipped by the reconciler (default: 24h)
    pub reconciler_lookback_secs: u64,

    /// Number of processor workers consuming the ready channel
    pub worker_count: usize,

    /// Messages fetched ahead of the workers
    pub worker_prefetch: usize,

    /// Retry budget applied when a request does not specify one
    pub default_max_retries: u32,

    /// Base delay of the processor's inner retry loop in milliseconds
    pub retry_base_delay_ms: u64,

    /// Webhook endpoint for deliveries; the log channel is used when unset
    pub webhook_url: Option<String>,

    /// Names this process's unacked list on the broker; must differ between worker instances
    pub consumer_tag: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        let config = Self {
            broker_url: std::env::var("BROKER_URL").unwrap_or_else(|_| redis_url.clone()),
            redis_url,
            port: parse_var("PORT", 8080)?,
            delay_horizon_secs: parse_var("DELAY_HORIZON_SECS", 60)?,
            delayed_queue_ttl_secs: parse_var("DELAYED_QUEUE_TTL_SECS", 60)?,
            reconciler_tick_secs: parse_var("RECONCILER_TICK_SECS", 5)?,
            reconciler_lookback_secs: parse_var("RECONCILER_LOOKBACK_SECS", 86_400)?,
            worker_count: parse_var("WORKER_COUNT", 3)?,
            worker_prefetch: parse_var("WORKER_PREFETCH", 10)?,
            default_max_retries: parse_var("DEFAULT_MAX_RETRIES", 3)?,
            retry_base_delay_ms: parse_var("RETRY_BASE_DELAY_MS", 1000)?,
            webhook_url: std::env::var("WEBHOOK_URL").ok().filter(|url| !url.is_empty()),
            consumer_tag: ["CONSUMER_TAG", "HOSTNAME"]
                .iter()
                .filter_map(|key| std::env::var(key).ok())
                .map(|tag| tag.trim().to_string())
                .find(|tag| !tag.is_empty())
                .unwrap_or_else(|| DEFAULT_CONSUMER_TAG.to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the broker cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.delay_horizon_secs > self.delayed_queue_ttl_secs {
            anyhow::bail!(
                "DELAY_HORIZON_SECS ({}) must not exceed DELAYED_QUEUE_TTL_SECS ({})",
                self.delay_horizon_secs,
                self.delayed_queue_ttl_secs
            );
        }
        Ok(())
    }

    pub fn delay_horizon(&self) -> Duration {
        Duration::from_secs(self.delay_horizon_secs)
    }

    pub fn delayed_queue_ttl(&self) -> Duration {
        Duration::from_secs(self.delayed_queue_ttl_secs)
    }

    pub fn reconciler_tick(&self) -> Duration {
        Duration::from_secs(self.reconciler_tick_secs)
    }

    pub fn reconciler_lookback(&self) -> Duration {
        Duration::from_secs(self.reconciler_lookback_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            broker_url: "redis://localhost:6379".to_string(),
            port: 8080,
            delay_horizon_secs: 60,
            delayed_queue_ttl_secs: 60,
            reconciler_tick_secs: 5,
            reconciler_lookback_secs: 86_400,
            worker_count: 3,
            worker_prefetch: 10,
            default_max_retries: 3,
            retry_base_delay_ms: 1000,
            webhook_url: None,
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_default_when_unset() {
        let value: u64 = parse_var("COURIER_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_default_durations() {
        let config = AppConfig::default();
        assert_eq!(config.delay_horizon(), Duration::from_secs(60));
        assert_eq!(config.reconciler_tick(), Duration::from_secs(5));
        assert_eq!(config.reconciler_lookback(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.retry_base_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_horizon_beyond_ttl() {
        let config = AppConfig {
            delay_horizon_secs: 120,
            delayed_queue_ttl_secs: 60,
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("DELAY_HORIZON_SECS"));

        let config = AppConfig {
            delay_horizon_secs: 60,
            ..config
        };
        assert!(config.validate().is_ok());
        assert!(AppConfig::default().validate().is_ok());
    }
}
