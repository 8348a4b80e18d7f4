use crate::services::gateway::RetryConfig;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum undelivered events buffered per suspended subscriber.
    pub replay_capacity: usize,
    /// Grace window within which a suspended subscriber may reconnect and
    /// replay its buffer. Past it, a full resync is required.
    pub replay_window: Duration,
    /// Default page size for message listing.
    pub page_size: usize,
    /// Retry policy applied by the API gateway client.
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replay_capacity: 500,
            replay_window: Duration::from_secs(30),
            page_size: 50,
            retry: RetryConfig::default(),
        }
    }
}

/// Hard cap on listing pages, matching what history queries tolerate.
pub const MAX_PAGE_SIZE: usize = 200;

impl Config {
    fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
        env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    /// All variables are optional; malformed values fall back to defaults.
    pub fn from_env() -> Self {
        dotenv().ok();
        let defaults = Self::default();

        let replay_capacity =
            Self::parse_var("CHANNEL_REPLAY_CAPACITY", defaults.replay_capacity);
        let replay_window_secs = Self::parse_var(
            "CHANNEL_REPLAY_WINDOW_SECS",
            defaults.replay_window.as_secs(),
        );
        let page_size =
            Self::parse_var("MESSAGE_PAGE_SIZE", defaults.page_size).min(MAX_PAGE_SIZE);

        let retry = RetryConfig {
            max_retries: Self::parse_var("GATEWAY_MAX_RETRIES", defaults.retry.max_retries),
            initial_backoff: Duration::from_millis(Self::parse_var(
                "GATEWAY_INITIAL_BACKOFF_MS",
                defaults.retry.initial_backoff.as_millis() as u64,
            )),
            max_backoff: Duration::from_millis(Self::parse_var(
                "GATEWAY_MAX_BACKOFF_MS",
                defaults.retry.max_backoff.as_millis() as u64,
            )),
            ..defaults.retry
        };

        Self {
            replay_capacity,
            replay_window: Duration::from_secs(replay_window_secs),
            page_size,
            retry,
        }
    }
}
