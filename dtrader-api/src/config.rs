//! Server configuration from environment variables

use std::env;
use std::time::Duration;

use dtrader_services::CoordinatorConfig;
use url::Url;

const DEFAULT_PORT: u16 = 8080;

/// Configuration for the bridge server
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub coordinator: CoordinatorConfig,
}

impl AppConfig {
    /// Load configuration from the process environment
    ///
    /// Reads:
    /// - SERVER_PORT: listen port (8080)
    /// - GATEIO_WS_URLS: comma separated endpoints, tried in order
    /// - GATEIO_CHANNEL_NAMESPACE: channel prefix (spot)
    /// - GATEIO_PING_INTERVAL_SECS: heartbeat period (30)
    /// - GATEIO_RECONNECT_DELAY_MS: first backoff delay (5000)
    /// - GATEIO_MAX_RECONNECT_ATTEMPTS: attempts before giving up (10)
    /// - STATUS_INTERVAL_SECS: system_status broadcast period (10)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut coordinator = CoordinatorConfig::default();
        let port = parse_number(&lookup, "SERVER_PORT")?.unwrap_or(DEFAULT_PORT);

        if let Some(raw) = lookup("GATEIO_WS_URLS") {
            coordinator.upstream.urls = parse_urls(&raw)?;
        }
        if let Some(namespace) = lookup("GATEIO_CHANNEL_NAMESPACE") {
            let namespace = namespace.trim();
            if namespace.is_empty() {
                return Err(ConfigError::Empty("GATEIO_CHANNEL_NAMESPACE"));
            }
            coordinator.upstream.namespace = namespace.to_string();
        }
        if let Some(secs) = parse_number::<u64, _>(&lookup, "GATEIO_PING_INTERVAL_SECS")? {
            coordinator.upstream.ping_interval = positive_secs("GATEIO_PING_INTERVAL_SECS", secs)?;
        }
        if let Some(ms) = parse_number::<u64, _>(&lookup, "GATEIO_RECONNECT_DELAY_MS")? {
            coordinator.upstream.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_number::<u32, _>(&lookup, "GATEIO_MAX_RECONNECT_ATTEMPTS")? {
            if attempts == 0 {
                return Err(ConfigError::InvalidNumber {
                    key: "GATEIO_MAX_RECONNECT_ATTEMPTS",
                    value: attempts.to_string(),
                });
            }
            coordinator.upstream.max_reconnect_attempts = attempts;
        }
        if let Some(secs) = parse_number::<u64, _>(&lookup, "STATUS_INTERVAL_SECS")? {
            coordinator.status_interval = positive_secs("STATUS_INTERVAL_SECS", secs)?;
        }

        Ok(Self { port, coordinator })
    }
}

fn parse_number<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value: raw }),
        None => Ok(None),
    }
}

fn positive_secs(key: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidNumber {
            key,
            value: secs.to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_urls(raw: &str) -> Result<Vec<Url>, ConfigError> {
    let urls = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let url = Url::parse(s).map_err(|e| ConfigError::InvalidUrl {
                value: s.to_string(),
                error: e.to_string(),
            })?;
            match url.scheme() {
                "ws" | "wss" => Ok(url),
                _ => Err(ConfigError::InvalidUrl {
                    value: s.to_string(),
                    error: "scheme must be ws or wss".to_string(),
                }),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    if urls.is_empty() {
        return Err(ConfigError::Empty("GATEIO_WS_URLS"));
    }
    Ok(urls)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("Invalid endpoint {value:?}: {error}")]
    InvalidUrl { value: String, error: String },

    #[error("{0} cannot be empty")]
    Empty(&'static str),
}
