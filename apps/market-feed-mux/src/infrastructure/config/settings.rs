//! Feed Configuration Settings
//!
//! Configuration types for the feed endpoint, loaded from environment variables.

use std::time::Duration;

/// Primary URL variable.
const URL_VAR: &str = "FEED_URL";

/// Legacy URL variable, consulted when `FEED_URL` is unset.
const LEGACY_URL_VAR: &str = "DXFEED_URL";

/// Schemes accepted for the endpoint URL.
const URL_SCHEMES: &[&str] = &["http://", "https://", "ws://", "wss://"];

/// Endpoint reconnection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedConfig {
    /// Endpoint URL; `None` means working without a connection.
    pub url: Option<String>,
    /// Symbols subscribed at startup.
    pub symbols: Vec<String>,
    /// Reconnection settings.
    pub reconnect: ReconnectSettings,
}

impl FeedConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is present but not absolute.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from a variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is present but not absolute.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = match lookup(URL_VAR).or_else(|| lookup(LEGACY_URL_VAR)) {
            Some(url) if url.trim().is_empty() => {
                return Err(ConfigError::EmptyValue(URL_VAR.to_string()));
            }
            Some(url) => Some(validate_url(url.trim())?),
            None => None,
        };

        let symbols = lookup("FEED_SYMBOLS")
            .map(|list| parse_symbols(&list))
            .unwrap_or_default();

        let defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            reconnect_delay_initial: parse_duration_millis(
                &lookup,
                "FEED_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_duration_secs(
                &lookup,
                "FEED_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_or(
                &lookup,
                "FEED_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_or(
                &lookup,
                "FEED_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
        };

        Ok(Self {
            url,
            symbols,
            reconnect,
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// URL is not absolute.
    #[error("endpoint URL must be absolute (http, https, ws or wss): {0}")]
    RelativeUrl(String),
}

fn validate_url(url: &str) -> Result<String, ConfigError> {
    let lower = url.to_ascii_lowercase();
    if URL_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
        Ok(url.to_string())
    } else {
        Err(ConfigError::RelativeUrl(url.to_string()))
    }
}

fn parse_symbols(list: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for symbol in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !symbols.iter().any(|existing| existing == symbol) {
            symbols.push(symbol.to_string());
        }
    }
    symbols
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<FeedConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        FeedConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = config(&[]).unwrap();

        assert_eq!(config.url, None);
        assert!(config.symbols.is_empty());
        assert_eq!(config.reconnect, ReconnectSettings::default());
    }

    #[test]
    fn feed_url_preferred_over_legacy() {
        let config = config(&[
            ("FEED_URL", "wss://feed.example.com/cometd"),
            ("DXFEED_URL", "https://legacy.example.com/cometd"),
        ])
        .unwrap();

        assert_eq!(config.url.as_deref(), Some("wss://feed.example.com/cometd"));
    }

    #[test]
    fn legacy_url_fallback() {
        let config = config(&[("DXFEED_URL", "https://legacy.example.com/cometd")]).unwrap();
        assert_eq!(
            config.url.as_deref(),
            Some("https://legacy.example.com/cometd")
        );
    }

    #[test]
    fn relative_url_rejected() {
        assert_eq!(
            config(&[("FEED_URL", "/cometd")]),
            Err(ConfigError::RelativeUrl("/cometd".to_string()))
        );
    }

    #[test]
    fn empty_url_rejected() {
        assert!(matches!(
            config(&[("FEED_URL", "  ")]),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn symbols_are_trimmed_and_deduplicated() {
        let config = config(&[("FEED_SYMBOLS", " AAPL, MSFT,,AAPL ,IBM")]).unwrap();
        assert_eq!(config.symbols, vec!["AAPL", "MSFT", "IBM"]);
    }

    #[test]
    fn reconnect_settings_from_environment() {
        let config = config(&[
            ("FEED_RECONNECT_DELAY_INITIAL_MS", "250"),
            ("FEED_RECONNECT_DELAY_MAX_SECS", "10"),
            ("FEED_RECONNECT_DELAY_MULTIPLIER", "1.5"),
            ("FEED_MAX_RECONNECT_ATTEMPTS", "4"),
        ])
        .unwrap();

        assert_eq!(
            config.reconnect.reconnect_delay_initial,
            Duration::from_millis(250)
        );
        assert_eq!(config.reconnect.reconnect_delay_max, Duration::from_secs(10));
        assert!((config.reconnect.reconnect_delay_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.reconnect.max_reconnect_attempts, 4);
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        let config = config(&[
            ("FEED_RECONNECT_DELAY_INITIAL_MS", "soon"),
            ("FEED_MAX_RECONNECT_ATTEMPTS", "-1"),
        ])
        .unwrap();

        assert_eq!(config.reconnect, ReconnectSettings::default());
    }
}
