//! Engine configuration
//!
//! Defaults come from the environment (`TERMINAL_*`); [`EngineConfig::from_env`]
//! loads `.env.local` and `.env` first.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::DEFAULT_FLUSH_INTERVAL;
use crate::polling::PollingConfig;
use crate::settings::DEFAULT_SYMBOL;
use crate::state_store::StoreConfig;
use crate::symbol_catalog::DEFAULT_FILTER_QUIET;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub flush_interval: Duration,
    pub polling: PollingConfig,
    pub store: StoreConfig,
    pub filter_quiet: Duration,
    pub default_symbol: String,
    /// JSON settings file remembering the last symbol
    pub settings_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let polling = PollingConfig::default();
        let store = StoreConfig::default();

        Self {
            flush_interval: env_millis("TERMINAL_FLUSH_INTERVAL_MS").unwrap_or(DEFAULT_FLUSH_INTERVAL),
            polling: PollingConfig {
                account_interval: env_millis("TERMINAL_POLL_INTERVAL_MS")
                    .unwrap_or(polling.account_interval),
                balance_interval: env_millis("TERMINAL_BALANCE_INTERVAL_MS")
                    .unwrap_or(polling.balance_interval),
            },
            store: StoreConfig {
                order_absence_tolerance: env_parse("TERMINAL_ORDER_ABSENCE_TOLERANCE")
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(store.order_absence_tolerance),
                price_stale_after: env_parse("TERMINAL_PRICE_STALE_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(store.price_stale_after),
            },
            filter_quiet: env_millis("TERMINAL_FILTER_QUIET_MS").unwrap_or(DEFAULT_FILTER_QUIET),
            default_symbol: std::env::var("TERMINAL_DEFAULT_SYMBOL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SYMBOL.to_string()),
            settings_path: std::env::var("TERMINAL_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("terminal-settings.json")),
        }
    }
}

impl EngineConfig {
    /// Load `.env.local` / `.env` (when present), then read the environment
    pub fn from_env() -> Self {
        dotenvy::from_filename(".env.local").ok();
        dotenvy::dotenv().ok();
        Self::default()
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        if std::env::var("TERMINAL_FLUSH_INTERVAL_MS").is_err() {
            assert_eq!(config.flush_interval, Duration::from_millis(2000));
        }
        if std::env::var("TERMINAL_ORDER_ABSENCE_TOLERANCE").is_err() {
            assert_eq!(config.store.order_absence_tolerance, 2);
        }
        assert!(!config.default_symbol.is_empty());
    }

    #[test]
    fn test_env_millis_rejects_zero_and_garbage() {
        std::env::set_var("TERMINAL_TEST_ZERO_MS", "0");
        std::env::set_var("TERMINAL_TEST_BAD_MS", "soon");
        std::env::set_var("TERMINAL_TEST_GOOD_MS", " 250 ");

        assert_eq!(env_millis("TERMINAL_TEST_ZERO_MS"), None);
        assert_eq!(env_millis("TERMINAL_TEST_BAD_MS"), None);
        assert_eq!(env_millis("TERMINAL_TEST_GOOD_MS"), Some(Duration::from_millis(250)));
    }
}
