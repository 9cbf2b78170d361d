//! Engine Configuration
//!
//! All configuration values are loaded from environment variables with
//! typed defaults. The calendar settings (time zone, bot signatures,
//! site-wide sentinel) are consumed once when the store is opened.

use crate::error::SeriesError;
use chrono_tz::Tz;
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Crawler signatures excluded from visit metrics unless configured otherwise
pub const DEFAULT_BOT_SIGNATURES: &[&str] = &[
    "Googlebot",
    "bingbot",
    "YandexBot",
    "DuckDuckBot",
    "Baiduspider",
    "AhrefsBot",
    "SemrushBot",
];

/// Series engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Event store connection string (from DATABASE_URL env var)
    pub database_url: String,

    /// Zone used for day truncation and calendar generation (from SERIES_TIMEZONE env var)
    pub timezone: Tz,

    /// Case-insensitive crawler signatures (from SERIES_BOT_SIGNATURES env var, comma separated)
    pub bot_signatures: Vec<String>,

    /// Product code stored on events not attributed to any product (from SERIES_SITE_WIDE_SENTINEL env var)
    pub site_wide_sentinel: String,

    /// Upper bound for a single store call (from SERIES_STORE_TIMEOUT_MS env var)
    #[serde(with = "duration_ms")]
    pub store_timeout: Duration,

    /// Pool size for file-backed stores (from SERIES_MAX_CONNECTIONS env var)
    pub max_connections: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            timezone: Tz::UTC,
            bot_signatures: DEFAULT_BOT_SIGNATURES.iter().map(|s| s.to_string()).collect(),
            site_wide_sentinel: String::new(),
            store_timeout: Duration::from_millis(5000),
            max_connections: 5,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, SeriesError> {
        let defaults = Self::default();

        let timezone = match env::var("SERIES_TIMEZONE") {
            Ok(name) => name.trim().parse::<Tz>().map_err(|_| {
                SeriesError::Config(format!("SERIES_TIMEZONE {:?} is not an IANA zone", name))
            })?,
            Err(_) => defaults.timezone,
        };

        let bot_signatures = env::var("SERIES_BOT_SIGNATURES")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.bot_signatures);

        let config = Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),

            timezone,

            bot_signatures,

            site_wide_sentinel: env::var("SERIES_SITE_WIDE_SENTINEL")
                .unwrap_or(defaults.site_wide_sentinel),

            store_timeout: env::var("SERIES_STORE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),

            max_connections: env::var("SERIES_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SeriesError> {
        if self.database_url.trim().is_empty() {
            return Err(SeriesError::Config("DATABASE_URL must not be empty".to_string()));
        }

        if self.bot_signatures.iter().any(|s| s.trim().is_empty()) {
            return Err(SeriesError::Config(
                "SERIES_BOT_SIGNATURES must not contain empty entries".to_string(),
            ));
        }

        if self.store_timeout.is_zero() {
            return Err(SeriesError::Config(
                "SERIES_STORE_TIMEOUT_MS must be positive".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(SeriesError::Config(
                "SERIES_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Signatures lower-cased, trimmed, deduplicated and sorted
    pub fn normalized_signatures(&self) -> Vec<String> {
        let mut signatures: Vec<String> = self
            .bot_signatures
            .iter()
            .map(|s| s.trim().to_lowercase())
            .collect();
        signatures.sort();
        signatures.dedup();
        signatures
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
