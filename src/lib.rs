use std::time::Duration;

use config::{Config, ConfigError};
use serde::Deserialize;

pub mod domain;
pub mod infrastructure;
pub mod usecase;

#[derive(Clone, Debug, Deserialize)]
pub struct HireloopConfig {
    pub eventstore: EventStore,
    pub meilisearch: MeiliSearch,
    pub logger: Logger,
    #[serde(default)]
    pub booking: Booking,
    #[serde(default)]
    pub web: Web,
}

impl HireloopConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::with_name("hireloop.toml"))
            .add_source(config::Environment::with_prefix("HIRELOOP").separator("_"))
            .build()?
            .try_deserialize::<HireloopConfig>()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventStore {
    pub url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MeiliSearch {
    pub url: String,
    pub api_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Logger {
    pub level: Level,
}

/// Tunables for the booking core.
#[derive(Clone, Debug, Deserialize)]
pub struct Booking {
    /// Upper bound for a single store round-trip.
    pub store_timeout_ms: u64,
    /// How long after creation a review may still be edited by its author.
    pub review_edit_window_days: i64,
    /// Maximum number of candidates returned by a nearby search.
    pub search_limit: usize,
}

impl Booking {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn review_edit_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.review_edit_window_days)
    }
}

impl Default for Booking {
    fn default() -> Self {
        Self {
            store_timeout_ms: 5_000,
            review_edit_window_days: 7,
            search_limit: 100,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Web {
    pub bind: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Web {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_owned(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub enum Level {
    TRACE,
    DEBUG,
    INFO,
    WARN,
    ERROR,
}

impl From<&Level> for tracing::Level {
    fn from(value: &Level) -> Self {
        match value {
            Level::TRACE => tracing::Level::TRACE,
            Level::DEBUG => tracing::Level::DEBUG,
            Level::INFO => tracing::Level::INFO,
            Level::WARN => tracing::Level::WARN,
            Level::ERROR => tracing::Level::ERROR,
        }
    }
}
