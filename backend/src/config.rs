//! Configuration management for the Stock Count Ledger
//!
//! Supports hierarchical configuration loading:
//! 1. Default values in code
//! 2. Configuration files (config/development.toml, config/production.toml)
//! 3. Environment variable overrides with SCL_ prefix (e.g. `SCL_DATABASE__URL`)
//!
//! The stock switches themselves live in the store's settings table; the
//! `stock` section only carries deployment overrides that win over it.

use config::{ConfigError, Environment, File};
use serde::Deserialize;
use shared::StockGranularity;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Current environment (development, production)
    pub environment: String,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Deployment overrides for the stock switches
    #[serde(default)]
    pub stock: StockOverrides,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite connection URL (e.g. `sqlite://data/stock.db`)
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Seconds a writer waits on a locked database before failing
    pub busy_timeout_secs: u64,
}

/// Optional overrides; `None` defers to the settings table
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StockOverrides {
    pub granularity: Option<StockGranularity>,
    pub allow_negative_stock: Option<bool>,
    pub requires_approval: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable ones
    pub json: bool,
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let environment = std::env::var("SCL_ENVIRONMENT").unwrap_or_else(|_| "development".into());

        let config = config::Config::builder()
            // Start with default values
            .set_default("environment", environment.clone())?
            .set_default("database.url", "sqlite://data/stock.db")?
            .set_default("database.max_connections", 1)?
            .set_default("database.busy_timeout_secs", 5)?
            .set_default("logging.json", false)?
            // Load environment-specific config file
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Override with environment variables (SCL_ prefix)
            .add_source(
                Environment::with_prefix("SCL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/stock.db".to_string(),
            max_connections: 1,
            busy_timeout_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_overrides_default_to_none() {
        let overrides = StockOverrides::default();
        assert!(overrides.granularity.is_none());
        assert!(overrides.allow_negative_stock.is_none());
        assert!(overrides.requires_approval.is_none());
    }

    #[test]
    fn test_database_defaults_to_single_writer() {
        assert_eq!(DatabaseConfig::default().max_connections, 1);
    }
}
