//! Wolfpack Configuration
//!
//! Configuration structures for the wolfpack master election library and
//! its command-line simulator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Lease TTL as a multiple of the keepalive interval. A lease survives two
/// missed refreshes before the store reclaims the entry.
const LEASE_TTL_MULTIPLIER: u32 = 3;

/// Main wolfpack configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WolfpackConfig {
    /// Election tuning
    #[serde(default)]
    pub election: ElectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Election tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Keepalive interval in seconds; the candidacy lease TTL is derived
    /// from it
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Maximum time to wait for the store to confirm withdrawal during stop,
    /// in milliseconds
    #[serde(default = "default_withdraw_timeout_ms")]
    pub withdraw_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_keepalive_interval_secs() -> u64 {
    2
}

fn default_withdraw_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval_secs(),
            withdraw_timeout_ms: default_withdraw_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl ElectionConfig {
    /// Get keepalive interval as Duration
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Get the candidacy lease TTL derived from the keepalive interval
    pub fn lease_ttl(&self) -> Duration {
        self.keepalive_interval() * LEASE_TTL_MULTIPLIER
    }

    /// Get withdraw timeout as Duration
    pub fn withdraw_timeout(&self) -> Duration {
        Duration::from_millis(self.withdraw_timeout_ms)
    }
}

impl WolfpackConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfpackConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfpackConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.election.keepalive_interval_secs == 0 {
            return Err(crate::Error::Config(
                "election.keepalive_interval_secs must be at least 1".into(),
            ));
        }

        if self.election.withdraw_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "election.withdraw_timeout_ms must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
