//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitSettings,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            rate_limiting: RateLimitSettings::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listener address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

/// Parameters applied to every bucket the registry creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Tokens a freshly created bucket starts with. May exceed `max_tokens`:
    /// the surplus is spendable once and never refilled.
    #[serde(default = "default_burst")]
    pub burst: u64,

    /// Token count the refill never exceeds.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,

    /// Seconds that must elapse per refilled token.
    #[serde(default = "default_refill_rate_secs")]
    pub refill_rate_secs: u64,

    /// Seconds between eviction scans of the bucket registry.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            max_tokens: default_max_tokens(),
            refill_rate_secs: default_refill_rate_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_burst() -> u64 {
    10
}

fn default_max_tokens() -> u64 {
    5
}

fn default_refill_rate_secs() -> u64 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

impl RateLimitSettings {
    /// The wall-clock cost of one token.
    pub fn refill_rate(&self) -> Duration {
        Duration::from_secs(self.refill_rate_secs)
    }

    /// The eviction scan period.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Reject values the limiter arithmetic cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.refill_rate_secs == 0 {
            return Err(TurnstileError::Config(
                "refill_rate_secs must be greater than zero".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl TurnstileConfig {
    /// Load and validate configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        let config: TurnstileConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.rate_limiting.validate()?;
        Ok(config)
    }
}
