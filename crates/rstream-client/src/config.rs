//! Stream client configuration
//!
//! Options can be built in code or loaded from TOML:
//!
//! ```toml
//! [stream]
//! retry = true
//! is_object = true
//! max_retries = 10
//!
//! [backoff]
//! type = "exponential"
//! initial_ms = 100
//! max_ms = 30000
//! multiplier = 2.0
//! jitter_ms = 50
//!
//! [metadata]
//! authorization = "Bearer ..."
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rstream_core::{BackoffPolicy, ConstantBackoff, ExponentialBackoff, Metadata};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Behaviour switches for one stream controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Reconnect automatically after the stream ends or fails
    #[serde(default)]
    pub retry: bool,
    /// Decode data messages to a structured value before dispatch
    #[serde(default)]
    pub is_object: bool,
    /// Give up after this many consecutive reconnects without data
    #[serde(default, alias = "retries", skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl StreamOptions {
    /// Options with automatic reconnect enabled
    pub fn retrying() -> Self {
        Self {
            retry: true,
            ..Self::default()
        }
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_is_object(mut self, is_object: bool) -> Self {
        self.is_object = is_object;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Backoff policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffConfig {
    /// Growing interval, see [`ExponentialBackoff`]
    Exponential(ExponentialConfig),
    /// Fixed interval, see [`ConstantBackoff`]
    Constant(ConstantConfig),
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential(ExponentialConfig::default())
    }
}

/// Exponential backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub jitter_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

fn default_initial_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for ExponentialConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter_ms: 0,
            max_attempts: None,
        }
    }
}

/// Constant backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantConfig {
    pub interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl BackoffConfig {
    /// Check values that deserialize fine but make no sense
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            BackoffConfig::Exponential(cfg) => {
                if !cfg.multiplier.is_finite() || cfg.multiplier < 1.0 {
                    return Err(ConfigError::Invalid(format!(
                        "backoff.multiplier must be a finite number >= 1.0, got {}",
                        cfg.multiplier
                    )));
                }
                if cfg.max_ms < cfg.initial_ms {
                    return Err(ConfigError::Invalid(format!(
                        "backoff.max_ms ({}) must be >= backoff.initial_ms ({})",
                        cfg.max_ms, cfg.initial_ms
                    )));
                }
                Ok(())
            }
            BackoffConfig::Constant(_) => Ok(()),
        }
    }

    /// Instantiate the configured policy
    pub fn build(&self) -> Arc<dyn BackoffPolicy> {
        match self {
            BackoffConfig::Exponential(cfg) => {
                let mut policy = ExponentialBackoff::new(
                    Duration::from_millis(cfg.initial_ms),
                    Duration::from_millis(cfg.max_ms),
                )
                .with_multiplier(cfg.multiplier)
                .with_jitter(Duration::from_millis(cfg.jitter_ms));
                if let Some(max) = cfg.max_attempts {
                    policy = policy.with_max_attempts(max);
                }
                Arc::new(policy)
            }
            BackoffConfig::Constant(cfg) => {
                let mut policy = ConstantBackoff::new(Duration::from_millis(cfg.interval_ms));
                if let Some(max) = cfg.max_attempts {
                    policy = policy.with_max_attempts(max);
                }
                Arc::new(policy)
            }
        }
    }
}

/// Complete client configuration as loaded from a file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub stream: StreamOptions,
    /// No backoff table means reconnects expire immediately
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffConfig>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ClientConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(backoff) = &self.backoff {
            backoff.validate()?;
        }
        Ok(())
    }
}
