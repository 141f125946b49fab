// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bundler configuration.
//!
//! Supports both programmatic and file-based configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Bundler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundlerConfig {
    /// Instance name (for identification in logs).
    #[serde(default = "default_name")]
    pub name: String,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Default per-request deadline (milliseconds).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub deduplication: DeduplicationConfig,

    #[serde(default)]
    pub adr: AdrConfig,
}

fn default_name() -> String {
    "lns-bundler".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout_ms() -> u64 {
    2_000
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            request_timeout_ms: default_request_timeout_ms(),
            store: StoreConfig::default(),
            deduplication: DeduplicationConfig::default(),
            adr: AdrConfig::default(),
        }
    }
}

impl BundlerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".into()));
        }

        let ttls = [
            ("store.ownership_ttl_secs", self.store.ownership_ttl_secs),
            ("store.fcnt_down_ttl_secs", self.store.fcnt_down_ttl_secs),
            ("store.adr_ttl_secs", self.store.adr_ttl_secs),
            (
                "store.preferred_gateway_ttl_secs",
                self.store.preferred_gateway_ttl_secs,
            ),
        ];
        for (field, value) in ttls {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", field)));
            }
        }
        if self.store.max_cas_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store.max_cas_attempts must be > 0".into(),
            ));
        }

        if self.deduplication.close_connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "deduplication.close_connection_timeout_ms must be > 0".into(),
            ));
        }

        if !(1..=255).contains(&self.adr.frame_count_capture_count) {
            return Err(ConfigError::Invalid(format!(
                "adr.frame_count_capture_count must be in 1..=255 (got {})",
                self.adr.frame_count_capture_count
            )));
        }
        if !self.adr.margin_db.is_finite() {
            return Err(ConfigError::Invalid("adr.margin_db must be finite".into()));
        }
        if !(1..=3).contains(&self.adr.default_nb_rep) {
            return Err(ConfigError::Invalid(format!(
                "adr.default_nb_rep must be in 1..=3 (got {})",
                self.adr.default_nb_rep
            )));
        }

        Ok(())
    }

    /// Default per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Shared store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_ownership_ttl")]
    pub ownership_ttl_secs: u64,

    #[serde(default = "default_fcnt_down_ttl")]
    pub fcnt_down_ttl_secs: u64,

    #[serde(default = "default_adr_ttl")]
    pub adr_ttl_secs: u64,

    #[serde(default = "default_preferred_gateway_ttl")]
    pub preferred_gateway_ttl_secs: u64,

    /// Compare-and-set attempts per mutation before giving up.
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,

    /// Expired-record sweep interval (seconds, 0 to disable).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_ownership_ttl() -> u64 {
    60
}

fn default_fcnt_down_ttl() -> u64 {
    600
}

fn default_adr_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_preferred_gateway_ttl() -> u64 {
    24 * 3600
}

fn default_max_cas_attempts() -> u32 {
    64
}

fn default_sweep_interval() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ownership_ttl_secs: default_ownership_ttl(),
            fcnt_down_ttl_secs: default_fcnt_down_ttl(),
            adr_ttl_secs: default_adr_ttl(),
            preferred_gateway_ttl_secs: default_preferred_gateway_ttl(),
            max_cas_attempts: default_max_cas_attempts(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn ownership_ttl(&self) -> Duration {
        Duration::from_secs(self.ownership_ttl_secs)
    }

    pub fn fcnt_down_ttl(&self) -> Duration {
        Duration::from_secs(self.fcnt_down_ttl_secs)
    }

    pub fn adr_ttl(&self) -> Duration {
        Duration::from_secs(self.adr_ttl_secs)
    }

    pub fn preferred_gateway_ttl(&self) -> Duration {
        Duration::from_secs(self.preferred_gateway_ttl_secs)
    }

    /// `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Deduplication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationConfig {
    /// Bound on the close-connection request sent to a previous owner.
    #[serde(default = "default_close_connection_timeout")]
    pub close_connection_timeout_ms: u64,
}

fn default_close_connection_timeout() -> u64 {
    5_000
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            close_connection_timeout_ms: default_close_connection_timeout(),
        }
    }
}

impl DeduplicationConfig {
    pub fn close_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.close_connection_timeout_ms)
    }
}

/// ADR settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdrConfig {
    /// History length per device.
    #[serde(default = "default_capture_count")]
    pub frame_count_capture_count: usize,

    /// Installation margin of the standard strategy (dB).
    #[serde(default = "default_margin_db")]
    pub margin_db: f64,

    /// Repetitions recommended before any setting was confirmed.
    #[serde(default = "default_nb_rep")]
    pub default_nb_rep: u8,
}

fn default_capture_count() -> usize {
    crate::adr::FRAME_COUNT_CAPTURE_COUNT
}

fn default_margin_db() -> f64 {
    5.0
}

fn default_nb_rep() -> u8 {
    1
}

impl Default for AdrConfig {
    fn default() -> Self {
        Self {
            frame_count_capture_count: default_capture_count(),
            margin_db: default_margin_db(),
            default_nb_rep: default_nb_rep(),
        }
    }
}
