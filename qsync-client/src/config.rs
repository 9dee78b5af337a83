//! Configuration loading for the qsync client.
//!
//! Only `endpoint` is required. The `[mutations]` table supplies the
//! defaults every mutation hook starts from.

use qsync_core::{ConfigError, Endpoint};
use qsync_mutation::MutationOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "QSYNC_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Base URL of the data API, e.g. `http://localhost/api/model`.
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Log every key a mutation patches, rolls back or refetches.
    #[serde(default)]
    pub logging: bool,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub mutations: MutationDefaults,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub jwt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutationDefaults {
    #[serde(default)]
    pub optimistic_update: bool,
    #[serde(default = "default_true")]
    pub invalidate_queries: bool,
}

impl Default for MutationDefaults {
    fn default() -> Self {
        Self {
            optimistic_update: false,
            invalidate_queries: true,
        }
    }
}

impl MutationDefaults {
    pub fn options(&self) -> MutationOptions {
        MutationOptions::new()
            .optimistic(self.optimistic_update)
            .invalidate(self.invalidate_queries)
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout_ms: default_timeout_ms(),
            logging: false,
            auth: AuthConfig::default(),
            mutations: MutationDefaults::default(),
        }
    }

    /// Load and validate the file named by `QSYNC_CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV)
            .ok()
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "endpoint",
                reason: "must not be empty".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.auth.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "auth.api_key",
                reason: "must not be empty when set".to_string(),
            });
        }
        if self.auth.jwt.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "auth.jwt",
                reason: "must not be empty when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.endpoint.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
