//! Lowering configuration.
//!
//! The process-wide lowering table reads its configuration once, from the
//! `PTIR_LOWERING_DUPLICATES` environment variable. Embedders that build their own
//! [`LoweringRegistry`](crate::ops::lowering::LoweringRegistry) pass a [`LoweringConfig`]
//! directly, typically deserialised from JSON.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DUPLICATES_ENV: &str = "PTIR_LOWERING_DUPLICATES";

static PROCESS_CONFIG: OnceLock<LoweringConfig> = OnceLock::new();

/// What happens when two lowerings register under the same operator name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Fail table construction.
    #[default]
    Reject,
    /// Keep the last registration and log a warning.
    Replace,
}

impl DuplicatePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DuplicatePolicy::Reject => "reject",
            DuplicatePolicy::Replace => "replace",
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicatePolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(DuplicatePolicy::Reject),
            "replace" => Ok(DuplicatePolicy::Replace),
            other => Err(ConfigError::InvalidValue {
                key: DUPLICATES_ENV,
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid lowering config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value {value:?} for {key}; expected reject or replace")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoweringConfig {
    pub duplicate_policy: DuplicatePolicy,
}

impl LoweringConfig {
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads overrides through `lookup`; unset or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(DUPLICATES_ENV) {
            if !value.trim().is_empty() {
                config.duplicate_policy = value.parse()?;
            }
        }
        Ok(config)
    }
}

/// Configuration used by the process-wide lowering table.
pub fn process_config() -> LoweringConfig {
    *PROCESS_CONFIG.get_or_init(|| match LoweringConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            log::warn!("{err}; using default lowering config");
            LoweringConfig::default()
        }
    })
}
