// Configuration module

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::constants::DEFAULT_MAX_RETRIES;
use crate::resources::ResourceManager;
use crate::runtime::{RandomGenerator, RuntimeValue, StaticRuntime};

pub mod codec;
pub mod retry;

pub use codec::CodecConfigYaml;
pub use retry::{HeaderMatcherYaml, RangeYaml, ResetHeaderYaml, RetryConfigYaml};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Environment variable '{0}' is referenced but not set")]
    MissingEnvVar(String),

    #[error("Invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_max_retries() -> u64 {
    DEFAULT_MAX_RETRIES
}

/// Retry budget per priority (YAML format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfigYaml {
    /// Concurrent retries allowed at default priority
    #[serde(default = "default_max_retries")]
    pub max_retries: u64,
    /// Concurrent retries allowed at high priority
    #[serde(default = "default_max_retries")]
    pub max_retries_high: u64,
}

impl Default for ResourcesConfigYaml {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_retries_high: default_max_retries(),
        }
    }
}

/// Top-level configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub retry: RetryConfigYaml,
    #[serde(default)]
    pub codec: CodecConfigYaml,
    #[serde(default)]
    pub resources: ResourcesConfigYaml,
    /// Runtime overrides (feature flags, percentages, integers)
    #[serde(default)]
    pub runtime: HashMap<String, RuntimeValue>,
}

impl Config {
    /// Parse YAML after replacing every `${VAR_NAME}` with the environment
    /// variable's value. A reference to an unset variable is an error.
    pub fn from_yaml_with_env(yaml: &str) -> Result<Self, ConfigError> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut missing: Option<String> = None;
        let substituted = re.replace_all(yaml, |caps: &regex::Captures| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => {
                    missing.get_or_insert_with(|| caps[1].to_string());
                    String::new()
                }
            }
        });
        if let Some(var_name) = missing {
            return Err(ConfigError::MissingEnvVar(var_name));
        }

        let config: Config = serde_yaml::from_str(&substituted)?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_with_env(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.to_retry_policy()?;
        self.codec.validate()?;

        if self.resources.max_retries == 0 && self.resources.max_retries_high == 0 {
            tracing::warn!("Retry budget is zero for every priority; no retry will be admitted");
        }

        if let Some(RuntimeValue::Integer(percent)) =
            self.runtime.get(crate::constants::RUNTIME_USE_RETRY)
        {
            if *percent > 100 {
                return Err(ConfigError::Invalid(format!(
                    "Runtime key '{}' is a percentage, got {}",
                    crate::constants::RUNTIME_USE_RETRY,
                    percent
                )));
            }
        }

        Ok(())
    }

    pub fn resource_manager(&self) -> ResourceManager {
        ResourceManager::new(self.resources.max_retries, self.resources.max_retries_high)
    }

    pub fn runtime(&self, random: Arc<dyn RandomGenerator>) -> StaticRuntime {
        StaticRuntime::new(self.runtime.clone(), random)
    }
}
