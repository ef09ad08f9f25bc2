//! Retry configuration for upstream requests.
//!
//! This module defines the YAML configuration format for a route's retry
//! policy and converts it into a [`RetryPolicy`].
//!
//! Default values are sourced from `crate::constants`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ConfigError;
use crate::constants::{
    DEFAULT_HOST_SELECTION_MAX_ATTEMPTS, DEFAULT_MAX_RATE_LIMITED_INTERVAL_MS, DEFAULT_NUM_RETRIES,
};
use crate::retry::{
    parse_retry_grpc_on, parse_retry_on, HeaderMatch, HeaderMatcher, ResetHeaderFormat,
    ResetHeaderParser, RetryPolicy,
};

fn default_num_retries() -> u32 {
    DEFAULT_NUM_RETRIES
}

fn default_max_rate_limited_interval_ms() -> u64 {
    DEFAULT_MAX_RATE_LIMITED_INTERVAL_MS
}

fn default_host_selection_max_attempts() -> u32 {
    DEFAULT_HOST_SELECTION_MAX_ATTEMPTS
}

/// Integer range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeYaml {
    pub start: i64,
    pub end: i64,
}

/// Header matcher (YAML format). At most one match kind may be set; with
/// none set the header only has to be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderMatcherYaml {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub present: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<RangeYaml>,
    #[serde(default)]
    pub invert: bool,
}

impl HeaderMatcherYaml {
    pub fn to_matcher(&self) -> Result<HeaderMatcher, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid(
                "Header matcher name cannot be empty".to_string(),
            ));
        }

        let mut kinds = Vec::new();
        if let Some(value) = &self.exact {
            kinds.push(HeaderMatch::Exact(value.clone()));
        }
        if let Some(value) = &self.prefix {
            kinds.push(HeaderMatch::Prefix(value.clone()));
        }
        if let Some(value) = &self.suffix {
            kinds.push(HeaderMatch::Suffix(value.clone()));
        }
        if let Some(value) = &self.contains {
            kinds.push(HeaderMatch::Contains(value.clone()));
        }
        if let Some(present) = self.present {
            kinds.push(HeaderMatch::Present(present));
        }
        if let Some(range) = self.range {
            if range.start >= range.end {
                return Err(ConfigError::Invalid(format!(
                    "Header matcher '{}' has empty range [{}, {})",
                    self.name, range.start, range.end
                )));
            }
            kinds.push(HeaderMatch::Range {
                start: range.start,
                end: range.end,
            });
        }
        let regex_set = self.regex.is_some();
        if kinds.len() + usize::from(regex_set) > 1 {
            return Err(ConfigError::Invalid(format!(
                "Header matcher '{}' sets more than one match kind",
                self.name
            )));
        }

        let matcher = match (&self.regex, kinds.pop()) {
            (Some(pattern), _) => HeaderMatcher::regex(&self.name, pattern).map_err(|e| {
                ConfigError::Invalid(format!(
                    "Header matcher '{}' has invalid regex: {}",
                    self.name, e
                ))
            })?,
            (None, Some(kind)) => HeaderMatcher::new(&self.name, kind),
            (None, None) => HeaderMatcher::present(&self.name),
        };
        Ok(if self.invert { matcher.inverted() } else { matcher })
    }
}

/// Rate-limit reset header (YAML format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetHeaderYaml {
    pub name: String,
    #[serde(default)]
    pub format: ResetHeaderFormat,
}

/// Retry configuration (YAML format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfigYaml {
    /// Comma list of retry conditions, same tokens as `x-envoy-retry-on`
    #[serde(default)]
    pub retry_on: String,
    /// Comma list of gRPC retry conditions
    #[serde(default)]
    pub retry_grpc_on: String,
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    /// Base backoff interval; falls back to the runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_interval_ms: Option<u64>,
    /// Backoff ceiling; defaults to ten times the base interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_ms: Option<u64>,
    #[serde(default)]
    pub retriable_status_codes: Vec<u32>,
    #[serde(default)]
    pub retriable_headers: Vec<HeaderMatcherYaml>,
    #[serde(default)]
    pub retriable_request_headers: Vec<HeaderMatcherYaml>,
    #[serde(default)]
    pub rate_limited_reset_headers: Vec<ResetHeaderYaml>,
    #[serde(default = "default_max_rate_limited_interval_ms")]
    pub max_rate_limited_interval_ms: u64,
    #[serde(default = "default_host_selection_max_attempts")]
    pub host_selection_max_attempts: u32,
}

impl Default for RetryConfigYaml {
    fn default() -> Self {
        Self {
            retry_on: String::new(),
            retry_grpc_on: String::new(),
            num_retries: default_num_retries(),
            base_interval_ms: None,
            max_interval_ms: None,
            retriable_status_codes: Vec::new(),
            retriable_headers: Vec::new(),
            retriable_request_headers: Vec::new(),
            rate_limited_reset_headers: Vec::new(),
            max_rate_limited_interval_ms: default_max_rate_limited_interval_ms(),
            host_selection_max_attempts: default_host_selection_max_attempts(),
        }
    }
}

impl RetryConfigYaml {
    /// Convert to RetryPolicy from retry module. Unlike request headers,
    /// configuration is strict: unknown condition tokens are rejected.
    pub fn to_retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let (mut retry_on, valid) = parse_retry_on(&self.retry_on);
        if !valid {
            return Err(ConfigError::Invalid(format!(
                "Unknown retry_on condition in '{}'",
                self.retry_on
            )));
        }
        let (grpc_retry_on, valid) = parse_retry_grpc_on(&self.retry_grpc_on);
        if !valid {
            return Err(ConfigError::Invalid(format!(
                "Unknown retry_grpc_on condition in '{}'",
                self.retry_grpc_on
            )));
        }
        retry_on.merge(&grpc_retry_on);

        if self.base_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "base_interval_ms must be greater than 0".to_string(),
            ));
        }
        if let (Some(base), Some(max)) = (self.base_interval_ms, self.max_interval_ms) {
            if max < base {
                return Err(ConfigError::Invalid(format!(
                    "max_interval_ms ({}) must not be less than base_interval_ms ({})",
                    max, base
                )));
            }
        }
        if let Some(code) = self
            .retriable_status_codes
            .iter()
            .find(|code| !(100..=599).contains(*code))
        {
            return Err(ConfigError::Invalid(format!(
                "Retriable status code {} is not a valid HTTP status",
                code
            )));
        }
        if self.host_selection_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "host_selection_max_attempts must be at least 1".to_string(),
            ));
        }

        let retriable_headers = self
            .retriable_headers
            .iter()
            .map(HeaderMatcherYaml::to_matcher)
            .collect::<Result<Vec<_>, _>>()?;
        let retriable_request_headers = self
            .retriable_request_headers
            .iter()
            .map(HeaderMatcherYaml::to_matcher)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RetryPolicy {
            retry_on,
            num_retries: self.num_retries,
            retriable_status_codes: self.retriable_status_codes.clone(),
            retriable_headers,
            retriable_request_headers,
            reset_headers: self
                .rate_limited_reset_headers
                .iter()
                .map(|h| ResetHeaderParser::new(h.name.clone(), h.format))
                .collect(),
            max_rate_limited_interval: Duration::from_millis(self.max_rate_limited_interval_ms),
            base_interval: self.base_interval_ms.map(Duration::from_millis),
            max_interval: self.max_interval_ms.map(Duration::from_millis),
            host_selection_max_attempts: self.host_selection_max_attempts,
        })
    }
}
