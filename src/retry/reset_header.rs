// Rate-limit reset headers (e.g. `retry-after`, `x-ratelimit-reset`).

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::http::headers::header_str;
use crate::runtime::TimeSource;

/// How the header value encodes the reset point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetHeaderFormat {
    /// Number of seconds until the reset
    #[default]
    Seconds,
    /// Absolute reset time in seconds since the Unix epoch
    UnixTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetHeaderParser {
    name: String,
    format: ResetHeaderFormat,
}

impl ResetHeaderParser {
    pub fn new(name: impl Into<String>, format: ResetHeaderFormat) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            format,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interval until the reset, or `None` when the header is absent,
    /// unparseable, or names a point in the past.
    pub fn parse_interval(&self, time_source: &dyn TimeSource, headers: &HeaderMap) -> Option<Duration> {
        let value = header_str(headers, &self.name)?;
        let seconds: u64 = value.trim().parse().ok()?;
        match self.format {
            ResetHeaderFormat::Seconds => Some(Duration::from_secs(seconds)),
            ResetHeaderFormat::UnixTimestamp => {
                let now = u64::try_from(time_source.system_time().timestamp()).ok()?;
                seconds.checked_sub(now).map(Duration::from_secs)
            }
        }
    }
}
