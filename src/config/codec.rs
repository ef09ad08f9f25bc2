//! HTTP/3 codec configuration.

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::constants::{
    DEFAULT_CONNECTION_SEND_BUFFER_HIGH_WATERMARK, DEFAULT_MAX_HEADERS_COUNT,
    DEFAULT_MAX_HEADERS_KB, DEFAULT_STREAM_SEND_BUFFER_HIGH_WATERMARK,
};
use crate::quic::{CodecOptions, HeadersWithUnderscoresAction};

/// Largest header block accepted, in KiB
const MAX_HEADERS_KB_LIMIT: u32 = 8192;

fn default_max_request_headers_kb() -> u32 {
    DEFAULT_MAX_HEADERS_KB
}

fn default_max_request_headers_count() -> u32 {
    DEFAULT_MAX_HEADERS_COUNT
}

fn default_stream_send_buffer_high_watermark() -> u64 {
    DEFAULT_STREAM_SEND_BUFFER_HIGH_WATERMARK
}

fn default_connection_send_buffer_high_watermark() -> u64 {
    DEFAULT_CONNECTION_SEND_BUFFER_HIGH_WATERMARK
}

fn default_true() -> bool {
    true
}

/// Codec configuration (YAML format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfigYaml {
    #[serde(default = "default_max_request_headers_kb")]
    pub max_request_headers_kb: u32,
    #[serde(default = "default_max_request_headers_count")]
    pub max_request_headers_count: u32,
    #[serde(default)]
    pub headers_with_underscores_action: HeadersWithUnderscoresAction,
    /// Close the connection on malformed request headers instead of
    /// resetting only the stream
    #[serde(default = "default_true")]
    pub close_connection_on_invalid_headers: bool,
    #[serde(default = "default_stream_send_buffer_high_watermark")]
    pub stream_send_buffer_high_watermark: u64,
    #[serde(default = "default_connection_send_buffer_high_watermark")]
    pub connection_send_buffer_high_watermark: u64,
}

impl Default for CodecConfigYaml {
    fn default() -> Self {
        Self {
            max_request_headers_kb: default_max_request_headers_kb(),
            max_request_headers_count: default_max_request_headers_count(),
            headers_with_underscores_action: HeadersWithUnderscoresAction::default(),
            close_connection_on_invalid_headers: true,
            stream_send_buffer_high_watermark: default_stream_send_buffer_high_watermark(),
            connection_send_buffer_high_watermark: default_connection_send_buffer_high_watermark(),
        }
    }
}

impl CodecConfigYaml {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_request_headers_kb == 0 || self.max_request_headers_kb > MAX_HEADERS_KB_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_request_headers_kb must be between 1 and {}, got {}",
                MAX_HEADERS_KB_LIMIT, self.max_request_headers_kb
            )));
        }
        if self.max_request_headers_count == 0 {
            return Err(ConfigError::Invalid(
                "max_request_headers_count must be at least 1".to_string(),
            ));
        }
        if self.stream_send_buffer_high_watermark == 0 {
            return Err(ConfigError::Invalid(
                "stream_send_buffer_high_watermark must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_codec_options(&self) -> CodecOptions {
        CodecOptions {
            max_headers_kb: self.max_request_headers_kb,
            max_headers_count: self.max_request_headers_count,
            headers_with_underscores_action: self.headers_with_underscores_action,
            close_connection_on_invalid_headers: self.close_connection_on_invalid_headers,
            stream_send_buffer_high_watermark: self.stream_send_buffer_high_watermark,
            connection_send_buffer_high_watermark: self.connection_send_buffer_high_watermark,
        }
    }
}
