// Constants module - centralized default values for configuration
//
// Defaults for retry policies, backoff, codec limits and runtime keys live
// here so the config layer and the engines agree on a single value.

// =============================================================================
// Retry defaults
// =============================================================================

/// Default number of retries granted to a request
pub const DEFAULT_NUM_RETRIES: u32 = 1;

/// Default base backoff interval in milliseconds (runtime overridable)
pub const DEFAULT_BASE_RETRY_BACKOFF_MS: u64 = 25;

/// Max interval defaults to this multiple of the base interval
pub const DEFAULT_MAX_INTERVAL_FACTOR: u64 = 10;

/// Default cap for intervals parsed from rate-limit reset headers (5 minutes)
pub const DEFAULT_MAX_RATE_LIMITED_INTERVAL_MS: u64 = 300_000;

/// Default number of host selection attempts per retry
pub const DEFAULT_HOST_SELECTION_MAX_ATTEMPTS: u32 = 1;

/// Exponent ceiling for jittered exponential backoff (2^31 * base saturates anyway)
pub const MAX_BACKOFF_EXPONENT: u32 = 31;

// =============================================================================
// Resource budget defaults
// =============================================================================

/// Default ceiling on concurrent retries per priority
pub const DEFAULT_MAX_RETRIES: u64 = 3;

// =============================================================================
// Codec defaults
// =============================================================================

/// Default maximum header block size in KiB
pub const DEFAULT_MAX_HEADERS_KB: u32 = 60;

/// Default maximum number of headers in a block
pub const DEFAULT_MAX_HEADERS_COUNT: u32 = 100;

/// Per-stream send buffer high watermark (16 KiB)
///
/// Larger than 8 KiB to fill the congestion window, no larger than the
/// stream flow control window.
pub const DEFAULT_STREAM_SEND_BUFFER_HIGH_WATERMARK: u64 = 16 * 1024;

/// Connection send buffer high watermark (1 MiB)
pub const DEFAULT_CONNECTION_SEND_BUFFER_HIGH_WATERMARK: u64 = 1024 * 1024;

// =============================================================================
// HTTP/3 status tracking
// =============================================================================

/// Initial period HTTP/3 is considered broken, in seconds (5 minutes)
pub const HTTP3_BROKEN_BASE_EXPIRATION_SECS: u64 = 5 * 60;

/// Cap on the doubling of the broken period (just under a day)
pub const HTTP3_MAX_CONSECUTIVE_BROKEN_COUNT: u32 = 8;

// =============================================================================
// Runtime keys
// =============================================================================

/// Integer key overriding the base retry backoff in milliseconds
pub const RUNTIME_BASE_RETRY_BACKOFF_MS: &str = "upstream.base_retry_backoff_ms";

/// Percentage key gating whether admitted retries are actually performed
pub const RUNTIME_USE_RETRY: &str = "upstream.use_retry";

/// Boolean key enabling early-data and alt-protocol aware retry dispositions
pub const RUNTIME_EARLY_DATA_AND_ALT_SVC: &str =
    "conn_pool_new_stream_with_early_data_and_alt_svc";
