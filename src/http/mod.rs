//! Transport-agnostic HTTP stream plumbing
//!
//! The generic processing pipeline talks to streams through the traits in
//! this module only: a [`StreamDecoder`] receives parsed headers, body and
//! trailers in order, and [`StreamCallbacks`] observers learn about resets
//! and send-buffer watermarks.

pub mod callbacks;
pub mod grpc;
pub mod headers;

pub use callbacks::{CallbackId, StreamCallbackRegistry};

use bytes::Bytes;
use http::HeaderMap;
use std::fmt;

/// Why a stream ended abnormally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamResetReason {
    /// The upstream connection could not be established
    ConnectionFailure,
    /// The connection went away while the stream was open
    ConnectionTermination,
    /// Reset by this side
    LocalReset,
    /// Refused by this side before any processing
    LocalRefusedStreamReset,
    /// Resource exhaustion (e.g. pending request overflow); never retried
    Overflow,
    /// Reset by the peer
    RemoteReset,
    /// Refused by the peer before any processing
    RemoteRefusedStreamReset,
    /// CONNECT tunnel setup failed
    ConnectError,
    /// Peer violated the protocol
    ProtocolError,
}

impl StreamResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamResetReason::ConnectionFailure => "connection failure",
            StreamResetReason::ConnectionTermination => "connection termination",
            StreamResetReason::LocalReset => "local reset",
            StreamResetReason::LocalRefusedStreamReset => "local refused stream reset",
            StreamResetReason::Overflow => "overflow",
            StreamResetReason::RemoteReset => "remote reset",
            StreamResetReason::RemoteRefusedStreamReset => "remote refused stream reset",
            StreamResetReason::ConnectError => "remote error with CONNECT request",
            StreamResetReason::ProtocolError => "protocol error",
        }
    }
}

impl fmt::Display for StreamResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol spoken on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http11,
    Http2,
    Http3,
}

/// Connection-level event delivered to [`ConnectionCallbacks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    RemoteClose,
    LocalClose,
}

/// Receives the inbound half of a stream, in order: optional informational
/// headers, headers, body chunks, optional trailers. Exactly one call carries
/// end-of-stream (headers or data with `end_stream`, or trailers).
///
/// `H` is the head type: `http::Response<()>` on client streams,
/// `http::Request<()>` on server streams.
pub trait StreamDecoder<H>: Send {
    /// Informational (1xx) response headers. Only client streams see these.
    fn decode_1xx_headers(&mut self, _headers: H) {}

    fn decode_headers(&mut self, headers: H, end_stream: bool);

    fn decode_data(&mut self, data: Bytes, end_stream: bool);

    fn decode_trailers(&mut self, trailers: HeaderMap);
}

/// Observer of stream lifecycle events. Invoked synchronously, in
/// registration order.
pub trait StreamCallbacks: Send + Sync {
    fn on_reset_stream(&self, reason: StreamResetReason, details: &str);

    fn on_above_write_buffer_high_watermark(&self);

    fn on_below_write_buffer_low_watermark(&self);
}

/// Observer of connection-level events
pub trait ConnectionCallbacks: Send + Sync {
    fn on_event(&self, event: ConnectionEvent);

    fn on_above_write_buffer_high_watermark(&self) {}

    fn on_below_write_buffer_low_watermark(&self) {}
}
