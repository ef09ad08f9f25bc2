//! HTTP/3 stream and connection adaptation
//!
//! The QUIC transport (framing, flow control, TLS) lives behind the
//! [`TransportStream`] and [`TransportConnection`] traits. This module turns
//! the transport's stream lifecycle into the transport-agnostic
//! [`StreamDecoder`](crate::http::StreamDecoder) /
//! [`StreamCallbacks`](crate::http::StreamCallbacks) contract used by the
//! HTTP pipeline.
//!
//! Streams live in an arena inside [`HttpConnection`], keyed by
//! [`StreamId`]. The transport reports events (`on_initial_headers_complete`,
//! `on_body_available`, ...) against an id; the pipeline encodes through the
//! same ids.

pub mod connection;
pub mod headers;
pub mod http3_status;
pub mod stream;
pub mod watermark;

pub use connection::{ClientConnection, HttpConnection, ServerConnection, ServerConnectionCallbacks};
pub use headers::HeadersWithUnderscoresAction;
pub use http3_status::{Http3Status, Http3StatusTracker};
pub use stream::{Client, Server, StreamAdapter, StreamKind};

use bytes::Bytes;
use thiserror::Error;

use crate::constants::{
    DEFAULT_CONNECTION_SEND_BUFFER_HIGH_WATERMARK, DEFAULT_MAX_HEADERS_COUNT,
    DEFAULT_MAX_HEADERS_KB, DEFAULT_STREAM_SEND_BUFFER_HIGH_WATERMARK,
};
use crate::http::StreamResetReason;

/// QUIC stream identifier
pub type StreamId = u64;

/// Decoded HTTP/3 header block as (name, value) pairs, names lowercase
pub type HeaderList = Vec<(String, String)>;

/// Application error codes carried in RESET_STREAM / STOP_SENDING
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RstErrorCode {
    NoError,
    RefusedStream,
    StreamCancelled,
    /// Connection-level failure surfaced on a stream
    StreamConnectionError,
    /// CONNECT tunnel setup failed
    StreamConnectError,
    BadApplicationPayload,
    HeadersTooLarge,
}

impl RstErrorCode {
    /// Code sent to the peer when the pipeline resets a stream
    pub fn from_reset_reason(reason: StreamResetReason) -> Self {
        match reason {
            StreamResetReason::LocalRefusedStreamReset => RstErrorCode::RefusedStream,
            StreamResetReason::ConnectionFailure | StreamResetReason::ConnectionTermination => {
                RstErrorCode::StreamConnectionError
            }
            StreamResetReason::LocalReset => RstErrorCode::StreamCancelled,
            _ => RstErrorCode::BadApplicationPayload,
        }
    }

    /// Reason reported to callbacks when this side sent the code
    pub fn to_local_reset_reason(self) -> StreamResetReason {
        match self {
            RstErrorCode::RefusedStream => StreamResetReason::LocalRefusedStreamReset,
            RstErrorCode::StreamConnectionError => StreamResetReason::ConnectionFailure,
            RstErrorCode::BadApplicationPayload => StreamResetReason::ProtocolError,
            _ => StreamResetReason::LocalReset,
        }
    }

    /// Reason reported to callbacks when the peer sent the code
    pub fn to_remote_reset_reason(self) -> StreamResetReason {
        match self {
            RstErrorCode::RefusedStream => StreamResetReason::RemoteRefusedStreamReset,
            RstErrorCode::StreamConnectionError | RstErrorCode::StreamConnectError => {
                StreamResetReason::ConnectError
            }
            _ => StreamResetReason::RemoteReset,
        }
    }
}

/// Connection-level error codes this layer asks the transport to close with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorCode {
    NoError,
    /// Malformed HTTP/3 frame contents (e.g. illegal pseudo-header)
    HttpFrameError,
}

/// Which side initiated a connection close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSource {
    FromPeer,
    FromSelf,
}

/// GOAWAY flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayKind {
    /// Advertise the intent to shut down; in-flight and racing streams still complete
    Graceful,
    /// Stop accepting new streams
    Final,
}

/// Errors returned by stream and connection operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("local end of stream already sent")]
    LocalEndStreamSent,

    #[error("headers have not been sent yet")]
    HeadersNotSent,

    #[error("headers already sent")]
    HeadersAlreadySent,

    #[error("missing required header: {0}")]
    MissingRequiredHeader(&'static str),

    #[error("status {0} is not informational")]
    InvalidInformationalStatus(u16),

    #[error("stream is closed")]
    StreamClosed,

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("connection is not accepting new streams")]
    NotAcceptingStreams,
}

/// Codec limits and policies shared by every stream of a connection
#[derive(Debug, Clone)]
pub struct CodecOptions {
    pub max_headers_kb: u32,
    pub max_headers_count: u32,
    pub headers_with_underscores_action: HeadersWithUnderscoresAction,
    /// Close the connection, instead of resetting the stream, on headers
    /// that violate HTTP/3 framing rules. Server side only.
    pub close_connection_on_invalid_headers: bool,
    pub stream_send_buffer_high_watermark: u64,
    pub connection_send_buffer_high_watermark: u64,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            max_headers_kb: DEFAULT_MAX_HEADERS_KB,
            max_headers_count: DEFAULT_MAX_HEADERS_COUNT,
            headers_with_underscores_action: HeadersWithUnderscoresAction::default(),
            close_connection_on_invalid_headers: true,
            stream_send_buffer_high_watermark: DEFAULT_STREAM_SEND_BUFFER_HIGH_WATERMARK,
            connection_send_buffer_high_watermark: DEFAULT_CONNECTION_SEND_BUFFER_HIGH_WATERMARK,
        }
    }
}

/// One bidirectional QUIC stream as seen by this layer.
///
/// Implementations own the transport's send buffer and receive sequencer.
pub trait TransportStream: Send {
    fn id(&self) -> StreamId;

    fn write_headers(&mut self, headers: HeaderList, fin: bool);

    /// Offer body bytes to the send buffer; returns how many were accepted
    fn write_body(&mut self, data: Bytes, fin: bool) -> usize;

    fn write_trailers(&mut self, trailers: HeaderList);

    /// Bytes written but not yet handed to the network
    fn buffered_bytes(&self) -> u64;

    /// Consume every currently readable body byte
    fn read_available(&mut self) -> Bytes;

    /// All body bytes up to FIN have been consumed
    fn sequencer_closed(&self) -> bool;

    /// Stop (or resume) delivering body bytes to this layer
    fn set_blocked(&mut self, blocked: bool);

    /// Send RESET_STREAM (and STOP_SENDING) with `code`
    fn reset(&mut self, code: RstErrorCode);

    /// Send STOP_SENDING with NO_ERROR and discard further inbound data
    fn stop_reading(&mut self);

    fn reading_stopped(&self) -> bool;

    fn read_side_closed(&self) -> bool;
}

/// The QUIC connection under an [`HttpConnection`]
pub trait TransportConnection: Send {
    /// Open an outgoing bidirectional stream; `None` when stream limits
    /// or connection state forbid it
    fn create_stream(&mut self) -> Option<Box<dyn TransportStream>>;

    fn send_go_away(&mut self, kind: GoAwayKind);

    fn close(&mut self, error: ConnectionErrorCode, details: &str);

    fn connected(&self) -> bool;
}
