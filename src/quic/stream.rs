//! Per-stream adapter between a QUIC transport stream and the HTTP pipeline
//!
//! # Inbound
//!
//! Header blocks are validated and converted before reaching the decoder; a
//! block that fails validation never does. End of stream is delivered to the
//! decoder exactly once, on whichever of headers, data or trailers carries
//! it. Trailers wait until every body byte has been delivered.
//!
//! # Outbound
//!
//! Encoding after the local end of stream is an error. The transport must
//! take every body byte offered; a partial write resets the stream.
//!
//! # Watermarks
//!
//! A stream is above its high watermark while either its own send buffer or
//! the connection's send buffer is. Stream callbacks see only the combined
//! transitions.

use bytes::Bytes;
use http::{HeaderMap, Request, Response};
use std::marker::PhantomData;
use std::sync::Arc;

use super::headers::{
    self, InvalidHeaders, HEADERS_TOO_LARGE, INVALID_HEADER_FIELD, REMOTE_REFUSED, REMOTE_RESET,
};
use super::watermark::{ConnectionSendBuffer, SendBufferWatermark, WatermarkEdge, WatermarkSources};
use super::{CodecOptions, HeaderList, RstErrorCode, StreamError, StreamId, TransportStream};
use crate::http::{CallbackId, StreamCallbackRegistry, StreamCallbacks, StreamDecoder, StreamResetReason};

/// Which end of the connection a stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Role-specific inbound behaviour
pub trait StreamKind: Send + 'static {
    /// Head type handed to the decoder
    type Inbound: Send;

    const ROLE: Role;

    fn convert_inbound(
        list: HeaderList,
        options: &CodecOptions,
    ) -> Result<Self::Inbound, InvalidHeaders>;

    /// Informational (1xx) heads are delivered through
    /// [`StreamDecoder::decode_1xx_headers`]
    fn is_informational(_head: &Self::Inbound) -> bool {
        false
    }
}

/// Upstream side: sends requests, receives responses
#[derive(Debug)]
pub enum Client {}

/// Downstream side: receives requests, sends responses
#[derive(Debug)]
pub enum Server {}

impl StreamKind for Client {
    type Inbound = Response<()>;

    const ROLE: Role = Role::Client;

    fn convert_inbound(
        list: HeaderList,
        _options: &CodecOptions,
    ) -> Result<Response<()>, InvalidHeaders> {
        headers::response_from_header_list(list)
    }

    fn is_informational(head: &Response<()>) -> bool {
        head.status().is_informational()
    }
}

impl StreamKind for Server {
    type Inbound = Request<()>;

    const ROLE: Role = Role::Server;

    fn convert_inbound(
        list: HeaderList,
        options: &CodecOptions,
    ) -> Result<Request<()>, InvalidHeaders> {
        headers::request_from_header_list(list, options.headers_with_underscores_action)
    }
}

pub struct StreamAdapter<K: StreamKind> {
    transport: Box<dyn TransportStream>,
    decoder: Box<dyn StreamDecoder<K::Inbound>>,
    callbacks: StreamCallbackRegistry,
    options: CodecOptions,
    send_buffer: SendBufferWatermark,
    watermark_sources: WatermarkSources,
    /// Last buffered byte count reported to the connection
    buffered_bytes: u64,
    headers_sent: bool,
    local_end_stream: bool,
    headers_decoded: bool,
    end_stream_decoded: bool,
    decoded_1xx: bool,
    trailers_received: bool,
    pending_trailers: Option<HeaderMap>,
    reset: bool,
    read_disable_counter: u32,
    details: Option<&'static str>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: StreamKind> StreamAdapter<K> {
    pub fn new(
        transport: Box<dyn TransportStream>,
        decoder: Box<dyn StreamDecoder<K::Inbound>>,
        options: CodecOptions,
    ) -> Self {
        let send_buffer = SendBufferWatermark::new(options.stream_send_buffer_high_watermark);
        Self {
            transport,
            decoder,
            callbacks: StreamCallbackRegistry::new(),
            options,
            send_buffer,
            watermark_sources: WatermarkSources::default(),
            buffered_bytes: 0,
            headers_sent: false,
            local_end_stream: false,
            headers_decoded: false,
            end_stream_decoded: false,
            decoded_1xx: false,
            trailers_received: false,
            pending_trailers: None,
            reset: false,
            read_disable_counter: 0,
            details: None,
            _kind: PhantomData,
        }
    }

    pub fn id(&self) -> StreamId {
        self.transport.id()
    }

    pub fn add_callbacks(&mut self, callbacks: Arc<dyn StreamCallbacks>) -> CallbackId {
        self.callbacks.add(callbacks)
    }

    pub fn remove_callbacks(&mut self, id: CallbackId) -> bool {
        self.callbacks.remove(id)
    }

    /// Response code details recorded for the stream, if any
    pub fn details(&self) -> Option<&'static str> {
        self.details
    }

    pub fn local_end_stream(&self) -> bool {
        self.local_end_stream
    }

    pub fn end_stream_decoded(&self) -> bool {
        self.end_stream_decoded
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    pub fn above_write_buffer_high_watermark(&self) -> bool {
        self.watermark_sources.is_above()
    }

    pub fn read_disable_count(&self) -> u32 {
        self.read_disable_counter
    }

    /// Disable (or re-enable) reading. Calls nest; the transport is only
    /// blocked on the first disable and unblocked on the matching last enable.
    pub fn read_disable(&mut self, disable: bool) {
        if disable {
            self.read_disable_counter += 1;
            if self.read_disable_counter == 1 {
                self.transport.set_blocked(true);
            }
        } else {
            if self.read_disable_counter == 0 {
                tracing::warn!(stream_id = self.id(), "read_disable(false) without a matching disable");
                return;
            }
            self.read_disable_counter -= 1;
            if self.read_disable_counter == 0 {
                self.transport.set_blocked(false);
            }
        }
    }

    fn check_writable(&self) -> Result<(), StreamError> {
        if self.reset {
            return Err(StreamError::StreamClosed);
        }
        if self.local_end_stream {
            return Err(StreamError::LocalEndStreamSent);
        }
        Ok(())
    }

    fn write_head(
        &mut self,
        list: HeaderList,
        end_stream: bool,
        conn: &mut ConnectionSendBuffer,
    ) {
        self.transport.write_headers(list, end_stream);
        self.local_end_stream = end_stream;
        self.maybe_check_watermark(conn);
    }

    pub fn encode_data(
        &mut self,
        data: Bytes,
        end_stream: bool,
        conn: &mut ConnectionSendBuffer,
    ) -> Result<(), StreamError> {
        self.check_writable()?;
        if !self.headers_sent {
            return Err(StreamError::HeadersNotSent);
        }
        tracing::debug!(stream_id = self.id(), bytes = data.len(), end_stream = end_stream, "encodeData");
        if data.is_empty() && !end_stream {
            return Ok(());
        }
        self.local_end_stream = end_stream;

        let offered = data.len();
        let accepted = self.transport.write_body(data, end_stream);
        if accepted < offered {
            tracing::warn!(
                stream_id = self.id(),
                offered = offered,
                accepted = accepted,
                "Send buffer did not take all the data, resetting stream"
            );
            self.reset_with_code(RstErrorCode::BadApplicationPayload);
            return Ok(());
        }
        self.maybe_check_watermark(conn);
        Ok(())
    }

    /// Send trailers and end the stream. Trailers straight after headers,
    /// with no body in between, are allowed.
    pub fn encode_trailers(
        &mut self,
        trailers: &HeaderMap,
        conn: &mut ConnectionSendBuffer,
    ) -> Result<(), StreamError> {
        self.check_writable()?;
        if !self.headers_sent {
            return Err(StreamError::HeadersNotSent);
        }
        tracing::debug!(stream_id = self.id(), "encodeTrailers");
        self.local_end_stream = true;
        self.transport
            .write_trailers(headers::header_map_to_list(trailers));
        self.maybe_check_watermark(conn);
        Ok(())
    }

    /// Reset requested by the pipeline. Reset callbacks run before this
    /// returns.
    pub fn reset_stream(&mut self, reason: StreamResetReason) {
        if K::ROLE == Role::Server && self.local_end_stream && !self.transport.reading_stopped() {
            // The response is complete (e.g. an early reply); only stop
            // reading so the peer sees NO_ERROR instead of `reason`.
            self.callbacks
                .run_reset_callbacks(reason, self.details.unwrap_or_default());
            self.transport.stop_reading();
            return;
        }
        self.reset_with_code(RstErrorCode::from_reset_reason(reason));
    }

    fn reset_with_code(&mut self, code: RstErrorCode) {
        tracing::debug!(stream_id = self.id(), code = ?code, "Resetting stream");
        self.reset = true;
        self.callbacks
            .run_reset_callbacks(code.to_local_reset_reason(), self.details.unwrap_or_default());
        self.transport.reset(code);
    }

    /// A complete header block arrived. Returns `Err` when the block breaks
    /// framing rules badly enough that the connection must be closed.
    pub fn on_initial_headers_complete(
        &mut self,
        list: HeaderList,
        fin: bool,
    ) -> Result<(), InvalidHeaders> {
        if self.transport.read_side_closed() {
            return Ok(());
        }
        tracing::debug!(stream_id = self.id(), fin = fin, headers = list.len(), "Received headers");

        // Later header blocks arrive as trailers; a second head is malformed.
        if self.headers_decoded {
            tracing::warn!(stream_id = self.id(), "Header block after final headers, resetting stream");
            self.details = Some(INVALID_HEADER_FIELD);
            self.reset_with_code(RstErrorCode::BadApplicationPayload);
            return Ok(());
        }

        if headers::exceeds_limits(&list, &self.options) {
            self.details = Some(HEADERS_TOO_LARGE);
            self.reset_with_code(RstErrorCode::HeadersTooLarge);
            return Ok(());
        }

        let head = match K::convert_inbound(list, &self.options) {
            Ok(head) => head,
            Err(invalid) => {
                self.details = Some(invalid.details);
                if K::ROLE == Role::Server
                    && invalid.close_connection
                    && self.options.close_connection_on_invalid_headers
                {
                    return Err(invalid);
                }
                self.reset_with_code(RstErrorCode::BadApplicationPayload);
                return Ok(());
            }
        };

        if K::is_informational(&head) {
            // Only the first informational response is forwarded, enough
            // for Expect: 100-continue.
            if !self.decoded_1xx {
                self.decoded_1xx = true;
                self.decoder.decode_1xx_headers(head);
            }
            return Ok(());
        }

        self.headers_decoded = true;
        if fin {
            self.end_stream_decoded = true;
        }
        self.decoder.decode_headers(head, fin);
        Ok(())
    }

    /// Body bytes (or FIN) became readable
    pub fn on_body_available(&mut self) {
        if self.transport.read_side_closed() || !self.headers_decoded {
            return;
        }

        let data = self.transport.read_available();
        let fin_read_and_no_trailers =
            self.transport.sequencer_closed() && self.pending_trailers.is_none();
        // An empty read without FIN, or anything after end of stream was
        // already delivered with headers or trailers, is not forwarded.
        let skip = (data.is_empty() && !fin_read_and_no_trailers) || self.end_stream_decoded;
        if !skip {
            if fin_read_and_no_trailers {
                self.end_stream_decoded = true;
            }
            tracing::debug!(
                stream_id = self.id(),
                bytes = data.len(),
                end_stream = fin_read_and_no_trailers,
                "decodeData"
            );
            self.decoder.decode_data(data, fin_read_and_no_trailers);
        }

        if !self.transport.sequencer_closed() || self.transport.read_side_closed() {
            return;
        }
        self.maybe_decode_trailers();
    }

    pub fn on_trailing_headers_complete(&mut self, list: HeaderList) {
        if self.transport.read_side_closed() {
            return;
        }
        tracing::debug!(stream_id = self.id(), headers = list.len(), "Received trailers");
        if self.end_stream_decoded || self.trailers_received {
            tracing::warn!(stream_id = self.id(), "Trailers after end of stream ignored");
            return;
        }
        self.trailers_received = true;
        match headers::trailers_from_header_list(list) {
            Ok(trailers) => self.pending_trailers = Some(trailers),
            Err(invalid) => {
                self.details = Some(invalid.details);
                self.reset_with_code(RstErrorCode::BadApplicationPayload);
                return;
            }
        }
        if !self.reset {
            self.maybe_decode_trailers();
        }
    }

    fn maybe_decode_trailers(&mut self) {
        if self.end_stream_decoded || !self.transport.sequencer_closed() {
            return;
        }
        if let Some(trailers) = self.pending_trailers.take() {
            self.end_stream_decoded = true;
            tracing::debug!(stream_id = self.id(), "decodeTrailers");
            self.decoder.decode_trailers(trailers);
        }
    }

    /// The peer reset the stream
    pub fn on_stream_reset(&mut self, code: RstErrorCode) {
        let reason = code.to_remote_reset_reason();
        match reason {
            StreamResetReason::RemoteReset | StreamResetReason::ConnectError => {
                self.details = Some(REMOTE_RESET)
            }
            StreamResetReason::RemoteRefusedStreamReset => self.details = Some(REMOTE_REFUSED),
            _ => {}
        }
        tracing::debug!(stream_id = self.id(), code = ?code, reason = %reason, "Stream reset by peer");
        self.reset = true;
        self.callbacks
            .run_reset_callbacks(reason, self.details.unwrap_or_default());
    }

    /// The connection closed under the stream
    pub fn on_connection_closed(&mut self) {
        // A server stream is never complete before its response is, so it
        // always reports termination; reset callbacks run at most once.
        if K::ROLE == Role::Server || !self.end_stream_decoded {
            self.callbacks.run_reset_callbacks(
                StreamResetReason::ConnectionTermination,
                self.details.unwrap_or_default(),
            );
        }
        self.reset = true;
    }

    /// The transport flushed some of its send buffer
    pub fn on_can_write(&mut self, conn: &mut ConnectionSendBuffer) {
        self.maybe_check_watermark(conn);
    }

    /// The transport is done with the stream. Bytes still buffered will
    /// never be sent and stop counting against the connection.
    pub fn on_close(&mut self, conn: &mut ConnectionSendBuffer) {
        if self.buffered_bytes > 0 {
            conn.adjust_bytes_to_send(-(self.buffered_bytes as i64));
            self.buffered_bytes = 0;
        }
    }

    pub fn on_connection_above_high_watermark(&mut self) {
        self.raise_watermark();
    }

    pub fn on_connection_below_low_watermark(&mut self) {
        self.lower_watermark();
    }

    fn maybe_check_watermark(&mut self, conn: &mut ConnectionSendBuffer) {
        let new = self.transport.buffered_bytes();
        let old = std::mem::replace(&mut self.buffered_bytes, new);
        if old == new {
            return;
        }
        match self.send_buffer.check(old, new) {
            Some(WatermarkEdge::High) => self.raise_watermark(),
            Some(WatermarkEdge::Low) => self.lower_watermark(),
            None => {}
        }
        conn.adjust_bytes_to_send(new as i64 - old as i64);
    }

    fn raise_watermark(&mut self) {
        if self.watermark_sources.raise() {
            tracing::debug!(stream_id = self.id(), "Above write buffer high watermark");
            self.callbacks.run_high_watermark_callbacks();
        }
    }

    fn lower_watermark(&mut self) {
        if self.watermark_sources.lower() {
            tracing::debug!(stream_id = self.id(), "Below write buffer low watermark");
            self.callbacks.run_low_watermark_callbacks();
        }
    }
}

impl StreamAdapter<Client> {
    /// Send the request head. CONNECT requests get `:protocol: bytestream`.
    pub fn encode_headers<T>(
        &mut self,
        request: &Request<T>,
        end_stream: bool,
        conn: &mut ConnectionSendBuffer,
    ) -> Result<(), StreamError> {
        self.check_writable()?;
        if self.headers_sent {
            return Err(StreamError::HeadersAlreadySent);
        }
        let list = headers::request_to_header_list(request)?;
        tracing::debug!(stream_id = self.id(), end_stream = end_stream, method = %request.method(), "encodeHeaders");
        self.headers_sent = true;
        self.write_head(list, end_stream, conn);
        Ok(())
    }
}

impl StreamAdapter<Server> {
    pub fn encode_headers<T>(
        &mut self,
        response: &Response<T>,
        end_stream: bool,
        conn: &mut ConnectionSendBuffer,
    ) -> Result<(), StreamError> {
        self.check_writable()?;
        if self.headers_sent {
            return Err(StreamError::HeadersAlreadySent);
        }
        tracing::debug!(stream_id = self.id(), end_stream = end_stream, status = %response.status(), "encodeHeaders");
        self.headers_sent = true;
        self.write_head(headers::response_to_header_list(response), end_stream, conn);
        Ok(())
    }

    /// Send an informational response ahead of the final one
    pub fn encode_1xx_headers<T>(
        &mut self,
        response: &Response<T>,
        conn: &mut ConnectionSendBuffer,
    ) -> Result<(), StreamError> {
        self.check_writable()?;
        if self.headers_sent {
            return Err(StreamError::HeadersAlreadySent);
        }
        if !response.status().is_informational() {
            return Err(StreamError::InvalidInformationalStatus(response.status().as_u16()));
        }
        self.write_head(headers::response_to_header_list(response), false, conn);
        Ok(())
    }
}

impl<K: StreamKind> std::fmt::Debug for StreamAdapter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAdapter")
            .field("id", &self.id())
            .field("role", &K::ROLE)
            .field("local_end_stream", &self.local_end_stream)
            .field("end_stream_decoded", &self.end_stream_decoded)
            .field("reset", &self.reset)
            .finish()
    }
}
