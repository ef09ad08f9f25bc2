//! HTTP/3 connection adapter
//!
//! Owns every open [`StreamAdapter`] of one QUIC connection, routes transport
//! events to them by [`StreamId`], and tracks the bytes all streams have
//! buffered so connection-level watermarks reach each stream.
//!
//! Connection close is reported once: every open stream gets a
//! `ConnectionTermination` reset (unless it already completed), then every
//! [`ConnectionCallbacks`] observer gets `RemoteClose` or `LocalClose`.

use bytes::Bytes;
use http::{HeaderMap, Request, Response};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::stream::{Client, Server, StreamAdapter, StreamKind};
use super::watermark::{ConnectionSendBuffer, WatermarkEdge};
use super::{
    CloseSource, CodecOptions, ConnectionErrorCode, GoAwayKind, HeaderList, RstErrorCode,
    StreamError, StreamId, TransportConnection, TransportStream,
};
use crate::http::{
    CallbackId, ConnectionCallbacks, ConnectionEvent, Protocol, StreamCallbacks, StreamDecoder,
    StreamResetReason,
};

/// Accept-side hook: supplies the decoder for each stream the peer opens
pub trait ServerConnectionCallbacks: Send + Sync {
    fn new_stream(&self, stream_id: StreamId) -> Box<dyn StreamDecoder<Request<()>>>;
}

pub struct HttpConnection<K: StreamKind> {
    transport: Box<dyn TransportConnection>,
    streams: BTreeMap<StreamId, StreamAdapter<K>>,
    send_buffer: ConnectionSendBuffer,
    /// The network connection under the codec is above its high watermark
    underlying_above: bool,
    callbacks: Vec<Arc<dyn ConnectionCallbacks>>,
    options: CodecOptions,
    server_callbacks: Option<Arc<dyn ServerConnectionCallbacks>>,
    going_away: bool,
    close_source: Option<CloseSource>,
    transport_failure_reason: Option<String>,
}

/// Upstream HTTP/3 connection
pub type ClientConnection = HttpConnection<Client>;

/// Downstream HTTP/3 connection
pub type ServerConnection = HttpConnection<Server>;

impl ConnectionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionErrorCode::NoError => "NO_ERROR",
            ConnectionErrorCode::HttpFrameError => "HTTP_FRAME_ERROR",
        }
    }
}

impl<K: StreamKind> HttpConnection<K> {
    fn with_parts(
        transport: Box<dyn TransportConnection>,
        options: CodecOptions,
        server_callbacks: Option<Arc<dyn ServerConnectionCallbacks>>,
    ) -> Self {
        Self {
            transport,
            streams: BTreeMap::new(),
            send_buffer: ConnectionSendBuffer::new(options.connection_send_buffer_high_watermark),
            underlying_above: false,
            callbacks: Vec::new(),
            options,
            server_callbacks,
            going_away: false,
            close_source: None,
            transport_failure_reason: None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::Http3
    }

    /// Whether any stream has bytes waiting to be sent
    pub fn wants_to_write(&self) -> bool {
        self.send_buffer.bytes_to_send() > 0
    }

    pub fn bytes_to_send(&self) -> u64 {
        self.send_buffer.bytes_to_send()
    }

    pub fn is_closed(&self) -> bool {
        self.close_source.is_some()
    }

    /// `"<error> with details: <details>"` once the connection closed
    pub fn transport_failure_reason(&self) -> Option<&str> {
        self.transport_failure_reason.as_deref()
    }

    pub fn add_connection_callbacks(&mut self, callbacks: Arc<dyn ConnectionCallbacks>) {
        self.callbacks.push(callbacks);
    }

    pub fn stream(&self, id: StreamId) -> Option<&StreamAdapter<K>> {
        self.streams.get(&id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut StreamAdapter<K>, StreamError> {
        self.streams
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream(id))
    }

    fn accepting_streams(&self) -> bool {
        self.close_source.is_none() && self.transport.connected()
    }

    fn insert_stream(&mut self, mut stream: StreamAdapter<K>) -> StreamId {
        let id = stream.id();
        if self.send_buffer.is_above() {
            stream.on_connection_above_high_watermark();
        }
        if self.underlying_above {
            stream.on_connection_above_high_watermark();
        }
        tracing::debug!(stream_id = id, "Stream created");
        self.streams.insert(id, stream);
        id
    }

    pub fn add_stream_callbacks(
        &mut self,
        id: StreamId,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<CallbackId, StreamError> {
        Ok(self.stream_mut(id)?.add_callbacks(callbacks))
    }

    pub fn remove_stream_callbacks(
        &mut self,
        id: StreamId,
        callback_id: CallbackId,
    ) -> Result<bool, StreamError> {
        Ok(self.stream_mut(id)?.remove_callbacks(callback_id))
    }

    pub fn encode_data(
        &mut self,
        id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream(id))?;
        let result = stream.encode_data(data, end_stream, &mut self.send_buffer);
        self.propagate_connection_watermarks();
        result
    }

    pub fn encode_trailers(&mut self, id: StreamId, trailers: &HeaderMap) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream(id))?;
        let result = stream.encode_trailers(trailers, &mut self.send_buffer);
        self.propagate_connection_watermarks();
        result
    }

    pub fn reset_stream(&mut self, id: StreamId, reason: StreamResetReason) -> Result<(), StreamError> {
        self.stream_mut(id)?.reset_stream(reason);
        Ok(())
    }

    pub fn read_disable(&mut self, id: StreamId, disable: bool) -> Result<(), StreamError> {
        self.stream_mut(id)?.read_disable(disable);
        Ok(())
    }

    /// Transport event: a header block completed on `id`. Headers that
    /// break HTTP/3 framing close the whole connection.
    pub fn on_initial_headers_complete(
        &mut self,
        id: StreamId,
        headers: HeaderList,
        fin: bool,
    ) -> Result<(), StreamError> {
        let outcome = self.stream_mut(id)?.on_initial_headers_complete(headers, fin);
        if let Err(invalid) = outcome {
            tracing::warn!(stream_id = id, details = invalid.details, "Closing connection on invalid headers");
            self.close(ConnectionErrorCode::HttpFrameError, "Invalid headers");
        }
        Ok(())
    }

    pub fn on_body_available(&mut self, id: StreamId) -> Result<(), StreamError> {
        self.stream_mut(id)?.on_body_available();
        Ok(())
    }

    pub fn on_trailing_headers_complete(
        &mut self,
        id: StreamId,
        trailers: HeaderList,
    ) -> Result<(), StreamError> {
        self.stream_mut(id)?.on_trailing_headers_complete(trailers);
        Ok(())
    }

    /// Transport event: the peer reset `id`
    pub fn on_stream_reset(&mut self, id: StreamId, code: RstErrorCode) -> Result<(), StreamError> {
        self.stream_mut(id)?.on_stream_reset(code);
        Ok(())
    }

    /// Transport event: `id` flushed part of its send buffer
    pub fn on_can_write(&mut self, id: StreamId) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream(id))?;
        stream.on_can_write(&mut self.send_buffer);
        self.propagate_connection_watermarks();
        Ok(())
    }

    /// Transport event: `id` is fully closed and will see no more events
    pub fn on_stream_close(&mut self, id: StreamId) -> Result<(), StreamError> {
        let mut stream = self
            .streams
            .remove(&id)
            .ok_or(StreamError::UnknownStream(id))?;
        stream.on_close(&mut self.send_buffer);
        tracing::debug!(stream_id = id, "Stream closed");
        self.propagate_connection_watermarks();
        Ok(())
    }

    /// Close the connection from this side
    pub fn close(&mut self, error: ConnectionErrorCode, details: &str) {
        if self.close_source.is_some() {
            return;
        }
        self.transport.close(error, details);
        self.on_connection_closed(error.as_str(), details, CloseSource::FromSelf);
    }

    /// Transport event: the connection closed. Reported to streams and
    /// observers only once.
    pub fn on_connection_closed(&mut self, error: &str, details: &str, source: CloseSource) {
        if self.close_source.is_some() {
            return;
        }
        self.close_source = Some(source);
        self.transport_failure_reason = Some(format!("{} with details: {}", error, details));
        tracing::info!(
            error = error,
            details = details,
            source = ?source,
            open_streams = self.streams.len(),
            "HTTP/3 connection closed"
        );

        for stream in self.streams.values_mut() {
            stream.on_connection_closed();
        }
        self.streams.clear();
        // Nothing buffered will be sent any more
        self.send_buffer = ConnectionSendBuffer::new(self.options.connection_send_buffer_high_watermark);

        let event = match source {
            CloseSource::FromPeer => ConnectionEvent::RemoteClose,
            CloseSource::FromSelf => ConnectionEvent::LocalClose,
        };
        for callbacks in &self.callbacks {
            callbacks.on_event(event);
        }
    }

    /// The network connection under this codec went above its high watermark
    pub fn on_underlying_connection_above_write_buffer_high_watermark(&mut self) {
        if std::mem::replace(&mut self.underlying_above, true) {
            return;
        }
        for stream in self.streams.values_mut() {
            stream.on_connection_above_high_watermark();
        }
    }

    pub fn on_underlying_connection_below_write_buffer_low_watermark(&mut self) {
        if !std::mem::replace(&mut self.underlying_above, false) {
            return;
        }
        for stream in self.streams.values_mut() {
            stream.on_connection_below_low_watermark();
        }
    }

    fn propagate_connection_watermarks(&mut self) {
        for edge in self.send_buffer.take_edges() {
            match edge {
                WatermarkEdge::High => {
                    tracing::debug!(
                        bytes_to_send = self.send_buffer.bytes_to_send(),
                        "Connection above send buffer high watermark"
                    );
                    for callbacks in &self.callbacks {
                        callbacks.on_above_write_buffer_high_watermark();
                    }
                    for stream in self.streams.values_mut() {
                        stream.on_connection_above_high_watermark();
                    }
                }
                WatermarkEdge::Low => {
                    tracing::debug!(
                        bytes_to_send = self.send_buffer.bytes_to_send(),
                        "Connection below send buffer low watermark"
                    );
                    for callbacks in &self.callbacks {
                        callbacks.on_below_write_buffer_low_watermark();
                    }
                    for stream in self.streams.values_mut() {
                        stream.on_connection_below_low_watermark();
                    }
                }
            }
        }
    }
}

impl HttpConnection<Client> {
    pub fn new(transport: Box<dyn TransportConnection>, options: CodecOptions) -> Self {
        Self::with_parts(transport, options, None)
    }

    /// Open a request stream whose response goes to `decoder`
    pub fn new_stream(
        &mut self,
        decoder: Box<dyn StreamDecoder<Response<()>>>,
    ) -> Result<StreamId, StreamError> {
        if !self.accepting_streams() {
            return Err(StreamError::NotAcceptingStreams);
        }
        let transport_stream = self
            .transport
            .create_stream()
            .ok_or(StreamError::NotAcceptingStreams)?;
        let stream = StreamAdapter::new(transport_stream, decoder, self.options.clone());
        Ok(self.insert_stream(stream))
    }

    pub fn encode_headers<T>(
        &mut self,
        id: StreamId,
        request: &Request<T>,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream(id))?;
        let result = stream.encode_headers(request, end_stream, &mut self.send_buffer);
        self.propagate_connection_watermarks();
        result
    }
}

impl HttpConnection<Server> {
    pub fn new(
        transport: Box<dyn TransportConnection>,
        options: CodecOptions,
        callbacks: Arc<dyn ServerConnectionCallbacks>,
    ) -> Self {
        Self::with_parts(transport, options, Some(callbacks))
    }

    /// Transport event: the peer opened a request stream
    pub fn on_new_stream(
        &mut self,
        mut transport_stream: Box<dyn TransportStream>,
    ) -> Result<StreamId, StreamError> {
        let server_callbacks = match &self.server_callbacks {
            Some(callbacks) if self.accepting_streams() && !self.going_away => Arc::clone(callbacks),
            _ => {
                tracing::debug!(stream_id = transport_stream.id(), "Refusing stream");
                transport_stream.reset(RstErrorCode::RefusedStream);
                return Err(StreamError::NotAcceptingStreams);
            }
        };
        let decoder = server_callbacks.new_stream(transport_stream.id());
        let stream = StreamAdapter::new(transport_stream, decoder, self.options.clone());
        Ok(self.insert_stream(stream))
    }

    pub fn encode_headers<T>(
        &mut self,
        id: StreamId,
        response: &Response<T>,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream(id))?;
        let result = stream.encode_headers(response, end_stream, &mut self.send_buffer);
        self.propagate_connection_watermarks();
        result
    }

    pub fn encode_1xx_headers<T>(
        &mut self,
        id: StreamId,
        response: &Response<T>,
    ) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream(id))?;
        let result = stream.encode_1xx_headers(response, &mut self.send_buffer);
        self.propagate_connection_watermarks();
        result
    }

    /// Stop accepting new streams
    pub fn go_away(&mut self) {
        if self.going_away {
            return;
        }
        tracing::info!("Sending GOAWAY");
        self.going_away = true;
        self.transport.send_go_away(GoAwayKind::Final);
    }

    /// Announce an upcoming shutdown; new streams are still accepted
    pub fn shutdown_notice(&mut self) {
        tracing::debug!("Sending shutdown notice");
        self.transport.send_go_away(GoAwayKind::Graceful);
    }
}

impl<K: StreamKind> std::fmt::Debug for HttpConnection<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("streams", &self.streams.len())
            .field("bytes_to_send", &self.send_buffer.bytes_to_send())
            .field("going_away", &self.going_away)
            .field("close_source", &self.close_source)
            .finish()
    }
}
