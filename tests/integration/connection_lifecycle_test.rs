// Connection lifecycle tests: close reporting, GOAWAY and stream refusal

use super::test_harness::*;
use relaycore::http::{ConnectionEvent, Protocol, StreamResetReason};
use relaycore::quic::{
    ClientConnection, CloseSource, CodecOptions, GoAwayKind, RstErrorCode, ServerConnection,
    StreamError,
};

#[test]
fn test_peer_close_terminates_open_streams_once() {
    let (transport, _) = MockConnection::new();
    let mut conn = ClientConnection::new(transport, CodecOptions::default());
    assert_eq!(conn.protocol(), Protocol::Http3);

    let conn_recorder = Recorder::new();
    conn.add_connection_callbacks(conn_recorder.clone());

    let (open_decoder, _) = RecordingDecoder::new();
    let open = conn.new_stream(open_decoder).unwrap();
    let (done_decoder, _) = RecordingDecoder::new();
    let done = conn.new_stream(done_decoder).unwrap();

    let open_recorder = Recorder::new();
    let done_recorder = Recorder::new();
    conn.add_stream_callbacks(open, open_recorder.clone()).unwrap();
    conn.add_stream_callbacks(done, done_recorder.clone()).unwrap();

    conn.encode_headers(done, &get_request(), true).unwrap();
    conn.on_initial_headers_complete(done, response_head("200"), true)
        .unwrap();

    conn.on_connection_closed("PEER_GOING_AWAY", "idle timeout", CloseSource::FromPeer);
    conn.on_connection_closed("PEER_GOING_AWAY", "idle timeout", CloseSource::FromPeer);

    assert!(conn.is_closed());
    assert_eq!(conn.stream_count(), 0);
    assert_eq!(
        conn.transport_failure_reason(),
        Some("PEER_GOING_AWAY with details: idle timeout")
    );
    assert_eq!(
        open_recorder.resets(),
        vec![(StreamResetReason::ConnectionTermination, String::new())]
    );
    // The completed response needs no termination notice
    assert!(done_recorder.events().is_empty());
    assert_eq!(
        conn_recorder.events(),
        vec![Observed::Connection(ConnectionEvent::RemoteClose)]
    );
}

#[test]
fn test_closed_connection_rejects_new_streams() {
    let (transport, _) = MockConnection::new();
    let mut conn = ClientConnection::new(transport, CodecOptions::default());
    conn.close(relaycore::quic::ConnectionErrorCode::NoError, "shutdown");

    let (decoder, _) = RecordingDecoder::new();
    assert_eq!(
        conn.new_stream(decoder).unwrap_err(),
        StreamError::NotAcceptingStreams
    );
}

#[test]
fn test_server_close_always_reports_termination() {
    let (transport, _) = MockConnection::new();
    let accept_all = AcceptAll::new();
    let mut conn = ServerConnection::new(transport, CodecOptions::default(), accept_all.clone());
    let (stream, _) = MockStream::new(0);
    conn.on_new_stream(Box::new(stream)).unwrap();

    let recorder = Recorder::new();
    conn.add_stream_callbacks(0, recorder.clone()).unwrap();
    conn.on_initial_headers_complete(0, request_head(), true)
        .unwrap();

    conn.on_connection_closed("NO_ERROR", "client gone", CloseSource::FromPeer);
    assert_eq!(recorder.resets()[0].0, StreamResetReason::ConnectionTermination);
}

#[test]
fn test_go_away_refuses_new_streams() {
    let (transport, shared) = MockConnection::new();
    let accept_all = AcceptAll::new();
    let mut conn = ServerConnection::new(transport, CodecOptions::default(), accept_all.clone());

    conn.shutdown_notice();
    let (first, _) = MockStream::new(0);
    assert!(conn.on_new_stream(Box::new(first)).is_ok());

    conn.go_away();
    conn.go_away();
    let (second, second_state) = MockStream::new(4);
    assert_eq!(
        conn.on_new_stream(Box::new(second)).unwrap_err(),
        StreamError::NotAcceptingStreams
    );

    assert_eq!(second_state.lock().resets, vec![RstErrorCode::RefusedStream]);
    assert_eq!(
        shared.lock().go_aways,
        vec![GoAwayKind::Graceful, GoAwayKind::Final]
    );
    assert_eq!(conn.stream_count(), 1);
}

#[test]
fn test_events_for_unknown_streams_are_errors() {
    let (transport, _) = MockConnection::new();
    let mut conn = ClientConnection::new(transport, CodecOptions::default());
    assert_eq!(
        conn.on_body_available(40),
        Err(StreamError::UnknownStream(40))
    );
    assert_eq!(
        conn.encode_headers(40, &get_request(), true),
        Err(StreamError::UnknownStream(40))
    );
}

#[test]
fn test_stream_close_removes_stream() {
    let (transport, _) = MockConnection::new();
    let mut conn = ClientConnection::new(transport, CodecOptions::default());
    let (decoder, _) = RecordingDecoder::new();
    let id = conn.new_stream(decoder).unwrap();

    conn.on_stream_close(id).unwrap();
    assert!(conn.stream(id).is_none());
    assert_eq!(conn.on_stream_close(id), Err(StreamError::UnknownStream(id)));
}
