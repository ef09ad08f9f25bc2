// Upstream (client) stream tests: request encoding and response decoding

use super::test_harness::*;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request};
use relaycore::http::StreamResetReason;
use relaycore::quic::headers::INVALID_HEADER_FIELD;
use relaycore::quic::{ClientConnection, CodecOptions, RstErrorCode, StreamError, StreamId};

fn open() -> (ClientConnection, SharedConnection, StreamId, DecodedLog) {
    let (transport, shared) = MockConnection::new();
    let mut conn = ClientConnection::new(transport, CodecOptions::default());
    let (decoder, log) = RecordingDecoder::new();
    let id = conn.new_stream(decoder).unwrap();
    (conn, shared, id, log)
}

#[test]
fn test_encode_data_after_end_stream_is_rejected() {
    let (mut conn, shared, id, _) = open();
    conn.encode_headers(id, &get_request(), true).unwrap();

    let result = conn.encode_data(id, Bytes::from_static(b"late"), false);
    assert_eq!(result, Err(StreamError::LocalEndStreamSent));

    let stream = shared.lock().stream(id);
    assert!(stream.lock().written_body.is_empty());
    assert!(stream.lock().written_headers[0].1);
}

#[test]
fn test_request_body_and_trailers_are_written() {
    let (mut conn, shared, id, _) = open();
    conn.encode_headers(id, &get_request(), false).unwrap();
    conn.encode_data(id, Bytes::from_static(b"part"), false).unwrap();

    let mut trailers = HeaderMap::new();
    trailers.insert("x-checksum", HeaderValue::from_static("abc"));
    conn.encode_trailers(id, &trailers).unwrap();

    assert!(conn.stream(id).unwrap().local_end_stream());
    assert_eq!(
        conn.encode_trailers(id, &trailers),
        Err(StreamError::LocalEndStreamSent)
    );

    let stream = shared.lock().stream(id);
    let stream = stream.lock();
    assert_eq!(stream.written_body, vec![(Bytes::from_static(b"part"), false)]);
    assert_eq!(
        stream.written_trailers,
        vec![header_list(&[("x-checksum", "abc")])]
    );
}

#[test]
fn test_data_before_headers_is_rejected() {
    let (mut conn, _, id, _) = open();
    assert_eq!(
        conn.encode_data(id, Bytes::from_static(b"x"), true),
        Err(StreamError::HeadersNotSent)
    );
}

#[test]
fn test_connect_request_carries_bytestream_protocol() {
    let (mut conn, shared, id, _) = open();
    let connect = Request::builder()
        .method(Method::CONNECT)
        .uri("tunnel.example.com:443")
        .body(())
        .unwrap();
    conn.encode_headers(id, &connect, false).unwrap();

    let stream = shared.lock().stream(id);
    let (headers, _) = stream.lock().written_headers[0].clone();
    assert!(headers.contains(&(":protocol".to_string(), "bytestream".to_string())));
    assert!(headers.contains(&(":authority".to_string(), "tunnel.example.com:443".to_string())));
}

#[test]
fn test_response_with_body_then_fin() {
    let (mut conn, shared, id, log) = open();
    let stream = shared.lock().stream(id);

    conn.on_initial_headers_complete(id, response_head("200"), false)
        .unwrap();
    stream.lock().receive(b"hello ", false);
    conn.on_body_available(id).unwrap();
    stream.lock().receive(b"world", true);
    conn.on_body_available(id).unwrap();
    // Spurious wakeup after the end of stream
    conn.on_body_available(id).unwrap();

    assert_eq!(
        log.lock().clone(),
        vec![
            Decoded::Headers { end_stream: false },
            Decoded::Data {
                data: Bytes::from_static(b"hello "),
                end_stream: false
            },
            Decoded::Data {
                data: Bytes::from_static(b"world"),
                end_stream: true
            },
        ]
    );
    assert!(conn.stream(id).unwrap().end_stream_decoded());
}

#[test]
fn test_bare_fin_delivers_empty_end_stream() {
    let (mut conn, shared, id, log) = open();
    let stream = shared.lock().stream(id);

    conn.on_initial_headers_complete(id, response_head("200"), false)
        .unwrap();
    stream.lock().receive(b"", true);
    conn.on_body_available(id).unwrap();

    assert_eq!(
        log.lock().last(),
        Some(&Decoded::Data {
            data: Bytes::new(),
            end_stream: true
        })
    );
}

#[test]
fn test_headers_only_response_ends_once() {
    let (mut conn, shared, id, log) = open();
    let stream = shared.lock().stream(id);

    conn.on_initial_headers_complete(id, response_head("204"), true)
        .unwrap();
    stream.lock().receive(b"", true);
    conn.on_body_available(id).unwrap();

    let log = log.lock();
    assert_eq!(log.iter().filter(|d| d.ends_stream()).count(), 1);
    assert_eq!(log.len(), 1);
}

#[test]
fn test_trailers_wait_for_remaining_body() {
    let (mut conn, shared, id, log) = open();
    let stream = shared.lock().stream(id);

    conn.on_initial_headers_complete(id, response_head("200"), false)
        .unwrap();
    stream.lock().receive(b"chunk", false);
    conn.on_trailing_headers_complete(id, header_list(&[("grpc-status", "0")]))
        .unwrap();
    // Body still unread: trailers are held back
    assert_eq!(log.lock().len(), 1);

    stream.lock().receive(b"", true);
    conn.on_body_available(id).unwrap();

    let log = log.lock().clone();
    assert_eq!(log.len(), 3);
    assert_eq!(
        log[1],
        Decoded::Data {
            data: Bytes::from_static(b"chunk"),
            end_stream: false
        }
    );
    assert!(matches!(&log[2], Decoded::Trailers(t) if t["grpc-status"] == "0"));
    assert_eq!(log.iter().filter(|d| d.ends_stream()).count(), 1);
}

#[test]
fn test_end_stream_reaches_decoder_once_with_late_blocks() {
    let (mut conn, shared, id, log) = open();
    let stream = shared.lock().stream(id);

    conn.on_initial_headers_complete(id, response_head("200"), true)
        .unwrap();
    stream.lock().receive(b"", true);
    conn.on_trailing_headers_complete(id, header_list(&[("grpc-status", "0")]))
        .unwrap();
    conn.on_body_available(id).unwrap();

    let log = log.lock().clone();
    assert_eq!(log, vec![Decoded::Headers { end_stream: true }]);
    assert!(stream.lock().resets.is_empty());

    // A repeated final head is malformed
    conn.on_initial_headers_complete(id, response_head("200"), true)
        .unwrap();
    assert_eq!(
        stream.lock().resets,
        vec![RstErrorCode::BadApplicationPayload]
    );
}

#[test]
fn test_only_first_informational_response_is_forwarded() {
    let (mut conn, _, id, log) = open();

    conn.on_initial_headers_complete(id, response_head("100"), false)
        .unwrap();
    conn.on_initial_headers_complete(id, response_head("103"), false)
        .unwrap();
    conn.on_initial_headers_complete(id, response_head("100"), false)
        .unwrap();
    conn.on_initial_headers_complete(id, response_head("200"), true)
        .unwrap();

    assert_eq!(
        log.lock().clone(),
        vec![
            Decoded::Informational(100),
            Decoded::Headers { end_stream: true }
        ]
    );
}

#[test]
fn test_malformed_response_resets_stream_only() {
    let (mut conn, shared, id, log) = open();
    let recorder = Recorder::new();
    conn.add_stream_callbacks(id, recorder.clone()).unwrap();

    let mut head = response_head("200");
    head.push(("content-length".to_string(), "abc".to_string()));
    conn.on_initial_headers_complete(id, head, false).unwrap();

    assert!(!conn.is_closed());
    assert!(shared.lock().closed_with.is_none());
    assert!(log.lock().is_empty());
    assert_eq!(
        shared.lock().stream(id).lock().resets,
        vec![RstErrorCode::BadApplicationPayload]
    );
    assert_eq!(
        recorder.resets(),
        vec![(StreamResetReason::ProtocolError, INVALID_HEADER_FIELD.to_string())]
    );
}

#[test]
fn test_partial_write_resets_stream() {
    let (mut conn, shared, id, _) = open();
    let recorder = Recorder::new();
    conn.add_stream_callbacks(id, recorder.clone()).unwrap();
    shared.lock().stream(id).lock().write_limit = Some(2);

    conn.encode_headers(id, &get_request(), false).unwrap();
    conn.encode_data(id, Bytes::from_static(b"too long"), false)
        .unwrap();

    assert_eq!(
        shared.lock().stream(id).lock().resets,
        vec![RstErrorCode::BadApplicationPayload]
    );
    assert_eq!(recorder.resets()[0].0, StreamResetReason::ProtocolError);
    assert!(conn.stream(id).unwrap().is_reset());
    assert_eq!(
        conn.encode_data(id, Bytes::from_static(b"more"), false),
        Err(StreamError::StreamClosed)
    );
}

#[test]
fn test_local_reset_maps_to_cancel() {
    let (mut conn, shared, id, _) = open();
    let recorder = Recorder::new();
    conn.add_stream_callbacks(id, recorder.clone()).unwrap();

    conn.reset_stream(id, StreamResetReason::LocalReset).unwrap();
    assert_eq!(
        shared.lock().stream(id).lock().resets,
        vec![RstErrorCode::StreamCancelled]
    );
    assert_eq!(recorder.resets()[0].0, StreamResetReason::LocalReset);
}

#[test]
fn test_remote_refusal_is_reported() {
    let (mut conn, _, id, _) = open();
    let recorder = Recorder::new();
    conn.add_stream_callbacks(id, recorder.clone()).unwrap();

    conn.on_stream_reset(id, RstErrorCode::RefusedStream).unwrap();
    assert_eq!(
        recorder.resets(),
        vec![(
            StreamResetReason::RemoteRefusedStreamReset,
            "http3.remote_refuse".to_string()
        )]
    );
}

#[test]
fn test_removed_callbacks_are_not_invoked() {
    let (mut conn, _, id, _) = open();
    let kept = Recorder::new();
    let removed = Recorder::new();
    conn.add_stream_callbacks(id, kept.clone()).unwrap();
    let handle = conn.add_stream_callbacks(id, removed.clone()).unwrap();
    assert!(conn.remove_stream_callbacks(id, handle).unwrap());

    conn.on_stream_reset(id, RstErrorCode::NoError).unwrap();
    assert_eq!(kept.resets().len(), 1);
    assert!(removed.events().is_empty());
}

#[test]
fn test_read_disable_nests() {
    let (mut conn, shared, id, _) = open();
    let stream = shared.lock().stream(id);

    conn.read_disable(id, true).unwrap();
    conn.read_disable(id, true).unwrap();
    assert!(stream.lock().blocked);

    conn.read_disable(id, false).unwrap();
    assert!(stream.lock().blocked);
    conn.read_disable(id, false).unwrap();
    assert!(!stream.lock().blocked);

    // Unbalanced enable is ignored
    conn.read_disable(id, false).unwrap();
    assert_eq!(conn.stream(id).unwrap().read_disable_count(), 0);
}
