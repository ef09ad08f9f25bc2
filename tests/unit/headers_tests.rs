// HTTP/3 header block conversion unit tests

use http::{Method, Request, Response};
use relaycore::quic::headers::*;
use relaycore::quic::{CodecOptions, HeaderList, StreamError};

fn list(entries: &[(&str, &str)]) -> HeaderList {
    entries
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
}

fn get_request(extra: &[(&str, &str)]) -> HeaderList {
    let mut headers = list(&[
        (":method", "GET"),
        (":scheme", "https"),
        (":authority", "origin.example.com"),
        (":path", "/objects/1?v=2"),
    ]);
    headers.extend(list(extra));
    headers
}

#[test]
fn test_request_from_valid_header_list() {
    let request = request_from_header_list(
        get_request(&[("accept", "*/*")]),
        HeadersWithUnderscoresAction::Allow,
    )
    .unwrap();
    assert_eq!(request.method(), Method::GET);
    assert_eq!(request.uri().host(), Some("origin.example.com"));
    assert_eq!(request.uri().path(), "/objects/1");
    assert_eq!(request.uri().query(), Some("v=2"));
    assert_eq!(request.headers()["accept"], "*/*");
}

#[test]
fn test_unknown_pseudo_header_closes_connection() {
    let err = request_from_header_list(
        get_request(&[(":status", "200")]),
        HeadersWithUnderscoresAction::Allow,
    )
    .unwrap_err();
    assert!(err.close_connection);
    assert_eq!(err.details, INVALID_HEADER_FIELD);
}

#[test]
fn test_invalid_authority_closes_connection() {
    let headers = list(&[
        (":method", "GET"),
        (":scheme", "https"),
        (":authority", "bad host"),
        (":path", "/"),
    ]);
    let err = request_from_header_list(headers, HeadersWithUnderscoresAction::Allow).unwrap_err();
    assert!(err.close_connection);
}

#[test]
fn test_authority_charset() {
    assert!(is_valid_authority("user@[::1]:8443"));
    assert!(is_valid_authority("a-b.example.com:80"));
    assert!(!is_valid_authority("a b"));
    assert!(!is_valid_authority("a/b"));
    assert!(!is_valid_authority("a\"b"));
}

#[test]
fn test_underscore_actions() {
    let headers = get_request(&[("x_trace", "1"), ("x-keep", "1")]);

    let allowed =
        request_from_header_list(headers.clone(), HeadersWithUnderscoresAction::Allow).unwrap();
    assert!(allowed.headers().contains_key("x_trace"));

    let dropped =
        request_from_header_list(headers.clone(), HeadersWithUnderscoresAction::DropHeader)
            .unwrap();
    assert!(!dropped.headers().contains_key("x_trace"));
    assert!(dropped.headers().contains_key("x-keep"));

    let err = request_from_header_list(headers, HeadersWithUnderscoresAction::RejectRequest)
        .unwrap_err();
    assert_eq!(err.details, UNEXPECTED_UNDERSCORE);
    assert!(!err.close_connection);
}

#[test]
fn test_content_length_rules() {
    let agreeing = get_request(&[("content-length", "5,5")]);
    assert!(request_from_header_list(agreeing, HeadersWithUnderscoresAction::Allow).is_ok());

    let disagreeing = get_request(&[("content-length", "5,6")]);
    let err =
        request_from_header_list(disagreeing, HeadersWithUnderscoresAction::Allow).unwrap_err();
    assert!(!err.close_connection);

    for bad in ["-1", "5,", "abc", "5, 5"] {
        let unparseable = get_request(&[("content-length", bad)]);
        let err = request_from_header_list(unparseable, HeadersWithUnderscoresAction::Allow)
            .unwrap_err();
        assert!(err.close_connection, "content-length {:?}", bad);
    }
}

#[test]
fn test_extended_connect_keeps_protocol() {
    let headers = list(&[
        (":method", "CONNECT"),
        (":protocol", "websocket"),
        (":scheme", "https"),
        (":authority", "chat.example.com"),
        (":path", "/socket"),
    ]);
    let request = request_from_header_list(headers, HeadersWithUnderscoresAction::Allow).unwrap();
    assert_eq!(
        request.extensions().get::<ConnectProtocol>(),
        Some(&ConnectProtocol("websocket".to_string()))
    );
    assert_eq!(request.uri().path(), "/socket");
}

#[test]
fn test_response_requires_status() {
    let err = response_from_header_list(list(&[("server", "upstream")])).unwrap_err();
    assert_eq!(err.details, INVALID_HEADER_FIELD);

    let response = response_from_header_list(list(&[(":status", "103"), ("link", "</a>")])).unwrap();
    assert_eq!(response.status().as_u16(), 103);
}

#[test]
fn test_trailers_reject_pseudo_headers() {
    assert!(trailers_from_header_list(list(&[("grpc-status", "0")])).is_ok());
    assert!(trailers_from_header_list(list(&[(":path", "/")])).is_err());
}

#[test]
fn test_limits() {
    let options = CodecOptions {
        max_headers_kb: 1,
        max_headers_count: 3,
        ..CodecOptions::default()
    };
    assert!(!exceeds_limits(&list(&[("a", "b")]), &options));
    assert!(exceeds_limits(
        &list(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]),
        &options
    ));
    let big = "v".repeat(1100);
    assert!(exceeds_limits(&list(&[("a", big.as_str())]), &options));
}

#[test]
fn test_request_to_header_list_uses_host_fallback() {
    let request = Request::builder()
        .uri("/upload")
        .header("host", "origin.example.com")
        .header("x-request-id", "abc")
        .body(())
        .unwrap();
    let headers = request_to_header_list(&request).unwrap();
    assert_eq!(headers[2], (":authority".to_string(), "origin.example.com".to_string()));
    assert_eq!(headers[3], (":path".to_string(), "/upload".to_string()));
    assert!(headers.iter().all(|(name, _)| name != "host"));
    assert!(headers.iter().any(|(name, _)| name == "x-request-id"));
}

#[test]
fn test_request_without_authority_is_rejected() {
    let request = Request::builder().uri("/").body(()).unwrap();
    assert_eq!(
        request_to_header_list(&request).unwrap_err(),
        StreamError::MissingRequiredHeader(":authority")
    );
}

#[test]
fn test_connect_request_gets_bytestream_protocol() {
    let request = Request::builder()
        .method(Method::CONNECT)
        .uri("proxy.example.com:443")
        .body(())
        .unwrap();
    let headers = request_to_header_list(&request).unwrap();
    assert!(headers.contains(&(":protocol".to_string(), BYTESTREAM_PROTOCOL.to_string())));
    assert!(headers.contains(&(":path".to_string(), "/".to_string())));
}

#[test]
fn test_response_to_header_list_leads_with_status() {
    let response = Response::builder()
        .status(204)
        .header("cache-control", "no-store")
        .body(())
        .unwrap();
    let headers = response_to_header_list(&response);
    assert_eq!(headers[0], (":status".to_string(), "204".to_string()));
    assert_eq!(headers.len(), 2);
}
