//! HTTP/3 header list conversion and validation
//!
//! Inbound header blocks arrive as ordered `(name, value)` lists with
//! pseudo-headers inline. They are validated and turned into `http` heads
//! here; outbound heads go the other way.

use http::header::{HeaderName, HeaderValue, HOST};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{CodecOptions, HeaderList, StreamError};

/// Response code details recorded on a stream
pub const INVALID_HEADER_FIELD: &str = "http3.invalid.header.field";
pub const HEADERS_TOO_LARGE: &str = "http3.headers_too_large";
pub const UNEXPECTED_UNDERSCORE: &str = "http3.unexpected_underscore";
pub const REMOTE_REFUSED: &str = "http3.remote_refuse";
pub const REMOTE_RESET: &str = "http3.remote_reset";

const ALLOWED_REQUEST_PSEUDO_HEADERS: [&str; 5] =
    [":method", ":scheme", ":authority", ":path", ":protocol"];

/// `:protocol` value sent on CONNECT requests
pub const BYTESTREAM_PROTOCOL: &str = "bytestream";

/// What to do with a request header whose name contains `_`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadersWithUnderscoresAction {
    #[default]
    Allow,
    /// Strip the offending header and keep the request
    DropHeader,
    /// Reset the stream
    RejectRequest,
}

/// Extended CONNECT `:protocol` pseudo-header, carried in request extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectProtocol(pub String);

/// An inbound header block was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid headers ({details})")]
pub struct InvalidHeaders {
    pub details: &'static str,
    /// The violation breaks HTTP/3 framing rules; the whole connection
    /// should be closed rather than just the stream
    pub close_connection: bool,
}

impl InvalidHeaders {
    fn stream(details: &'static str) -> Self {
        Self {
            details,
            close_connection: false,
        }
    }

    fn connection(details: &'static str) -> Self {
        Self {
            details,
            close_connection: true,
        }
    }
}

/// Encoded size of a header list, counting names and values
pub fn header_list_size(list: &HeaderList) -> usize {
    list.iter().map(|(name, value)| name.len() + value.len()).sum()
}

/// Whether an inbound block exceeds the configured size or count limits
pub fn exceeds_limits(list: &HeaderList, options: &CodecOptions) -> bool {
    list.len() > options.max_headers_count as usize
        || header_list_size(list) > options.max_headers_kb as usize * 1024
}

/// `content-length` may repeat as a comma list, but every entry must be
/// digits only and all entries must agree.
fn check_content_length(value: &str) -> Result<(), InvalidHeaders> {
    let mut content_length: Option<u64> = None;
    for entry in value.split(',') {
        if entry.is_empty() || !entry.bytes().all(|b| b.is_ascii_digit()) {
            tracing::debug!(value = %value, "Content length was either unparseable or negative");
            return Err(InvalidHeaders::connection(INVALID_HEADER_FIELD));
        }
        let parsed: u64 = entry
            .parse()
            .map_err(|_| InvalidHeaders::connection(INVALID_HEADER_FIELD))?;
        match content_length {
            None => content_length = Some(parsed),
            Some(previous) if previous != parsed => {
                tracing::debug!(
                    parsed = parsed,
                    previous = previous,
                    "Parsed content length is inconsistent with previously detected content length"
                );
                return Err(InvalidHeaders::stream(INVALID_HEADER_FIELD));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Character set permitted in `:authority`
pub fn is_valid_authority(value: &str) -> bool {
    value.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'-' | b'.'
                    | b'_'
                    | b'~'
                    | b'!'
                    | b'$'
                    | b'&'
                    | b'\''
                    | b'('
                    | b')'
                    | b'*'
                    | b'+'
                    | b','
                    | b';'
                    | b'='
                    | b':'
                    | b'@'
                    | b'['
                    | b']'
                    | b'%'
            )
    })
}

fn append_regular(map: &mut HeaderMap, name: &str, value: &str) -> Result<(), InvalidHeaders> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| InvalidHeaders::stream(INVALID_HEADER_FIELD))?;
    let value =
        HeaderValue::from_str(value).map_err(|_| InvalidHeaders::stream(INVALID_HEADER_FIELD))?;
    map.append(name, value);
    Ok(())
}

#[derive(Default)]
struct RequestPseudoHeaders {
    method: Option<String>,
    scheme: Option<String>,
    authority: Option<String>,
    path: Option<String>,
    protocol: Option<String>,
}

/// Validate and convert an inbound request header block
pub fn request_from_header_list(
    list: HeaderList,
    underscores: HeadersWithUnderscoresAction,
) -> Result<Request<()>, InvalidHeaders> {
    let mut pseudo = RequestPseudoHeaders::default();
    let mut headers = HeaderMap::new();

    for (name, value) in list {
        if name.starts_with(':') {
            if !ALLOWED_REQUEST_PSEUDO_HEADERS.contains(&name.as_str()) {
                tracing::debug!(header = %name, "Invalid request header");
                return Err(InvalidHeaders::connection(INVALID_HEADER_FIELD));
            }
            if name == ":authority" && !is_valid_authority(&value) {
                return Err(InvalidHeaders::connection(INVALID_HEADER_FIELD));
            }
            let slot = match name.as_str() {
                ":method" => &mut pseudo.method,
                ":scheme" => &mut pseudo.scheme,
                ":authority" => &mut pseudo.authority,
                ":path" => &mut pseudo.path,
                _ => &mut pseudo.protocol,
            };
            *slot = Some(value);
            continue;
        }

        if name.contains('_') {
            match underscores {
                HeadersWithUnderscoresAction::Allow => {}
                HeadersWithUnderscoresAction::DropHeader => {
                    tracing::debug!(header = %name, "Dropping header with invalid characters in its name");
                    continue;
                }
                HeadersWithUnderscoresAction::RejectRequest => {
                    tracing::debug!(header = %name, "Rejecting request due to header name with underscores");
                    return Err(InvalidHeaders::stream(UNEXPECTED_UNDERSCORE));
                }
            }
        }

        if name == "content-length" {
            check_content_length(&value)?;
        }
        append_regular(&mut headers, &name, &value)?;
    }

    let method = pseudo
        .method
        .as_deref()
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(InvalidHeaders::stream(INVALID_HEADER_FIELD))?;

    let uri: Result<Uri, ()> =
        match (method == Method::CONNECT && pseudo.protocol.is_none(), &pseudo.authority) {
            // Classic CONNECT: authority-form target
            (true, Some(authority)) => authority.parse::<Uri>().map_err(|_| ()),
            (_, Some(authority)) => Uri::builder()
                .scheme(pseudo.scheme.as_deref().unwrap_or("https"))
                .authority(authority.as_str())
                .path_and_query(pseudo.path.as_deref().unwrap_or("/"))
                .build()
                .map_err(|_| ()),
            (_, None) => pseudo
                .path
                .as_deref()
                .unwrap_or("/")
                .parse::<Uri>()
                .map_err(|_| ()),
        };
    let uri = uri.map_err(|_| InvalidHeaders::stream(INVALID_HEADER_FIELD))?;

    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(())
        .map_err(|_| InvalidHeaders::stream(INVALID_HEADER_FIELD))?;
    *request.headers_mut() = headers;
    if let Some(protocol) = pseudo.protocol {
        request.extensions_mut().insert(ConnectProtocol(protocol));
    }
    Ok(request)
}

/// Validate and convert an inbound response header block
pub fn response_from_header_list(list: HeaderList) -> Result<Response<()>, InvalidHeaders> {
    let mut status = None;
    let mut headers = HeaderMap::new();

    for (name, value) in list {
        if name == ":status" {
            status = value.parse::<u16>().ok().and_then(|s| StatusCode::from_u16(s).ok());
            continue;
        }
        if name.starts_with(':') {
            return Err(InvalidHeaders::stream(INVALID_HEADER_FIELD));
        }
        if name == "content-length" {
            check_content_length(&value)?;
        }
        append_regular(&mut headers, &name, &value)?;
    }

    let status = status.ok_or(InvalidHeaders::stream(INVALID_HEADER_FIELD))?;
    let mut response = Response::new(());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Convert a trailer block; pseudo-headers are not allowed in trailers
pub fn trailers_from_header_list(list: HeaderList) -> Result<HeaderMap, InvalidHeaders> {
    let mut trailers = HeaderMap::new();
    for (name, value) in list {
        if name.starts_with(':') {
            return Err(InvalidHeaders::stream(INVALID_HEADER_FIELD));
        }
        append_regular(&mut trailers, &name, &value)?;
    }
    Ok(trailers)
}

pub fn header_map_to_list(map: &HeaderMap) -> HeaderList {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Outbound request head. `:authority` falls back to the `host` header;
/// CONNECT requests always carry `:protocol: bytestream` and a `:path`.
pub fn request_to_header_list<T>(request: &Request<T>) -> Result<HeaderList, StreamError> {
    let uri = request.uri();
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            request
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or(StreamError::MissingRequiredHeader(":authority"))?;

    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let scheme = uri.scheme_str().unwrap_or("https").to_string();

    let mut list: HeaderList = vec![
        (":method".to_string(), request.method().as_str().to_string()),
        (":scheme".to_string(), scheme),
        (":authority".to_string(), authority),
        (":path".to_string(), path),
    ];
    if request.method() == Method::CONNECT {
        list.push((":protocol".to_string(), BYTESTREAM_PROTOCOL.to_string()));
    }

    list.extend(
        header_map_to_list(request.headers())
            .into_iter()
            .filter(|(name, _)| name != HOST.as_str()),
    );
    Ok(list)
}

pub fn response_to_header_list<T>(response: &Response<T>) -> HeaderList {
    let mut list: HeaderList = vec![(
        ":status".to_string(),
        response.status().as_str().to_string(),
    )];
    list.extend(header_map_to_list(response.headers()));
    list
}
