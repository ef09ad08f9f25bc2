//! Header matchers for retriable response headers and retriable requests

use http::{HeaderMap, Response};
use regex::Regex;

use crate::http::headers::joined_header_value;

const STATUS_PSEUDO_HEADER: &str = ":status";

/// How a header value is compared
#[derive(Debug, Clone)]
pub enum HeaderMatch {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    /// Must match the whole value
    Regex(Regex),
    /// `true`: header must be present; `false`: header must be absent
    Present(bool),
    /// Integer value in `[start, end)`
    Range { start: i64, end: i64 },
}

/// Matches one header by name. Repeated headers are joined with `,` before
/// comparison. An absent header only ever satisfies `Present(false)`, or
/// `Present(true)` when inverted.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    name: String,
    kind: HeaderMatch,
    invert: bool,
}

impl HeaderMatcher {
    pub fn new(name: impl Into<String>, kind: HeaderMatch) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            kind,
            invert: false,
        }
    }

    /// Matcher satisfied whenever the header is present
    pub fn present(name: impl Into<String>) -> Self {
        Self::new(name, HeaderMatch::Present(true))
    }

    /// Anchored regex matcher
    pub fn regex(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        let anchored = Regex::new(&format!("^(?:{})$", pattern))?;
        Ok(Self::new(name, HeaderMatch::Regex(anchored)))
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, headers: &HeaderMap) -> bool {
        self.matches_value(joined_header_value(headers, &self.name).as_deref())
    }

    /// Like [`matches`](Self::matches), also resolving `:status`
    pub fn matches_response<T>(&self, response: &Response<T>) -> bool {
        if self.name == STATUS_PSEUDO_HEADER {
            return self.matches_value(Some(response.status().as_str()));
        }
        self.matches(response.headers())
    }

    fn matches_value(&self, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return match self.kind {
                HeaderMatch::Present(expected) => !expected != self.invert,
                _ => false,
            };
        };
        let matched = match &self.kind {
            HeaderMatch::Exact(expected) => value == expected,
            HeaderMatch::Prefix(prefix) => value.starts_with(prefix.as_str()),
            HeaderMatch::Suffix(suffix) => value.ends_with(suffix.as_str()),
            HeaderMatch::Contains(needle) => value.contains(needle.as_str()),
            HeaderMatch::Regex(regex) => regex.is_match(value),
            HeaderMatch::Present(expected) => *expected,
            HeaderMatch::Range { start, end } => value
                .trim()
                .parse::<i64>()
                .map(|v| v >= *start && v < *end)
                .unwrap_or(false),
        };
        matched != self.invert
    }
}
