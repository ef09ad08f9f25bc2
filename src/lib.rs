// Relaycore Library
// Retry/backoff decisions for upstream requests and the HTTP/3 stream adapter

pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod quic;
pub mod resources;
pub mod retry;
pub mod runtime;
