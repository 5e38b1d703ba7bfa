//! Crate-wide error types
//!
//! Each subsystem keeps its own error enum close to the code that raises
//! it (`SockoptError`, `PingError`, `HttpError`, `DemuxError`); this module
//! provides the crate-level `Error` they all convert into, plus the
//! `Result` alias used throughout.

use crate::http::HttpError;
use crate::net::SockoptError;
use crate::ping::PingError;
use crate::stream::DemuxError;

/// Crate-level result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for probe operations
///
/// Only pre-request failures (bad URL, unsupported scheme) surface through
/// this type from the probe entry points; network-level failures during a
/// probe are folded into the report's `error`/`ping_error` fields instead.
#[derive(Debug)]
pub enum Error {
    /// I/O failure outside of a report-carrying probe phase
    Io(std::io::Error),
    /// URL could not be parsed
    Url(url::ParseError),
    /// URL scheme or path is not something we can probe
    UnsupportedProtocol(String),
    /// TLS setup failure
    Tls(native_tls::Error),
    /// HTTP exchange failure
    Http(HttpError),
    /// Kernel socket statistics failure
    Sockopt(SockoptError),
    /// System ping failure
    Ping(PingError),
    /// Stream demux failure
    Demux(DemuxError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Url(e) => write!(f, "invalid url: {}", e),
            Error::UnsupportedProtocol(u) => write!(f, "unsupported protocol: {}", u),
            Error::Tls(e) => write!(f, "tls error: {}", e),
            Error::Http(e) => write!(f, "http error: {}", e),
            Error::Sockopt(e) => write!(f, "socket stats error: {}", e),
            Error::Ping(e) => write!(f, "ping error: {}", e),
            Error::Demux(e) => write!(f, "demux error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Url(e) => Some(e),
            Error::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Url(e)
    }
}

impl From<native_tls::Error> for Error {
    fn from(e: native_tls::Error) -> Self {
        Error::Tls(e)
    }
}

impl From<HttpError> for Error {
    fn from(e: HttpError) -> Self {
        Error::Http(e)
    }
}

impl From<SockoptError> for Error {
    fn from(e: SockoptError) -> Self {
        Error::Sockopt(e)
    }
}

impl From<PingError> for Error {
    fn from(e: PingError) -> Self {
        Error::Ping(e)
    }
}

impl From<DemuxError> for Error {
    fn from(e: DemuxError) -> Self {
        Error::Demux(e)
    }
}
