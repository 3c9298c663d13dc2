//! Top-level and per-connection error types
//!
//! `ProxyError` is what escapes `triproxy-core` entirely: bind failures
//! and fatal accept-loop errors that `triproxy-cli` maps to a process
//! exit code. `ConnectionError` never leaves a connection task; every
//! fallible step of the dispatch/handshake/pump pipeline collapses into
//! one of its variants so the dispatcher can log a single structured
//! failure and move on to the next connection without the handler task
//! ever panicking.

use crate::auth::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("accept loop terminated: {0}")]
    AcceptFailed(std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client closed the connection before a request could be read")]
    ClientClosedEarly,

    #[error("malformed HTTP request: {0}")]
    MalformedHttpRequest(String),

    #[error("malformed SOCKS5 request: {0}")]
    MalformedSocks5Request(String),

    #[error("unsupported SOCKS5 command: 0x{0:02x}")]
    UnsupportedSocks5Command(u8),

    #[error("no acceptable SOCKS5 authentication method offered by client")]
    Socks5AuthMethodRejected,

    #[error("SOCKS5 authentication failed")]
    Socks5AuthFailed,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("failed to connect to upstream {host}:{port}: {source}")]
    UpstreamConnect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

impl ConnectionError {
    /// Whether this failure happened before any byte of a request was
    /// read at all — used to decide whether it is worth logging as a
    /// warning versus ignoring as ordinary connection churn.
    pub fn is_client_closed_early(&self) -> bool {
        matches!(self, ConnectionError::ClientClosedEarly)
    }
}
