use std::io;

use thiserror::Error;

use crate::key::ServerAddress;
use crate::value::ValueKind;

/// Errors produced by cache operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to establish a connection to a server.
    #[error("connect: {0}")]
    Connect(#[source] io::Error),

    /// Socket-level failure on an established connection (read, write,
    /// timeout, unexpected EOF). Poisons the connection it occurred on.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The reply did not parse as meta protocol, or the server answered
    /// with `ERROR`/`CLIENT_ERROR`. Poisons the connection.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The server answered `SERVER_ERROR <msg>`. The reply line was
    /// complete, so the connection stays usable.
    #[error("server: {0}")]
    Server(String),

    /// The pool for this server is inside a mark-down window and this
    /// request was not the designated prober.
    #[error("server marked down: {0}")]
    MarkedDown(ServerAddress),

    /// A typed getter found a value of a different kind.
    #[error("type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        /// Kind the caller asked for.
        expected: ValueKind,
        /// Kind actually stored.
        found: ValueKind,
    },

    /// Value encode/decode failure in the injected codec.
    #[error("codec: {0}")]
    Codec(String),
}

impl Error {
    /// Whether this error reduces to the single "server error" signal of
    /// the failure-handling policy: eligible for gutter fallback, and
    /// silenced into a Miss/false result when the caller does not raise.
    pub fn is_server_class(&self) -> bool {
        !matches!(self, Error::TypeMismatch { .. } | Error::Codec(_))
    }
}
