//! Error types for remote bus operations and the wire translation boundary.

use std::io;

use rbus_proto::{CodecError, WireError};

/// Alias for `Result<T, rbus::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by remote bus operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Opening, wrapping or using the transport failed.
    #[error("connection: {0}")]
    Connection(#[source] io::Error),

    /// A message could not be encoded or decoded, usually because client
    /// and server disagree on the codec or framing.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The bus transaction failed. Remote failures carry only the message
    /// text the server sent.
    #[error("device: {0}")]
    Device(String),

    /// An argument was out of range; nothing was sent.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(err) => Self::Connection(err),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Self::Device(e.message)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Connection(io::Error::other(e))
    }
}

/// Converts a local failure into the flat wire shape.
///
/// `Ok` stays `Ok`; there is no "empty" error. The full error chain is
/// logged here and only the top-level message crosses the wire.
pub fn translate<T, E>(result: std::result::Result<T, E>) -> std::result::Result<T, WireError>
where
    E: std::error::Error,
{
    result.map_err(|e| {
        let source = e.source().map(ToString::to_string);
        tracing::warn!(error = %e, ?source, "bus call failed");
        WireError::new(e.to_string())
    })
}
