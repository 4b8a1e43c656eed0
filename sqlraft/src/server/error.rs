//! The error taxonomy of the client-facing server.

use thiserror::Error;

/// An error raised while serving a client connection.
///
/// Protocol errors are always fatal for the offending connection; everything else fails the
/// current request only and is rendered as a failure response.
#[derive(Debug, Error)]
pub enum Error {
    /// Framing violation, unknown message type or over-limit body. Fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Valid framing but invalid contents.
    #[error("parse error: {0}")]
    Parse(String),
    /// The SQL engine refused the operation.
    #[error("{message}")]
    Engine {
        /// The engine's primary result code.
        code: u64,
        /// The engine's extended result code.
        extended: u64,
        message: String,
    },
    /// Unknown database or statement id.
    #[error("not found: {0}")]
    NotFound(String),
    /// The node cannot serve the request right now; the client may retry.
    #[error("busy: {0}")]
    Busy(String),
    /// Reading past the end of a message body.
    #[error("past end of message body")]
    Eom,
    /// Socket-level failure.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The numeric code carried by a failure response.
    pub fn code(&self) -> u64 {
        match self {
            Error::Protocol(_) => 1,
            Error::Parse(_) | Error::Eom => 2,
            Error::Engine { code, .. } => *code,
            Error::NotFound(_) => 4,
            Error::Busy(_) => 5,
            Error::Io(_) => 6,
        }
    }

    /// Whether the connection must be aborted rather than answered with a failure response.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Io(_))
    }
}
