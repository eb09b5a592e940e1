//! Error types for the messaging transport.
//!
//! This module defines all possible errors that can occur during
//! channel and adapter operations.

use core::fmt;
use std::io;

/// Result type alias for transport operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Classifies a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation attempted on a channel whose socket is not open.
    NotReady,

    /// The endpoint URI could not be parsed.
    Endpoint,

    /// Hostname resolution failed or produced no candidates.
    Resolve,

    /// All candidate addresses refused the connection.
    Connect,

    /// The acceptor could not bind to the requested address.
    Bind,

    /// Underlying OS error during read or write.
    Io,

    /// A write made no progress without reporting an OS error.
    ShortIo,

    /// The remote closed the connection mid-frame.
    Eof,

    /// The length prefix decoded to zero or exceeded the frame bound.
    Framing,

    /// The envelope refused the payload bytes.
    Parse,

    /// The envelope failed to serialize itself.
    Serialize,

    /// A receive was already in flight on this channel.
    Busy,
}

impl ErrorKind {
    /// Returns a human-readable description of the error kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotReady => "channel not ready",
            ErrorKind::Endpoint => "invalid endpoint URI",
            ErrorKind::Resolve => "hostname resolution failed",
            ErrorKind::Connect => "connection refused by all candidates",
            ErrorKind::Bind => "bind failed",
            ErrorKind::Io => "I/O error",
            ErrorKind::ShortIo => "short write",
            ErrorKind::Eof => "connection closed by peer",
            ErrorKind::Framing => "invalid frame length",
            ErrorKind::Parse => "payload parse failed",
            ErrorKind::Serialize => "payload serialization failed",
            ErrorKind::Busy => "receive already in flight",
        }
    }
}

/// An error raised by a channel or adapter operation.
///
/// Carries the operation-level [`ErrorKind`] and, where one exists,
/// the underlying [`io::Error`] as its source.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<io::Error>,
}

impl Error {
    /// Creates an error from a kind alone.
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, source: None }
    }

    /// Creates an error wrapping an OS-level cause.
    pub fn with_io(kind: ErrorKind, source: io::Error) -> Self {
        Error {
            kind,
            source: Some(source),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.kind.as_str(), source),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as _)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            io::ErrorKind::WriteZero => ErrorKind::ShortIo,
            _ => ErrorKind::Io,
        };
        Error::with_io(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_preserved() {
        let err = Error::new(ErrorKind::Framing);
        assert_eq!(err.kind(), ErrorKind::Framing);
        assert_eq!(err.to_string(), "invalid frame length");
    }

    #[test]
    fn test_io_kind_mapping() {
        let eof = Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert_eq!(eof.kind(), ErrorKind::Eof);

        let short = Error::from(io::Error::new(io::ErrorKind::WriteZero, "zero"));
        assert_eq!(short.kind(), ErrorKind::ShortIo);

        let other = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(other.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_display_includes_source() {
        let err = Error::with_io(
            ErrorKind::Connect,
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        let text = err.to_string();
        assert!(text.starts_with("connection refused by all candidates"));
        assert!(text.contains("refused"));
    }
}
