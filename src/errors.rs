//! Error kinds for the tunnel engine.
//!
//! One closed enum per the kinds in the error-handling design, mirroring
//! the teacher's approach of wrapping `io::Error` rather than discarding
//! its `ErrorKind`, so tests can compare by kind instead of by message.

use std::{error, fmt, io};

/// Malformed-protocol reasons, kept distinct from `TunnelError::Protocol`'s
/// message so callers can match on them without string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidMethod,
    InvalidUri,
    InvalidVersion,
    InvalidHeader,
    TooManyHeaders,
    MissingContentLength,
    InvalidContentLength,
    ChunkedTransferEncoding,
    UnexpectedMethodPairing,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidMethod => "invalid or unsupported HTTP method",
            Self::InvalidUri => "invalid request URI",
            Self::InvalidVersion => "invalid or unsupported HTTP version",
            Self::InvalidHeader => "malformed header line",
            Self::TooManyHeaders => "too many header lines",
            Self::MissingContentLength => "POST request missing Content-Length",
            Self::InvalidContentLength => "Content-Length is not a valid integer",
            Self::ChunkedTransferEncoding => "chunked Transfer-Encoding is not supported",
            Self::UnexpectedMethodPairing => "handshake pair did not contain one POST and one GET",
        };
        f.write_str(msg)
    }
}

/// Top-level error kind produced by the tunnel engine and the bridge loop.
#[derive(Debug)]
pub enum TunnelError {
    /// Bad CLI combination or unknown `setopt` name. Fatal at startup.
    Config(String),
    /// OS-level socket/device failure. Wraps the originating [`io::Error`]
    /// so its [`io::ErrorKind`] survives for logging and tests.
    Io(IoError),
    /// Malformed headers, unsupported method, chunked encoding, etc.
    Protocol(ProtocolError),
    /// Clean EOF from the peer.
    PeerClosed,
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {}", err.0),
            Self::Protocol(kind) => write!(f, "protocol error: {kind}"),
            Self::PeerClosed => f.write_str("peer closed the connection"),
        }
    }
}

impl error::Error for TunnelError {}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            TunnelError::PeerClosed
        } else {
            TunnelError::Io(IoError(err))
        }
    }
}

impl From<ProtocolError> for TunnelError {
    fn from(err: ProtocolError) -> Self {
        TunnelError::Protocol(err)
    }
}

/// Wraps [`io::Error`], comparing by [`io::ErrorKind`] since `io::Error`
/// itself has no [`PartialEq`] impl.
#[derive(Debug)]
pub struct IoError(pub io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl PartialEq for TunnelError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Config(a), Self::Config(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a == b,
            (Self::Protocol(a), Self::Protocol(b)) => a == b,
            (Self::PeerClosed, Self::PeerClosed) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_compares_by_kind_not_message() {
        let a = IoError(io::Error::new(io::ErrorKind::TimedOut, "left"));
        let b = IoError(io::Error::new(io::ErrorKind::TimedOut, "right"));
        assert_eq!(a, b);
    }

    #[test]
    fn unexpected_eof_becomes_peer_closed() {
        let err: TunnelError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(err, TunnelError::PeerClosed);
    }

    #[test]
    fn other_io_errors_are_preserved() {
        let err: TunnelError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        match err {
            TunnelError::Io(IoError(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
