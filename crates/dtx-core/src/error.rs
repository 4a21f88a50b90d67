//! Error kinds surfaced by the messaging core.

use std::fmt;

use dtx_archive::ArchiveError;

/// Operation-level errors. The core never aborts the process; decode
/// problems on the receive path are logged and skipped, and only the
/// caller-facing operations return one of these.
#[derive(Debug)]
pub enum DtxError {
    /// The transport failed or the connection is not open.
    ConnectionFailed(Option<std::io::Error>),
    /// The peer violated the wire protocol beyond recovery.
    Protocol(String),
    /// A synchronous call or the capability handshake hit its deadline.
    Timeout,
    /// The channel or connection was cancelled.
    Cancelled,
    InvalidArgument(String),
    NotSupported,
    /// A payload or auxiliary item could not be encoded or decoded.
    InvalidEncoding(ArchiveError),
    Internal(String),
}

impl DtxError {
    /// Connection is closed or was never opened, with no underlying cause.
    pub(crate) fn closed() -> Self {
        Self::ConnectionFailed(None)
    }
}

impl fmt::Display for DtxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(Some(e)) => write!(f, "connection failed: {e}"),
            Self::ConnectionFailed(None) => write!(f, "connection failed"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::NotSupported => write!(f, "not supported"),
            Self::InvalidEncoding(e) => write!(f, "encoding error: {e}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for DtxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConnectionFailed(Some(e)) => Some(e),
            Self::InvalidEncoding(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DtxError {
    fn from(e: std::io::Error) -> Self {
        Self::ConnectionFailed(Some(e))
    }
}

impl From<ArchiveError> for DtxError {
    fn from(e: ArchiveError) -> Self {
        Self::InvalidEncoding(e)
    }
}
