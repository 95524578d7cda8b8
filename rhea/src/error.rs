//! Error kinds for the RPC runtime.
//!
//! The set of kinds is closed and each kind has a stable portable name.
//! Server-side failures travel as `(portable name, message)` pairs and are
//! re-raised on the client by matching the name, so the names are part of
//! the wire ABI and must never change.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// OS-level failure on a file descriptor.
    Io,
    /// Protocol corruption: bad length, checksum mismatch, unknown message
    /// tag, or decode failure.
    DataMismatch,
    /// A request deadline was hit before a response arrived.
    DeadlineExceeded,
    /// The context was cancelled, or the request was cancelled explicitly.
    Cancelled,
    /// A non-blocking operation would have blocked.
    TryAgain,
    /// Operation attempted on a disconnected connection.
    NotConnected,
    /// Invariant violation.
    Internal,
}

impl ErrorKind {
    /// Stable name used to carry the kind across the wire.
    pub const fn portable_name(self) -> &'static str {
        match self {
            Self::Io => "io_error",
            Self::DataMismatch => "data_mismatch",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::TryAgain => "try_again",
            Self::NotConnected => "not_connected",
            Self::Internal => "internal_error",
        }
    }

    /// Reverse lookup for inbound wire errors.
    pub fn from_portable_name(name: &str) -> Option<Self> {
        Some(match name {
            "io_error" => Self::Io,
            "data_mismatch" => Self::DataMismatch,
            "deadline_exceeded" => Self::DeadlineExceeded,
            "cancelled" => Self::Cancelled,
            "try_again" => Self::TryAgain,
            "not_connected" => Self::NotConnected,
            "internal_error" => Self::Internal,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.portable_name())
    }
}

/// A failure: a kind plus a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Rebuild an error received off the wire. Unknown names degrade to
    /// [`ErrorKind::Internal`] with the original name folded into the
    /// message rather than being dropped.
    pub fn from_wire(name: &str, message: &str) -> Self {
        match ErrorKind::from_portable_name(name) {
            Some(kind) => Self::new(kind, message),
            None => Self::internal(format!("remote error {name}: {message}")),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn data_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataMismatch, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn try_again(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TryAgain, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotConnected, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(errno: rustix::io::Errno) -> Self {
        if errno == rustix::io::Errno::AGAIN || errno == rustix::io::Errno::WOULDBLOCK {
            Self::try_again("operation would block")
        } else {
            Self::io(errno.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::WouldBlock {
            Self::try_again("operation would block")
        } else {
            Self::io(e.to_string())
        }
    }
}
