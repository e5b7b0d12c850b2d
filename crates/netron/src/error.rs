//! # Error Definitions
//!
//! Local failures are `Error`. Failures that cross the wire travel as `RemoteError`
//! inside a reply payload and are turned back into an `Error` on the calling side.

use std::fmt;
use std::time::Duration;

use crate::transport::TransportError;
use crate::wire::WireError;

/// The error taxonomy shared by both ends of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connect,
    IllegalState,
    NotExists,
    Unknown,
    Exists,
    NotValid,
    NotImplemented,
    InvalidArgument,
    Timeout,
    /// Anything without a dedicated kind (application errors, codec failures).
    Other,
}

impl ErrorKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Connect => "Connect",
            Self::IllegalState => "IllegalState",
            Self::NotExists => "NotExists",
            Self::Unknown => "Unknown",
            Self::Exists => "Exists",
            Self::NotValid => "NotValid",
            Self::NotImplemented => "NotImplemented",
            Self::InvalidArgument => "InvalidArgument",
            Self::Timeout => "Timeout",
            Self::Other => "Error",
        }
    }

    /// Unrecognised tags map to `Other`, so newer peers never break older ones.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "Connect" => Self::Connect,
            "IllegalState" => Self::IllegalState,
            "NotExists" => Self::NotExists,
            "Unknown" => Self::Unknown,
            "Exists" => Self::Exists,
            "NotValid" => Self::NotValid,
            "NotImplemented" => Self::NotImplemented,
            "InvalidArgument" => Self::InvalidArgument,
            "Timeout" => Self::Timeout,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// An error as carried in a reply payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Errors raised by the netron engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("not exists: {0}")]
    NotExists(String),
    #[error("unknown: {0}")]
    Unknown(String),
    #[error("exists: {0}")]
    Exists(String),
    #[error("not valid: {0}")]
    NotValid(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] netpack::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// A remote failure whose kind has no local variant.
    #[error("remote error: {0}")]
    Remote(RemoteError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect(_) => ErrorKind::Connect,
            Self::IllegalState(_) => ErrorKind::IllegalState,
            Self::NotExists(_) => ErrorKind::NotExists,
            Self::Unknown(_) => ErrorKind::Unknown,
            Self::Exists(_) => ErrorKind::Exists,
            Self::NotValid(_) => ErrorKind::NotValid,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Remote(remote) => remote.kind,
            Self::Transport(_) | Self::Codec(_) | Self::Wire(_) => ErrorKind::Other,
        }
    }

    /// The wire form of this error, as sent back in a failed reply.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Remote(remote) => remote.clone(),
            Self::Connect(msg)
            | Self::IllegalState(msg)
            | Self::NotExists(msg)
            | Self::Unknown(msg)
            | Self::Exists(msg)
            | Self::NotValid(msg)
            | Self::NotImplemented(msg)
            | Self::InvalidArgument(msg) => RemoteError::new(self.kind(), msg.clone()),
            other => RemoteError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(remote: RemoteError) -> Self {
        let RemoteError { kind, message } = remote;
        match kind {
            ErrorKind::Connect => Self::Connect(message),
            ErrorKind::IllegalState => Self::IllegalState(message),
            ErrorKind::NotExists => Self::NotExists(message),
            ErrorKind::Unknown => Self::Unknown(message),
            ErrorKind::Exists => Self::Exists(message),
            ErrorKind::NotValid => Self::NotValid(message),
            ErrorKind::NotImplemented => Self::NotImplemented(message),
            ErrorKind::InvalidArgument => Self::InvalidArgument(message),
            ErrorKind::Timeout | ErrorKind::Other => Self::Remote(RemoteError { kind, message }),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
