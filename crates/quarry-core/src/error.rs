use std::fmt;
use std::io;

use quarry_arena::ArenaError;

/// Transport-wide error taxonomy.
#[derive(Debug)]
pub enum Error {
    /// No listener answered the dial within the deadline.
    ConnectTimeout,
    /// A listener existed but has shut down.
    ConnectRefused,
    /// The invocation's deadline elapsed before a response arrived.
    RequestTimeout,
    /// The component transitioned to `Closed` while the operation was
    /// outstanding, or was already closed when it started.
    ComponentClosed,
    /// The arena's heap is exhausted.
    OutOfArenaSpace { requested: u32, available: u64 },
    /// The payload type was never registered.
    TypeNotRegistered { type_name: &'static str },
    /// The peer's segment disagrees on protocol or version.
    HandshakeMismatch(&'static str),
    /// Accessor fail-fast: no live connection right now.
    NotConnected,
    /// The peer's handler rejected the invocation.
    Handler(String),
    /// Rejected configuration.
    InvalidConfig(&'static str),
    /// Underlying OS failure.
    System(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectTimeout => write!(f, "connect timed out"),
            Error::ConnectRefused => write!(f, "connection refused: listener has shut down"),
            Error::RequestTimeout => write!(f, "request timed out"),
            Error::ComponentClosed => write!(f, "component is closed"),
            Error::OutOfArenaSpace {
                requested,
                available,
            } => write!(
                f,
                "out of arena space: requested {requested} bytes, {available} available"
            ),
            Error::TypeNotRegistered { type_name } => {
                write!(f, "type not registered: {type_name}")
            }
            Error::HandshakeMismatch(detail) => write!(f, "handshake mismatch: {detail}"),
            Error::NotConnected => write!(f, "not connected"),
            Error::Handler(msg) => write!(f, "handler failed: {msg}"),
            Error::InvalidConfig(detail) => write!(f, "invalid config: {detail}"),
            Error::System(err) => write!(f, "system error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::System(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::System(err)
    }
}

impl From<ArenaError> for Error {
    fn from(err: ArenaError) -> Self {
        match err {
            ArenaError::OutOfSpace {
                requested,
                available,
            } => Error::OutOfArenaSpace {
                requested,
                available,
            },
            ArenaError::TypeNotRegistered { type_name } => Error::TypeNotRegistered { type_name },
            ArenaError::BadSegment(detail) => Error::HandshakeMismatch(detail),
            ArenaError::VersionMismatch { .. } => Error::HandshakeMismatch("segment version"),
            ArenaError::InvalidConfig(detail) => Error::InvalidConfig(detail),
            ArenaError::System(err) => Error::System(err),
        }
    }
}
