//! Arena error types.

/// Errors from arena creation, attachment, and allocation.
#[derive(Debug)]
pub enum ArenaError {
    /// The heap cannot satisfy the allocation.
    OutOfSpace { requested: u32, available: u64 },
    /// The type has no entry in the registry.
    TypeNotRegistered { type_name: &'static str },
    /// The segment does not look like a quarry arena.
    BadSegment(&'static str),
    /// The peer initialized the segment with an incompatible version.
    VersionMismatch { expected: u32, found: u32 },
    /// Invalid creation parameters.
    InvalidConfig(&'static str),
    /// System error (open/mmap/unlink failed).
    System(std::io::Error),
}

impl std::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfSpace {
                requested,
                available,
            } => write!(
                f,
                "out of arena space: requested {} bytes, {} remaining",
                requested, available
            ),
            Self::TypeNotRegistered { type_name } => {
                write!(f, "type not registered: {}", type_name)
            }
            Self::BadSegment(msg) => write!(f, "bad segment: {}", msg),
            Self::VersionMismatch { expected, found } => write!(
                f,
                "incompatible arena version: expected {}.{}, found {}.{}",
                expected >> 16,
                expected & 0xFFFF,
                found >> 16,
                found & 0xFFFF
            ),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Self::System(e) => write!(f, "system error: {}", e),
        }
    }
}

impl std::error::Error for ArenaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::System(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ArenaError {
    fn from(e: std::io::Error) -> Self {
        Self::System(e)
    }
}
