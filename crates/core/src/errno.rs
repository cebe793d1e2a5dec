/// Classification attached to every fallible operation crossing a module
/// or collaborator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Caller passed malformed input.
    Invalid,
    /// Resource exhaustion.
    NoMem,
    /// Key, rank, or id unknown.
    NotFound,
    /// Duplicate insertion where uniqueness is required.
    Exists,
    /// Peer sent a malformed message or out-of-order event.
    Protocol,
    /// Transport or KVS failure.
    Io,
    /// Authorization denied.
    Permission,
    /// Transient; retry with backoff.
    Again,
}

impl Errno {
    pub fn as_str(self) -> &'static str {
        match self {
            Errno::Invalid => "invalid",
            Errno::NoMem => "nomem",
            Errno::NotFound => "notfound",
            Errno::Exists => "exists",
            Errno::Protocol => "protocol",
            Errno::Io => "io",
            Errno::Permission => "permission",
            Errno::Again => "again",
        }
    }
}

/// A classified error with a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{msg}")]
pub struct Error {
    class: Errno,
    msg: String,
}

impl Error {
    pub fn new(class: Errno, msg: impl Into<String>) -> Self {
        Self {
            class,
            msg: msg.into(),
        }
    }

    pub fn class(&self) -> Errno {
        self.class
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(Errno::Invalid, msg)
    }

    pub fn notfound(msg: impl Into<String>) -> Self {
        Self::new(Errno::NotFound, msg)
    }

    pub fn exists(msg: impl Into<String>) -> Self {
        Self::new(Errno::Exists, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(Errno::Protocol, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(Errno::Io, msg)
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::new(Errno::Permission, msg)
    }

    pub fn again(msg: impl Into<String>) -> Self {
        Self::new(Errno::Again, msg)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let class = match err.kind() {
            ErrorKind::NotFound => Errno::NotFound,
            ErrorKind::PermissionDenied => Errno::Permission,
            ErrorKind::AlreadyExists => Errno::Exists,
            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => Errno::Again,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Errno::Invalid,
            ErrorKind::OutOfMemory => Errno::NoMem,
            _ => Errno::Io,
        };
        Self::new(class, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(Errno::Protocol, err.to_string())
    }
}
