//! Error types for shardnet

use core::fmt;
use nix::errno::Errno;

/// Result type for shardnet operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by the server core
///
/// `Clone` so the one-shot close result can be handed to every concurrent
/// caller of `Conn::close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Pool capacity must be at least 1
    InvalidPoolSize,

    /// Pool idle expiry must be non-zero
    InvalidPoolExpiry,

    /// Any other rejected configuration value
    InvalidConfig(&'static str),

    /// Pool has been released; the caller should drop its work
    PoolClosed,

    /// Multiplexer was asked to close while waiting
    PollerClosed,

    /// `Server::start` called twice
    AlreadyStarted,

    /// Operation requires a started server
    NotStarted,

    /// Connection already closed
    ConnClosed,

    /// `Conn::write` called with an empty buffer
    EmptyWrite,

    /// Raw OS error from a syscall
    Os(Errno),

    /// `std::io` error without an errno (kind + message)
    Io(std::io::ErrorKind, String),
}

impl Error {
    /// True for EAGAIN/EWOULDBLOCK, the only condition edge-triggered
    /// loops treat as "drained".
    #[inline]
    pub fn is_would_block(&self) -> bool {
        match self {
            Error::Os(e) => *e == Errno::EAGAIN || *e == Errno::EWOULDBLOCK,
            Error::Io(kind, _) => *kind == std::io::ErrorKind::WouldBlock,
            _ => false,
        }
    }

    /// True for EINTR
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Error::Os(e) => *e == Errno::EINTR,
            Error::Io(kind, _) => *kind == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    /// Capture `errno` after a failed libc call
    #[inline]
    pub fn last_os() -> Self {
        Error::Os(Errno::last())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidPoolSize => write!(f, "invalid size for pool"),
            Error::InvalidPoolExpiry => write!(f, "invalid expiry for pool"),
            Error::InvalidConfig(what) => write!(f, "invalid config: {}", what),
            Error::PoolClosed => write!(f, "pool has been closed"),
            Error::PollerClosed => write!(f, "poller closed"),
            Error::AlreadyStarted => write!(f, "server already started"),
            Error::NotStarted => write!(f, "server not started"),
            Error::ConnClosed => write!(f, "connection closed"),
            Error::EmptyWrite => write!(f, "empty input for conn write"),
            Error::Os(e) => write!(f, "OS error: {} ({})", e.desc(), *e as i32),
            Error::Io(kind, msg) => write!(f, "io error ({:?}): {}", kind, msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Os(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Error::Os(Errno::from_raw(code)),
            None => Error::Io(e.kind(), e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::PoolClosed), "pool has been closed");
        assert_eq!(
            format!("{}", Error::InvalidConfig("shards")),
            "invalid config: shards"
        );
    }

    #[test]
    fn test_would_block() {
        assert!(Error::Os(Errno::EAGAIN).is_would_block());
        assert!(!Error::Os(Errno::ECONNRESET).is_would_block());
        assert!(Error::from(std::io::Error::from(std::io::ErrorKind::WouldBlock)).is_would_block());
        assert!(!Error::PoolClosed.is_would_block());
    }

    #[test]
    fn test_io_conversion_keeps_errno() {
        let io = std::io::Error::from_raw_os_error(libc_econnreset());
        assert_eq!(Error::from(io), Error::Os(Errno::ECONNRESET));
    }

    fn libc_econnreset() -> i32 {
        Errno::ECONNRESET as i32
    }
}
