//! Readiness multiplexer abstraction.
//!
//! A `Multiplexer` wraps one OS readiness-notification instance (epoll on
//! Linux). Each reactor shard owns exactly one and is the only thread that
//! calls `wait` on it; registration calls may come from any thread.
//!
//! # Implementors
//!
//! - `Poller` (shardnet-runtime, Linux): epoll + eventfd wake descriptor.
//!
//! # Edge-triggered contract
//!
//! Descriptors are registered edge-triggered. A callback that receives a
//! readiness event must drain the descriptor (read/accept until
//! `EAGAIN`) or it will not be notified again.

use std::os::fd::RawFd;

use crate::error::Result;

/// Readiness reported for one descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Readable, peer hang-up, or error pending
    pub read: bool,
    /// Writable, hang-up, or error pending
    pub write: bool,
}

impl Readiness {
    pub const READ: Readiness = Readiness { read: true, write: false };
    pub const WRITE: Readiness = Readiness { read: false, write: true };

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

/// One event delivered by `Multiplexer::wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// A registered descriptor became ready
    Ready { fd: RawFd, readiness: Readiness },
    /// `wake()` was called (not a close trigger)
    Woken,
}

/// OS readiness multiplexer.
///
/// **Contract:**
/// - `wait()` blocks the calling thread and invokes the callback once per
///   ready descriptor. It returns only when `trigger_close()` was called
///   (`Err(PollerClosed)`), on an unrecoverable OS error, or when the
///   callback returns an error.
/// - `trigger_close()` and `wake()` never block and may be called from any
///   thread.
/// - `close()` releases OS resources exactly once; later calls are no-ops.
pub trait Multiplexer: Send + Sync {
    /// Register a listening socket (edge-triggered read interest).
    fn register_listener(&self, fd: RawFd) -> Result<()>;

    /// Register an accepted connection (edge-triggered read, hang-up and
    /// error interest; write interest starts disarmed).
    fn register_connection(&self, fd: RawFd) -> Result<()>;

    /// Arm or disarm write interest for a registered connection.
    fn set_write_interest(&self, fd: RawFd, enabled: bool) -> Result<()>;

    /// Remove a descriptor from the interest list.
    fn deregister(&self, fd: RawFd) -> Result<()>;

    /// Block delivering events until closed or an error occurs.
    fn wait(&self, on_event: &mut dyn FnMut(PollEvent) -> Result<()>) -> Result<()>;

    /// Interrupt `wait` with a `PollEvent::Woken`.
    fn wake(&self) -> Result<()>;

    /// Ask `wait` to return `Err(PollerClosed)`.
    fn trigger_close(&self);

    /// Whether `trigger_close` has been called.
    fn is_closing(&self) -> bool;

    /// Release the OS descriptors.
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_consts() {
        assert!(Readiness::READ.read && !Readiness::READ.write);
        assert!(Readiness::WRITE.write && !Readiness::WRITE.read);
        assert!(Readiness::default().is_empty());
    }
}
