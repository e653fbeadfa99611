//! Accepted TCP connection.
//!
//! A `Conn` is created (or recycled from the registry's free list) when a
//! shard accepts a socket and lives until its one-shot `close`.
//!
//! # Status
//!
//! ```text
//!   Open ──(EOF / read or write error)──► NeedsClose ──(close)──► Closed
//!     └───────────────────(close)──────────────────────────────────┘
//! ```
//!
//! `Closed` is only ever set inside the close guard.
//!
//! # Write path
//!
//! `write` goes straight to the socket while the pending queue is empty.
//! Whatever the kernel refuses is queued and write interest is armed on the
//! owning shard's poller; the shard calls `flush` on write readiness and
//! disarms once the queue drains. Arm/disarm happen under the queue lock so
//! they cannot reorder.
//!
//! # Close
//!
//! `close` with bytes still queued lingers: the connection stops reading,
//! refuses new writes, and is released by the flush that empties the queue.
//! `abort` releases at once and discards the queue (write errors, shutdown).
//!
//! The descriptor is only `close(2)`d while holding the read guard, so a
//! shard mid-`read` never sees the number reused by another accept.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{OnceLock, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use shardnet_core::{Error, Result};

use crate::sys;

/// Generation ids; never reused even when the kernel reuses a descriptor.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStatus {
    Open = 0,
    NeedsClose = 1,
    Closed = 2,
}

impl ConnStatus {
    #[inline]
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnStatus::Open,
            1 => ConnStatus::NeedsClose,
            _ => ConnStatus::Closed,
        }
    }
}

/// Server-side collaborators a connection notifies. Implemented by the
/// server core; held weakly so a `Conn` never keeps the server alive.
pub trait ConnOwner: Send + Sync {
    /// Deregister from the poller, remove from the registry, drop any
    /// worker binding. Called once, inside the close guard, before the
    /// descriptor is released.
    fn release(&self, conn: &Conn);

    /// Arm or disarm write interest on the owning shard's poller.
    fn set_write_interest(&self, conn: &Conn, enabled: bool) -> Result<()>;
}

pub struct Conn {
    fd: RawFd,
    id: u64,
    shard: usize,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    status: AtomicU8,
    closed: OnceLock<Result<()>>,
    /// Close requested while bytes were queued
    linger: AtomicBool,
    pending: Mutex<Vec<u8>>,
    /// Held across `read(2)` and `close(2)`
    io: Mutex<()>,
    owner: Option<Weak<dyn ConnOwner>>,
}

impl Conn {
    /// Wrap an already non-blocking socket descriptor. The `Conn` owns `fd`
    /// from here on.
    pub fn new(
        fd: RawFd,
        shard: usize,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        owner: Option<Weak<dyn ConnOwner>>,
    ) -> Self {
        Self {
            fd,
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            shard,
            local,
            remote,
            status: AtomicU8::new(ConnStatus::Open as u8),
            closed: OnceLock::new(),
            linger: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            io: Mutex::new(()),
            owner,
        }
    }

    /// Reinitialise a recycled connection for a freshly accepted socket.
    /// Requires exclusive access, so no stale handle can observe it.
    pub(crate) fn reset(
        &mut self,
        fd: RawFd,
        shard: usize,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        owner: Option<Weak<dyn ConnOwner>>,
    ) {
        self.fd = fd;
        self.id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        self.shard = shard;
        self.local = local;
        self.remote = remote;
        *self.status.get_mut() = ConnStatus::Open as u8;
        self.closed = OnceLock::new();
        *self.linger.get_mut() = false;
        self.pending.get_mut().clear();
        self.owner = owner;
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Generation id, unique per accept
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn shard_id(&self) -> usize {
        self.shard
    }

    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    #[inline]
    pub fn status(&self) -> ConnStatus {
        ConnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.status() == ConnStatus::Closed
    }

    /// Open -> NeedsClose. No effect once closed.
    pub fn mark_needs_close(&self) {
        let _ = self.status.compare_exchange(
            ConnStatus::Open as u8,
            ConnStatus::NeedsClose as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Deadlines are not supported; always succeeds.
    pub fn set_deadline(&self, _deadline: Instant) -> Result<()> {
        Ok(())
    }

    /// Bytes still queued for the socket
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Close requested, waiting for the queue to drain
    #[inline]
    pub fn is_lingering(&self) -> bool {
        self.linger.load(Ordering::Acquire)
    }

    /// `read(2)` from the socket. `Err(ConnClosed)` once closed, even if the
    /// descriptor number now belongs to another connection.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let _io = self.io.lock();
        if self.is_closed() {
            return Err(Error::ConnClosed);
        }
        sys::read(self.fd, buf)
    }

    /// Write `buf`, queueing whatever the socket does not take now.
    /// Returns the number of bytes accepted (always `buf.len()` on success).
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::EmptyWrite);
        }
        let mut pending = self.pending.lock();
        if self.is_closed() || self.is_lingering() {
            return Err(Error::ConnClosed);
        }
        if !pending.is_empty() {
            pending.extend_from_slice(buf);
            return Ok(buf.len());
        }

        let mut off = 0;
        while off < buf.len() {
            match sys::write(self.fd, &buf[off..]) {
                Ok(n) => off += n,
                Err(e) if e.is_interrupted() => continue,
                Err(e) if e.is_would_block() => {
                    pending.extend_from_slice(&buf[off..]);
                    if let Err(e) = self.set_write_interest(true) {
                        drop(pending);
                        self.fail(&e);
                        return Err(e);
                    }
                    return Ok(buf.len());
                }
                Err(e) => {
                    drop(pending);
                    self.fail(&e);
                    return Err(e);
                }
            }
        }
        Ok(buf.len())
    }

    /// Push queued bytes to the socket. `Ok(true)` once the queue is empty
    /// (write interest disarmed, or the connection released if a close was
    /// lingering), `Ok(false)` if the socket filled up again.
    pub fn flush(&self) -> Result<bool> {
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return Ok(true);
        }
        while !pending.is_empty() {
            match sys::write(self.fd, &pending) {
                Ok(n) => {
                    pending.drain(..n);
                }
                Err(e) if e.is_interrupted() => continue,
                Err(e) if e.is_would_block() => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        if self.is_lingering() {
            drop(pending);
            self.abort()?;
            return Ok(true);
        }
        self.set_write_interest(false)?;
        Ok(true)
    }

    fn set_write_interest(&self, enabled: bool) -> Result<()> {
        match self.owner.as_ref().and_then(Weak::upgrade) {
            Some(owner) => owner.set_write_interest(self, enabled),
            None => Ok(()),
        }
    }

    fn fail(&self, err: &Error) {
        shardnet_core::kdebug!("conn {} (fd {}): write failed: {}", self.id, self.fd, err);
        self.mark_needs_close();
        let _ = self.abort();
    }

    /// Close once every queued byte has been written. With an empty queue
    /// this releases immediately; otherwise the connection lingers until
    /// the owning shard's `flush` drains it.
    pub fn close(&self) -> Result<()> {
        {
            let pending = self.pending.lock();
            if !pending.is_empty() && !self.is_closed() {
                self.linger.store(true, Ordering::Release);
                self.mark_needs_close();
                return Ok(());
            }
        }
        self.abort()
    }

    /// Release the connection exactly once, discarding queued bytes.
    /// Concurrent and repeated callers block until the first release
    /// finishes and get its result.
    pub fn abort(&self) -> Result<()> {
        self.closed
            .get_or_init(|| {
                if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
                    owner.release(self);
                }
                let mut pending = self.pending.lock();
                pending.clear();
                let _io = self.io.lock();
                self.status.store(ConnStatus::Closed as u8, Ordering::Release);
                sys::close(self.fd)
            })
            .clone()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        // Never closed through the guard: still owns the descriptor
        if self.closed.get().is_none() && self.fd >= 0 {
            let _ = sys::close(self.fd);
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("fd", &self.fd)
            .field("id", &self.id)
            .field("shard", &self.shard)
            .field("remote", &self.remote)
            .field("status", &self.status())
            .finish()
    }
}
