//! Connection registry.
//!
//! Concurrent fd -> `Conn` map with an atomic live count, plus bounded
//! free lists for `Conn` objects and read buffers.
//!
//! Invariant: `len()` == inserts - removes == connections not yet closed.
//! Removal is keyed on the generation id, so a stale close can never evict
//! a newer connection that reused the same descriptor.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;

use crate::conn::{Conn, ConnOwner};

pub struct Registry {
    conns: DashMap<RawFd, Arc<Conn>>,
    live: AtomicUsize,
    conn_cache: ArrayQueue<Arc<Conn>>,
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

impl Registry {
    /// `buffer_size` is the read size per `read(2)`; the cache sizes bound
    /// the free lists (minimum 1).
    pub fn new(buffer_size: usize, conn_cache: usize, buffer_cache: usize) -> Self {
        Self {
            conns: DashMap::new(),
            live: AtomicUsize::new(0),
            conn_cache: ArrayQueue::new(conn_cache.max(1)),
            buffers: ArrayQueue::new(buffer_cache.max(1)),
            buffer_size,
        }
    }

    /// Build a `Conn` for a newly accepted socket, reusing a cached one
    /// when nothing else still references it.
    pub fn acquire(
        &self,
        fd: RawFd,
        shard: usize,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        owner: Option<Weak<dyn ConnOwner>>,
    ) -> Arc<Conn> {
        while let Some(mut cached) = self.conn_cache.pop() {
            if let Some(conn) = Arc::get_mut(&mut cached) {
                conn.reset(fd, shard, local, remote, owner);
                return cached;
            }
        }
        Arc::new(Conn::new(fd, shard, local, remote, owner))
    }

    /// Return a connection that is being closed to the free list. It is
    /// only reused once every other handle has been dropped.
    pub fn recycle(&self, conn: Arc<Conn>) {
        let _ = self.conn_cache.push(conn);
    }

    pub fn insert(&self, conn: Arc<Conn>) {
        if self.conns.insert(conn.fd(), conn).is_none() {
            self.live.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Conn>> {
        self.conns.get(&fd).map(|e| e.value().clone())
    }

    /// Remove `conn` if it is still the registered owner of its descriptor.
    pub fn remove(&self, conn: &Conn) -> Option<Arc<Conn>> {
        let id = conn.id();
        let (_, removed) = self.conns.remove_if(&conn.fd(), |_, c| c.id() == id)?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        Some(removed)
    }

    /// Live connection count
    #[inline]
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every registered connection, discarding queued writes.
    /// Returns how many were released.
    pub fn close_all(&self) -> usize {
        // Collect first: abort() removes from the map.
        let conns: Vec<Arc<Conn>> = self.conns.iter().map(|e| e.value().clone()).collect();
        for conn in &conns {
            let _ = conn.abort();
        }
        conns.len()
    }

    /// A read buffer of `buffer_size` bytes
    pub fn take_buffer(&self) -> Vec<u8> {
        match self.buffers.pop() {
            Some(mut buf) => {
                buf.resize(self.buffer_size, 0);
                buf
            }
            None => vec![0; self.buffer_size],
        }
    }

    pub fn give_buffer(&self, buf: Vec<u8>) {
        if buf.capacity() >= self.buffer_size {
            let _ = self.buffers.push(buf);
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
