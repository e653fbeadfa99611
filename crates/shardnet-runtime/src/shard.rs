//! Reactor shard: one poller, one thread.
//!
//! Every shard registers the shared listener. A shard accepts while the
//! balancing policy admits it; when the policy points elsewhere it sets the
//! target shard's hand-off flag and wakes that shard's poller, so an
//! edge-triggered listener event is never dropped on the floor.
//!
//! Connection readiness is drained until EAGAIN: each successful read goes
//! to the framing pool, EOF or a read error schedules an ordered close.
//! Reads go through `Conn::read`, which refuses once the connection is
//! closed, so a descriptor number reused by another accept is never read
//! under the old connection.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use shardnet_core::{kdebug, kerror, ktrace, kwarn, Error, Multiplexer, PollEvent, Readiness, Result};

use crate::conn::{Conn, ConnOwner, ConnStatus};
use crate::handler::Handler;
use crate::poller::Poller;
use crate::server::Shared;

pub struct Shard {
    id: usize,
    pub(crate) poller: Poller,
    count: AtomicUsize,
    /// Another shard asked us to accept
    handoff: AtomicBool,
}

impl Shard {
    pub(crate) fn new(id: usize, poller: Poller) -> Self {
        Self {
            id,
            poller,
            count: AtomicUsize::new(0),
            handoff: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Live connections owned by this shard
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn conn_closed(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Ask this shard to run its accept loop.
    fn hand_off(&self) {
        self.handoff.store(true, Ordering::Release);
        if let Err(e) = self.poller.wake() {
            kwarn!("shard {}: hand-off wake failed: {}", self.id, e);
        }
    }
}

/// Shard thread body. Returns when the poller is closed or on a fatal
/// accept/poll error.
pub(crate) fn run<H: Handler>(shared: &Arc<Shared<H>>, id: usize) -> Result<()> {
    let shard = &shared.shards[id];
    let listen_fd = shared.listen_fd;

    shard.poller.wait(&mut |event| match event {
        PollEvent::Woken => {
            if shard.handoff.swap(false, Ordering::AcqRel) {
                accept_loop(shared, id)?;
            }
            Ok(())
        }
        PollEvent::Ready { fd, .. } if fd == listen_fd => accept_loop(shared, id),
        PollEvent::Ready { fd, readiness } => {
            on_ready(shared, id, fd, readiness);
            Ok(())
        }
    })
}

fn admits<H: Handler>(shared: &Shared<H>, id: usize) -> bool {
    let n = shared.shards.len();
    shared
        .config
        .balance
        .admits(id, n, shared.registry.len(), |i| shared.shards[i].count())
}

/// Pass the listener to the shard the policy selects. `false` if that is
/// this shard after all (counts moved), so the caller should retry.
fn hand_off<H: Handler>(shared: &Shared<H>, id: usize) -> bool {
    let n = shared.shards.len();
    let target = shared
        .config
        .balance
        .target(n, shared.registry.len(), |i| shared.shards[i].count());
    match target {
        Some(t) if t != id => {
            shared.shards[t].hand_off();
            true
        }
        _ => false,
    }
}

fn accept_loop<H: Handler>(shared: &Arc<Shared<H>>, id: usize) -> Result<()> {
    loop {
        if shared.is_stopping() {
            return Ok(());
        }
        if !admits(shared, id) {
            if hand_off(shared, id) {
                return Ok(());
            }
            continue;
        }

        let accepted = match shared.listener.read().as_ref() {
            Some(listener) => listener.accept(),
            None => return Ok(()),
        };
        match accepted {
            Ok((stream, remote)) => open(shared, id, stream, remote),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.raw_os_error() == Some(libc::ECONNABORTED) =>
            {
                continue
            }
            Err(e) => {
                kerror!("shard {}: accept failed: {}", id, e);
                return Err(e.into());
            }
        }
    }
}

fn open<H: Handler>(shared: &Arc<Shared<H>>, id: usize, stream: TcpStream, remote: SocketAddr) {
    if let Err(e) = stream.set_nonblocking(true) {
        kwarn!("shard {}: dropping {}: {}", id, remote, e);
        return;
    }
    let _ = stream.set_nodelay(true);
    let local = stream.local_addr().ok();
    let fd = stream.into_raw_fd();

    let shard = &shared.shards[id];
    let owner: Weak<dyn ConnOwner> = Arc::downgrade(shared) as Weak<dyn ConnOwner>;
    let conn = shared
        .registry
        .acquire(fd, id, local, Some(remote), Some(owner));
    shared.registry.insert(Arc::clone(&conn));
    shard.count.fetch_add(1, Ordering::AcqRel);

    if let Err(e) = shard.poller.register_connection(fd) {
        kwarn!("shard {}: register fd {} failed: {}", id, fd, e);
        let _ = conn.abort();
        return;
    }
    shared.handler.pre_open(&conn);
    ktrace!("shard {}: conn {} fd {} from {}", id, conn.id(), fd, remote);
}

fn on_ready<H: Handler>(shared: &Arc<Shared<H>>, id: usize, fd: RawFd, readiness: Readiness) {
    let Some(conn) = shared.registry.get(fd) else {
        return;
    };
    // Stale event for a descriptor reused by another shard
    if conn.shard_id() != id || conn.is_closed() {
        return;
    }
    if readiness.write {
        if let Err(e) = conn.flush() {
            kdebug!("conn {}: flush failed: {}", conn.id(), e);
            conn.mark_needs_close();
            let _ = conn.abort();
            return;
        }
    }
    if readiness.read && conn.status() == ConnStatus::Open {
        read_loop(shared, &conn);
    }
}

fn read_loop<H: Handler>(shared: &Arc<Shared<H>>, conn: &Arc<Conn>) {
    loop {
        if conn.status() != ConnStatus::Open {
            return;
        }
        let mut buf = shared.registry.take_buffer();
        match conn.read(&mut buf) {
            Ok(0) => {
                shared.registry.give_buffer(buf);
                end_of_stream(shared, conn);
                return;
            }
            Ok(n) => {
                buf.truncate(n);
                if let Err(e) = shared.workers.dispatch(conn, buf) {
                    kdebug!("conn {}: dispatch failed: {}", conn.id(), e);
                    return;
                }
            }
            Err(e) => {
                shared.registry.give_buffer(buf);
                if e.is_interrupted() {
                    continue;
                }
                // Closed under us; the descriptor is no longer ours
                if e == Error::ConnClosed {
                    return;
                }
                if !e.is_would_block() {
                    kdebug!("conn {}: read failed: {}", conn.id(), e);
                    end_of_stream(shared, conn);
                }
                return;
            }
        }
    }
}

fn end_of_stream<H: Handler>(shared: &Arc<Shared<H>>, conn: &Arc<Conn>) {
    conn.mark_needs_close();
    if shared.workers.dispatch_eof(conn).is_err() {
        let _ = conn.close();
    }
}
