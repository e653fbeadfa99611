//! Framing worker pool.
//!
//! Turns the raw chunks a shard reads into packets. A connection with bytes
//! in flight is bound to exactly one worker, so its chunks are framed in
//! arrival order and the partial-packet leftover stays on one thread.
//!
//! ```text
//!   shard ──dispatch(conn, chunk)──► bindings[conn.id] ──► worker channel
//!                                       │ (none: checkout idle / spawn / block)
//!   worker: read(chunk, leftover) ... ready? ─► exec.submit(Handle)
//!           finished && pending == 0 ─► unbind, checkin
//! ```
//!
//! A binding is removed by exactly one party. If the worker removes it, the
//! worker checks itself back in; if close or release removes it, a `Detach`
//! message tells the worker to check in once earlier messages are done.
//! A chunk that arrives for a connection the worker is no longer bound to
//! (it raced a detach) or for a closed connection is discarded.
//!
//! A panicking framer takes only its worker down: the bound connection is
//! closed (its stream position is lost) and whatever was queued behind the
//! faulting chunk is settled before the thread exits.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use shardnet_core::{kdebug, Checkout, Error, IdlePool, Result, Retire};

use crate::config::FailureHook;
use crate::conn::Conn;
use crate::exec::{ExecPool, Job};
use crate::handler::Handler;
use crate::panic_message;
use crate::registry::Registry;

const POOL_NAME: &str = "workers";

enum Msg {
    Chunk(Arc<Conn>, Vec<u8>),
    /// Peer closed or read failed; close after in-flight packets
    Eof(Arc<Conn>),
    /// Binding removed by someone else; return to idle
    Detach,
    Retire,
}

pub(crate) struct FrameWorker {
    tx: Sender<Msg>,
    /// Connection currently bound
    bound: Mutex<Option<Arc<Conn>>>,
}

impl FrameWorker {
    fn bound_id(&self) -> Option<u64> {
        self.bound.lock().as_ref().map(|c| c.id())
    }
}

impl Retire for FrameWorker {
    fn retire(&self) {
        let _ = self.tx.send(Msg::Retire);
    }
}

struct Binding {
    worker: Arc<FrameWorker>,
    /// Messages sent to the worker for this conn and not yet processed
    pending: usize,
}

pub struct WorkerPool<H: Handler> {
    handler: Arc<H>,
    exec: Arc<ExecPool<H>>,
    registry: Arc<Registry>,
    pool: Arc<IdlePool<FrameWorker>>,
    bindings: DashMap<u64, Binding>,
    hook: FailureHook,
    spawned: AtomicUsize,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<H: Handler> WorkerPool<H> {
    pub fn new(
        handler: Arc<H>,
        exec: Arc<ExecPool<H>>,
        registry: Arc<Registry>,
        capacity: usize,
        expiry: Duration,
        hook: FailureHook,
    ) -> Result<Arc<Self>> {
        let pool = IdlePool::new(POOL_NAME, capacity, expiry)?;
        let sweeper = pool.spawn_sweeper()?;
        Ok(Arc::new(Self {
            handler,
            exec,
            registry,
            pool,
            bindings: DashMap::new(),
            hook,
            spawned: AtomicUsize::new(0),
            sweeper: Mutex::new(Some(sweeper)),
        }))
    }

    /// Hand a chunk read from `conn` to its bound worker, binding one first
    /// if needed (blocks while the pool is full). The buffer always ends up
    /// back in the registry's buffer pool.
    pub fn dispatch(self: &Arc<Self>, conn: &Arc<Conn>, chunk: Vec<u8>) -> Result<()> {
        if self.pool.is_released() {
            self.registry.give_buffer(chunk);
            return Err(Error::PoolClosed);
        }
        if conn.is_closed() {
            self.registry.give_buffer(chunk);
            return Err(Error::ConnClosed);
        }
        let worker = match self.bind(conn) {
            Ok(w) => w,
            Err(e) => {
                self.registry.give_buffer(chunk);
                return Err(e);
            }
        };
        self.send(&worker, Msg::Chunk(Arc::clone(conn), chunk))
    }

    /// End of stream for `conn`: close it behind whatever is still being
    /// framed or handled.
    pub fn dispatch_eof(self: &Arc<Self>, conn: &Arc<Conn>) -> Result<()> {
        if self.pool.is_released() {
            return Err(Error::PoolClosed);
        }
        let bound = self.bindings.get_mut(&conn.id()).map(|mut b| {
            b.pending += 1;
            Arc::clone(&b.worker)
        });
        match bound {
            Some(worker) => self.send(&worker, Msg::Eof(Arc::clone(conn))),
            None => self.exec.submit(Job::Close(Arc::clone(conn))),
        }
    }

    /// Drop the binding for a closing connection.
    pub fn detach(&self, conn_id: u64) {
        if let Some((_, binding)) = self.bindings.remove(&conn_id) {
            let _ = binding.worker.tx.send(Msg::Detach);
        }
    }

    fn bind(self: &Arc<Self>, conn: &Arc<Conn>) -> Result<Arc<FrameWorker>> {
        let id = conn.id();
        if let Some(mut b) = self.bindings.get_mut(&id) {
            b.pending += 1;
            return Ok(Arc::clone(&b.worker));
        }
        let worker = self.acquire()?;
        *worker.bound.lock() = Some(Arc::clone(conn));
        self.bindings.insert(
            id,
            Binding {
                worker: Arc::clone(&worker),
                pending: 1,
            },
        );
        Ok(worker)
    }

    fn acquire(self: &Arc<Self>) -> Result<Arc<FrameWorker>> {
        match self.pool.checkout() {
            Checkout::Idle(worker) => Ok(worker),
            Checkout::Spawn => self.spawn(),
            Checkout::Closed => Err(Error::PoolClosed),
        }
    }

    fn spawn(self: &Arc<Self>) -> Result<Arc<FrameWorker>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = Arc::new(FrameWorker {
            tx,
            bound: Mutex::new(None),
        });
        let me = Arc::clone(&worker);
        let this = Arc::clone(self);
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("shardnet-worker-{}", n))
            .spawn(move || this.run(me, rx));
        if let Err(e) = spawned {
            self.pool.exited();
            return Err(e.into());
        }
        Ok(worker)
    }

    fn send(&self, worker: &FrameWorker, msg: Msg) -> Result<()> {
        match worker.tx.send(msg) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::SendError(msg)) => {
                // Worker died between lookup and send
                if let Msg::Chunk(_, buf) = msg {
                    self.registry.give_buffer(buf);
                }
                Err(Error::PoolClosed)
            }
        }
    }

    /// Thread body: faults are contained here.
    fn run(&self, me: Arc<FrameWorker>, rx: Receiver<Msg>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.work(&me, &rx)));
        if let Err(payload) = outcome {
            let bound = me.bound.lock().take();
            if let Some(conn) = bound {
                self.bindings
                    .remove_if(&conn.id(), |_, b| Arc::ptr_eq(&b.worker, &me));
                conn.mark_needs_close();
                let _ = conn.close();
            }
            self.settle(&rx);
            self.hook.call(POOL_NAME, &panic_message(&payload));
        }
        self.pool.exited();
    }

    /// Dispose of messages queued behind a fault.
    fn settle(&self, rx: &Receiver<Msg>) {
        loop {
            match rx.try_recv() {
                Ok(Msg::Chunk(conn, chunk)) => {
                    self.registry.give_buffer(chunk);
                    conn.mark_needs_close();
                    let _ = conn.close();
                }
                Ok(Msg::Eof(conn)) => {
                    if self.exec.submit(Job::Close(Arc::clone(&conn))).is_err() {
                        let _ = conn.close();
                    }
                }
                Ok(Msg::Detach) | Ok(Msg::Retire) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn work(&self, me: &Arc<FrameWorker>, rx: &Receiver<Msg>) {
        let mut leftover: Vec<u8> = Vec::new();
        let mut current = 0u64;

        while let Ok(msg) = rx.recv() {
            let unbound = match msg {
                Msg::Chunk(conn, chunk) => {
                    let done = if me.bound_id() != Some(conn.id()) || conn.is_closed() {
                        // Raced a detach or a close
                        true
                    } else {
                        if conn.id() != current {
                            leftover.clear();
                            current = conn.id();
                        }
                        self.frame(&conn, &chunk, &mut leftover) || conn.is_closed()
                    };
                    self.registry.give_buffer(chunk);
                    self.finish(me, conn.id(), done)
                }
                Msg::Eof(conn) => {
                    if self.exec.submit(Job::Close(Arc::clone(&conn))).is_err() {
                        let _ = conn.close();
                    }
                    self.finish(me, conn.id(), true)
                }
                Msg::Detach => true,
                Msg::Retire => return,
            };
            if unbound {
                leftover.clear();
                current = 0;
                me.bound.lock().take();
                if !self.pool.checkin(Arc::clone(me)) {
                    return;
                }
            }
        }
    }

    /// Frame one chunk. Returns whether the stream ended at a packet
    /// boundary.
    fn frame(&self, conn: &Arc<Conn>, chunk: &[u8], leftover: &mut Vec<u8>) -> bool {
        let mut input = chunk;
        loop {
            let frame = self.handler.read(input, std::mem::take(leftover));
            input = &[];
            *leftover = frame.leftover;
            if frame.ready {
                let job = Job::Handle {
                    conn: Arc::clone(conn),
                    packet: frame.packet,
                    error: frame.error,
                };
                if let Err(e) = self.exec.submit(job) {
                    kdebug!("conn {}: packet dropped: {}", conn.id(), e);
                }
            }
            if frame.finished {
                return true;
            }
            if !frame.ready {
                return false;
            }
        }
    }

    /// One message for `id` processed; unbind when nothing is pending and
    /// the stream is at a boundary. Returns whether this worker unbound.
    fn finish(&self, me: &Arc<FrameWorker>, id: u64, done: bool) -> bool {
        match self.bindings.entry(id) {
            Entry::Occupied(mut e) => {
                if !Arc::ptr_eq(&e.get().worker, me) {
                    return false;
                }
                let b = e.get_mut();
                b.pending = b.pending.saturating_sub(1);
                if b.pending == 0 && done {
                    e.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// One-shot: retire idle workers, detach bound ones, refuse new chunks.
    pub fn release(&self) -> usize {
        let n = self.pool.release();
        let ids: Vec<u64> = self.bindings.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.detach(id);
        }
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
        n
    }

    /// Block until every framing worker has exited.
    pub fn wait_drained(&self) {
        self.pool.wait_drained();
    }

    pub fn wait_drained_for(&self, timeout: Duration) -> bool {
        self.pool.wait_drained_for(timeout)
    }

    #[inline]
    pub fn running(&self) -> usize {
        self.pool.running()
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.pool.free()
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.pool.cap()
    }

    pub fn idle_len(&self) -> usize {
        self.pool.idle_len()
    }

    /// Connections currently bound to a worker
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.pool.is_released()
    }
}
