//! Execution pool.
//!
//! Runs `Handler::handle` with bounded concurrency and per-connection
//! ordering. Jobs are queued on a lane keyed by the connection's generation
//! id; a lane is drained by one pool worker at a time.
//!
//! ```text
//!   submit(job) ──► lanes[conn.id].push_back(job)
//!                    └─ lane idle? mark running, hand lane id to a worker
//!
//!   worker: pop job ─► handle() ─► NeedsClose && lane empty? close
//!           lane empty ─► mark idle, drop lane, checkin
//! ```

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use shardnet_core::{Checkout, DecodeError, Error, IdlePool, Result, Retire};

use crate::config::FailureHook;
use crate::conn::{Conn, ConnStatus};
use crate::handler::Handler;
use crate::panic_message;

const POOL_NAME: &str = "exec";

/// Unit of work for the execution pool, consumed exactly once
pub enum Job<P> {
    /// Invoke `handle` with a packet or decode error
    Handle {
        conn: Arc<Conn>,
        packet: Option<P>,
        error: Option<DecodeError>,
    },
    /// Close after everything queued before it
    Close(Arc<Conn>),
}

impl<P> Job<P> {
    #[inline]
    pub fn conn(&self) -> &Arc<Conn> {
        match self {
            Job::Handle { conn, .. } => conn,
            Job::Close(conn) => conn,
        }
    }
}

struct Lane<P> {
    jobs: VecDeque<Job<P>>,
    running: bool,
}

enum ExecMsg {
    Run(u64),
    Retire,
}

pub(crate) struct ExecWorker {
    tx: Sender<ExecMsg>,
}

impl Retire for ExecWorker {
    fn retire(&self) {
        let _ = self.tx.send(ExecMsg::Retire);
    }
}

pub struct ExecPool<H: Handler> {
    handler: Arc<H>,
    pool: Arc<IdlePool<ExecWorker>>,
    lanes: DashMap<u64, Lane<H::Packet>>,
    hook: FailureHook,
    spawned: AtomicUsize,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<H: Handler> ExecPool<H> {
    pub fn new(
        handler: Arc<H>,
        capacity: usize,
        expiry: Duration,
        hook: FailureHook,
    ) -> Result<Arc<Self>> {
        let pool = IdlePool::new(POOL_NAME, capacity, expiry)?;
        let sweeper = pool.spawn_sweeper()?;
        Ok(Arc::new(Self {
            handler,
            pool,
            lanes: DashMap::new(),
            hook,
            spawned: AtomicUsize::new(0),
            sweeper: Mutex::new(Some(sweeper)),
        }))
    }

    /// Queue `job` behind the connection's earlier jobs. Blocks while the
    /// pool is at capacity with no idle worker.
    pub fn submit(self: &Arc<Self>, job: Job<H::Packet>) -> Result<()> {
        if self.pool.is_released() {
            return Err(Error::PoolClosed);
        }
        let id = job.conn().id();
        let schedule = {
            let mut lane = self.lanes.entry(id).or_insert_with(|| Lane {
                jobs: VecDeque::new(),
                running: false,
            });
            lane.jobs.push_back(job);
            !std::mem::replace(&mut lane.running, true)
        };
        if !schedule {
            return Ok(());
        }
        if let Err(e) = self.schedule(id) {
            self.lanes.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    fn schedule(self: &Arc<Self>, id: u64) -> Result<()> {
        loop {
            match self.pool.checkout() {
                Checkout::Idle(worker) => {
                    if worker.tx.send(ExecMsg::Run(id)).is_ok() {
                        return Ok(());
                    }
                }
                Checkout::Spawn => return self.spawn(id),
                Checkout::Closed => return Err(Error::PoolClosed),
            }
        }
    }

    fn spawn(self: &Arc<Self>, first: u64) -> Result<()> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = Arc::new(ExecWorker { tx });
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("shardnet-exec-{}", n))
            .spawn(move || this.run(worker, rx, first));
        if let Err(e) = spawned {
            self.pool.exited();
            return Err(e.into());
        }
        Ok(())
    }

    fn run(&self, me: Arc<ExecWorker>, rx: Receiver<ExecMsg>, first: u64) {
        let mut next = Some(first);
        loop {
            let id = match next.take() {
                Some(id) => id,
                None => match rx.recv() {
                    Ok(ExecMsg::Run(id)) => id,
                    Ok(ExecMsg::Retire) | Err(_) => break,
                },
            };
            self.drain_lane(id);
            if !self.pool.checkin(Arc::clone(&me)) {
                break;
            }
        }
        self.pool.exited();
    }

    fn drain_lane(&self, id: u64) {
        loop {
            let job = {
                let Some(mut lane) = self.lanes.get_mut(&id) else {
                    return;
                };
                match lane.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        lane.running = false;
                        drop(lane);
                        self.lanes.remove_if(&id, |_, l| !l.running && l.jobs.is_empty());
                        return;
                    }
                }
            };
            self.run_job(id, job);
        }
    }

    fn run_job(&self, id: u64, job: Job<H::Packet>) {
        match job {
            Job::Handle {
                conn,
                packet,
                error,
            } => {
                let handler = &self.handler;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    handler.handle(&conn, packet, error);
                }));
                if let Err(payload) = outcome {
                    self.hook.call(POOL_NAME, &panic_message(&payload));
                }
                if conn.status() == ConnStatus::NeedsClose && self.lane_is_empty(id) {
                    let _ = conn.close();
                }
            }
            Job::Close(conn) => {
                let _ = conn.close();
            }
        }
    }

    fn lane_is_empty(&self, id: u64) -> bool {
        self.lanes.get(&id).map_or(true, |l| l.jobs.is_empty())
    }

    /// One-shot: retire idle workers, refuse new jobs. Busy workers finish
    /// their lane and exit.
    pub fn release(&self) -> usize {
        let n = self.pool.release();
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
        n
    }

    /// Block until every execution worker has exited.
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

    /// Connections with queued or running jobs
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.pool.is_released()
    }
}
