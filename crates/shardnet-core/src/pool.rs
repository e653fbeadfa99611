//! Elastic idle pool.
//!
//! Bookkeeping shared by the framing worker pool and the execution pool:
//! a capacity bound, an atomic running count, a LIFO list of idle workers
//! (oldest at the front), a condition variable for backpressure, a
//! periodic expiry sweep, and a one-shot release.
//!
//! The pool does not own threads. Callers spawn a worker when `checkout`
//! returns `Checkout::Spawn`, hand idle workers back with `checkin`, and
//! report exits with `exited`.
//!
//! ```text
//!   checkout ──► idle.pop()  ──► Idle(w)
//!            └─► running < cap ─► Spawn        (running += 1)
//!            └─► wait(available) ...            (backpressure)
//!
//!   checkin(w) ──► idle.push((now, w)) + notify_one
//!   sweep      ──► retire idle[..n] where age > expiry, stop at first fresh
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// A pooled worker that can be told to exit.
pub trait Retire: Send + Sync + 'static {
    /// Deliver the retirement sentinel. Must not block.
    fn retire(&self);
}

/// Outcome of `IdlePool::checkout`
pub enum Checkout<W> {
    /// Reuse this idle worker
    Idle(Arc<W>),
    /// A running slot was reserved; the caller must start a worker (and
    /// call `exited` if it fails to)
    Spawn,
    /// The pool has been released
    Closed,
}

struct IdleEntry<W> {
    since: Instant,
    worker: Arc<W>,
}

struct State<W> {
    idle: Vec<IdleEntry<W>>,
    released: bool,
}

pub struct IdlePool<W> {
    /// Used for thread names and log lines
    name: &'static str,
    capacity: usize,
    expiry: Duration,
    /// Workers alive (idle + busy). Only changed under `state`.
    running: AtomicUsize,
    /// Lock-free mirror of `state.released`
    released: AtomicBool,
    state: Mutex<State<W>>,
    /// Signalled when an idle worker or a running slot becomes available
    available: Condvar,
    /// Signalled when `running` drops to zero
    drained: Condvar,
    /// Dropping the sender stops the sweeper thread
    stop: Mutex<Option<Sender<()>>>,
}

impl<W: Retire> IdlePool<W> {
    /// Create a pool. Fails on a zero capacity or zero expiry.
    pub fn new(name: &'static str, capacity: usize, expiry: Duration) -> Result<Arc<Self>> {
        if capacity == 0 {
            return Err(Error::InvalidPoolSize);
        }
        if expiry.is_zero() {
            return Err(Error::InvalidPoolExpiry);
        }
        Ok(Arc::new(Self {
            name,
            capacity,
            expiry,
            running: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            state: Mutex::new(State {
                idle: Vec::new(),
                released: false,
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
            stop: Mutex::new(None),
        }))
    }

    /// Take an idle worker, reserve a slot for a new one, or block until
    /// one of those becomes possible.
    pub fn checkout(&self) -> Checkout<W> {
        let mut state = self.state.lock();
        loop {
            if state.released {
                return Checkout::Closed;
            }
            if let Some(entry) = state.idle.pop() {
                return Checkout::Idle(entry.worker);
            }
            if self.running.load(Ordering::Acquire) < self.capacity {
                self.running.fetch_add(1, Ordering::AcqRel);
                return Checkout::Spawn;
            }
            self.available.wait(&mut state);
        }
    }

    /// Return a worker to the idle list. `false` once the pool is
    /// released, in which case the worker must exit (and call `exited`).
    pub fn checkin(&self, worker: Arc<W>) -> bool {
        let mut state = self.state.lock();
        if state.released {
            return false;
        }
        state.idle.push(IdleEntry {
            since: Instant::now(),
            worker,
        });
        self.available.notify_one();
        true
    }

    /// A worker thread has exited; frees its running slot.
    pub fn exited(&self) {
        let _state = self.state.lock();
        let prev = self.running.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "{}: exited() without a running worker", self.name);
        self.available.notify_one();
        if prev == 1 {
            self.drained.notify_all();
        }
    }

    /// Retire idle workers older than the expiry. Returns how many.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// Sweep as of `now`: scans from the oldest entry and stops at the
    /// first one that is still fresh.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let expired: Vec<Arc<W>> = {
            let mut state = self.state.lock();
            let n = state
                .idle
                .iter()
                .take_while(|e| now.saturating_duration_since(e.since) > self.expiry)
                .count();
            state.idle.drain(..n).map(|e| e.worker).collect()
        };
        for worker in &expired {
            worker.retire();
        }
        expired.len()
    }

    /// Start the periodic sweeper. The thread exits when the pool is
    /// released or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        *self.stop.lock() = Some(stop_tx);

        let pool: Weak<Self> = Arc::downgrade(self);
        let ticker = crossbeam_channel::tick(self.expiry);
        let name = self.name;

        let handle = thread::Builder::new()
            .name(format!("{}-sweeper", name))
            .spawn(move || loop {
                crossbeam_channel::select! {
                    recv(ticker) -> _ => {
                        let Some(pool) = pool.upgrade() else { break };
                        if pool.is_released() {
                            break;
                        }
                        let n = pool.purge_expired();
                        if n > 0 {
                            crate::kdebug!("{}: retired {} idle workers", name, n);
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            })?;
        Ok(handle)
    }

    /// One-shot release: mark closed, retire every idle worker, wake
    /// blocked `checkout` callers. Busy workers retire on their next
    /// `checkin`. Returns the number of idle workers retired.
    pub fn release(&self) -> usize {
        let retired: Vec<Arc<W>> = {
            let mut state = self.state.lock();
            if state.released {
                return 0;
            }
            state.released = true;
            self.released.store(true, Ordering::Release);
            self.available.notify_all();
            state.idle.drain(..).map(|e| e.worker).collect()
        };
        self.stop.lock().take();
        for worker in &retired {
            worker.retire();
        }
        crate::kdebug!("{}: released, {} idle workers retired", self.name, retired.len());
        retired.len()
    }

    /// Block until every worker has exited.
    pub fn wait_drained(&self) {
        let mut state = self.state.lock();
        while self.running.load(Ordering::Acquire) > 0 {
            self.drained.wait(&mut state);
        }
    }

    /// `wait_drained` with a deadline. Returns whether the pool drained.
    pub fn wait_drained_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while self.running.load(Ordering::Acquire) > 0 {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                return self.running.load(Ordering::Acquire) == 0;
            }
        }
        true
    }
}

impl<W> IdlePool<W> {
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.running())
    }

    #[inline]
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn idle_len(&self) -> usize {
        self.state.lock().idle.len()
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[derive(Default)]
    struct Dummy {
        retired: AtomicBool,
    }

    impl Retire for Dummy {
        fn retire(&self) {
            self.retired.store(true, Ordering::SeqCst);
        }
    }

    fn pool(cap: usize, expiry: Duration) -> Arc<IdlePool<Dummy>> {
        IdlePool::new("test-pool", cap, expiry).unwrap()
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            IdlePool::<Dummy>::new("p", 0, Duration::from_secs(1)),
            Err(Error::InvalidPoolSize)
        ));
        assert!(matches!(
            IdlePool::<Dummy>::new("p", 1, Duration::ZERO),
            Err(Error::InvalidPoolExpiry)
        ));
    }

    #[test]
    fn test_spawn_up_to_capacity_then_reuse_lifo() {
        let p = pool(2, Duration::from_secs(60));
        assert!(matches!(p.checkout(), Checkout::Spawn));
        assert!(matches!(p.checkout(), Checkout::Spawn));
        assert_eq!(p.running(), 2);
        assert_eq!(p.free(), 0);

        let a = Arc::new(Dummy::default());
        let b = Arc::new(Dummy::default());
        assert!(p.checkin(a.clone()));
        assert!(p.checkin(b.clone()));
        assert_eq!(p.idle_len(), 2);

        match p.checkout() {
            Checkout::Idle(w) => assert!(Arc::ptr_eq(&w, &b)),
            _ => panic!("expected idle worker"),
        }
    }

    #[test]
    fn test_checkout_blocks_at_capacity() {
        let p = pool(1, Duration::from_secs(60));
        assert!(matches!(p.checkout(), Checkout::Spawn));

        let (tx, rx) = mpsc::channel();
        let p2 = p.clone();
        let waiter = thread::spawn(move || {
            let got_idle = matches!(p2.checkout(), Checkout::Idle(_));
            tx.send(got_idle).unwrap();
        });

        // Still at capacity with nothing idle: the waiter must be parked.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(p.running() <= p.cap());

        p.checkin(Arc::new(Dummy::default()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        waiter.join().unwrap();
    }

    #[test]
    fn test_exit_frees_slot_for_waiter() {
        let p = pool(1, Duration::from_secs(60));
        assert!(matches!(p.checkout(), Checkout::Spawn));

        let p2 = p.clone();
        let waiter = thread::spawn(move || matches!(p2.checkout(), Checkout::Spawn));
        thread::sleep(Duration::from_millis(50));
        p.exited();
        assert!(waiter.join().unwrap());
        assert_eq!(p.running(), 1);
    }

    #[test]
    fn test_purge_retires_only_stale_prefix() {
        let p = pool(4, Duration::from_millis(20));
        for _ in 0..2 {
            assert!(matches!(p.checkout(), Checkout::Spawn));
        }
        let old = Arc::new(Dummy::default());
        let fresh = Arc::new(Dummy::default());
        p.checkin(old.clone());
        thread::sleep(Duration::from_millis(40));
        p.checkin(fresh.clone());

        assert_eq!(p.purge_expired_at(Instant::now()), 1);
        assert!(old.retired.load(Ordering::SeqCst));
        assert!(!fresh.retired.load(Ordering::SeqCst));
        assert_eq!(p.idle_len(), 1);
    }

    #[test]
    fn test_fresh_worker_survives_sweep() {
        let p = pool(1, Duration::from_secs(10));
        assert!(matches!(p.checkout(), Checkout::Spawn));
        let w = Arc::new(Dummy::default());
        p.checkin(w.clone());
        assert_eq!(p.purge_expired(), 0);
        assert!(!w.retired.load(Ordering::SeqCst));
        assert_eq!(p.idle_len(), 1);
    }

    #[test]
    fn test_sweeper_thread_retires() {
        let p = pool(1, Duration::from_millis(10));
        let sweeper = p.spawn_sweeper().unwrap();
        assert!(matches!(p.checkout(), Checkout::Spawn));
        let w = Arc::new(Dummy::default());
        p.checkin(w.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !w.retired.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(w.retired.load(Ordering::SeqCst));
        assert_eq!(p.idle_len(), 0);

        p.release();
        sweeper.join().unwrap();
    }

    #[test]
    fn test_release_is_one_shot() {
        let p = pool(2, Duration::from_secs(60));
        assert!(matches!(p.checkout(), Checkout::Spawn));
        let w = Arc::new(Dummy::default());
        p.checkin(w.clone());

        assert_eq!(p.release(), 1);
        assert!(w.retired.load(Ordering::SeqCst));
        assert_eq!(p.idle_len(), 0);
        assert_eq!(p.release(), 0);

        assert!(matches!(p.checkout(), Checkout::Closed));
        assert!(!p.checkin(Arc::new(Dummy::default())));
    }

    #[test]
    fn test_release_wakes_blocked_checkout() {
        let p = pool(1, Duration::from_secs(60));
        assert!(matches!(p.checkout(), Checkout::Spawn));
        let p2 = p.clone();
        let waiter = thread::spawn(move || matches!(p2.checkout(), Checkout::Closed));
        thread::sleep(Duration::from_millis(50));
        p.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_drained() {
        let p = pool(2, Duration::from_secs(60));
        assert!(matches!(p.checkout(), Checkout::Spawn));
        assert!(!p.wait_drained_for(Duration::from_millis(20)));

        let p2 = p.clone();
        let exiter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            p2.exited();
        });
        p.wait_drained();
        assert_eq!(p.running(), 0);
        exiter.join().unwrap();
    }
}
