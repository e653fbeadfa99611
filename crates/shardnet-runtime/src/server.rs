//! Server orchestration
//!
//! Owns the listener, the shards, the registry and both pools, and drives
//! start / stop / serve.
//!
//! # Shutdown
//!
//! ```text
//!   stop():  trigger_close(all pollers)
//!            join shard threads
//!            registry.close_all()
//!            close pollers, drop listener
//!            workers.release(); workers.wait_drained()
//!            exec.release();    exec.wait_drained()
//! ```

use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use shardnet_core::{kdebug, kerror, kinfo, Error, Multiplexer, Result};

use crate::config::ServerConfig;
use crate::conn::{Conn, ConnOwner};
use crate::exec::ExecPool;
use crate::handler::Handler;
use crate::poller::new_poller;
use crate::registry::Registry;
use crate::shard::{self, Shard};
use crate::worker::WorkerPool;

/// State shared by the server handle, shard threads and connections
pub(crate) struct Shared<H: Handler> {
    pub(crate) config: ServerConfig,
    pub(crate) listener: RwLock<Option<TcpListener>>,
    pub(crate) listen_fd: RawFd,
    pub(crate) local_addr: SocketAddr,
    pub(crate) shards: Vec<Shard>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) workers: Arc<WorkerPool<H>>,
    pub(crate) exec: Arc<ExecPool<H>>,
    pub(crate) handler: Arc<H>,
    stopping: AtomicBool,
    /// Shard threads still running
    alive: Mutex<usize>,
    all_exited: Condvar,
}

impl<H: Handler> Shared<H> {
    #[inline]
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn shard_exited(&self) {
        let mut alive = self.alive.lock();
        *alive = alive.saturating_sub(1);
        if *alive == 0 {
            self.all_exited.notify_all();
        }
    }

    fn wait_shards(&self) {
        let mut alive = self.alive.lock();
        while *alive > 0 {
            self.all_exited.wait(&mut alive);
        }
    }
}

impl<H: Handler> ConnOwner for Shared<H> {
    fn release(&self, conn: &Conn) {
        let shard = self.shards.get(conn.shard_id());
        if let Some(shard) = shard {
            let _ = shard.poller.deregister(conn.fd());
        }
        if let Some(removed) = self.registry.remove(conn) {
            if let Some(shard) = shard {
                shard.conn_closed();
            }
            self.registry.recycle(removed);
        }
        self.workers.detach(conn.id());
    }

    fn set_write_interest(&self, conn: &Conn, enabled: bool) -> Result<()> {
        match self.shards.get(conn.shard_id()) {
            Some(shard) => shard.poller.set_write_interest(conn.fd(), enabled),
            None => Err(Error::ConnClosed),
        }
    }
}

type PreServing<H> = Box<dyn FnOnce(&Server<H>) -> Result<()> + Send>;

pub struct Server<H: Handler> {
    shared: Arc<Shared<H>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pre_serving: Mutex<Option<PreServing<H>>>,
    started: AtomicBool,
    /// Set once stop has run; held while stopping so repeat callers wait
    stopped: Mutex<bool>,
}

impl<H: Handler> Server<H> {
    /// Bind the listener and build shards and pools. No thread serves
    /// connections until `start`.
    pub fn new(config: ServerConfig, handler: H) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.addr.as_str())?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let listen_fd = listener.as_raw_fd();

        let n = config.resolved_shards();
        let mut shards = Vec::with_capacity(n);
        for id in 0..n {
            let poller = new_poller()?;
            poller.register_listener(listen_fd)?;
            shards.push(Shard::new(id, poller));
        }

        let handler = Arc::new(handler);
        let registry = Arc::new(Registry::new(
            config.read_buffer,
            config.conn_cache,
            config.buffer_cache,
        ));
        let exec = ExecPool::new(
            Arc::clone(&handler),
            config.exec_pool_size,
            config.exec_expiry,
            config.failure_hook.clone(),
        )?;
        let workers = WorkerPool::new(
            Arc::clone(&handler),
            Arc::clone(&exec),
            Arc::clone(&registry),
            config.worker_pool_size,
            config.worker_expiry,
            config.failure_hook.clone(),
        )?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                listener: RwLock::new(Some(listener)),
                listen_fd,
                local_addr,
                shards,
                registry,
                workers,
                exec,
                handler,
                stopping: AtomicBool::new(false),
                alive: Mutex::new(0),
                all_exited: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
            pre_serving: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: Mutex::new(false),
        })
    }

    /// Spawn one thread per shard and return.
    pub fn start(&self) -> Result<()> {
        if self.shared.is_stopping() {
            return Err(Error::PollerClosed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let n = self.shared.shards.len();
        *self.shared.alive.lock() = n;

        let mut threads = self.threads.lock();
        for id in 0..n {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("shardnet-shard-{}", id))
                .spawn(move || {
                    kdebug!("shard {} running", id);
                    match shard::run(&shared, id) {
                        Ok(()) | Err(Error::PollerClosed) => kdebug!("shard {} exiting", id),
                        Err(e) => kerror!("shard {} exiting on error: {}", id, e),
                    }
                    shared.shard_exited();
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    // Unspawned shards count as exited
                    for _ in id..n {
                        self.shared.shard_exited();
                    }
                    return Err(e.into());
                }
            }
        }

        kinfo!(
            "listening on {} with {} shards, balance {}",
            self.shared.local_addr,
            n,
            self.shared.config.balance
        );
        Ok(())
    }

    /// Graceful shutdown. Blocks until every connection is closed and both
    /// pools have drained. Later calls return once the first has finished.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return;
        }
        *stopped = true;

        let shared = &self.shared;
        shared.stopping.store(true, Ordering::Release);
        for shard in &shared.shards {
            shard.poller.trigger_close();
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }

        let closed = shared.registry.close_all();
        for shard in &shared.shards {
            if let Err(e) = shard.poller.close() {
                kdebug!("shard {}: poller close: {}", shard.id(), e);
            }
        }
        shared.listener.write().take();

        shared.workers.release();
        shared.workers.wait_drained();
        shared.exec.release();
        shared.exec.wait_drained();

        kinfo!("stopped, {} connections closed", closed);
    }

    /// Run the pre-serving hook, start, block until every shard has exited,
    /// then stop.
    pub fn serve(&self) -> Result<()> {
        let hook = self.pre_serving.lock().take();
        if let Some(hook) = hook {
            hook(self)?;
        }
        self.start()?;
        self.wait()?;
        self.stop();
        Ok(())
    }

    /// Block until every shard thread has exited (after `stop`, or a fatal
    /// accept or poll error).
    pub fn wait(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        self.shared.wait_shards();
        Ok(())
    }

    /// Hook run by `serve` before the shards start.
    pub fn set_pre_serving<F>(&self, hook: F)
    where
        F: FnOnce(&Server<H>) -> Result<()> + Send + 'static,
    {
        *self.pre_serving.lock() = Some(Box::new(hook));
    }

    pub fn listener_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Live connections across all shards
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Live connections per shard, indexed by shard id
    pub fn shard_connection_counts(&self) -> Vec<usize> {
        self.shared.shards.iter().map(|s| s.count()).collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shared.shards.len()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.shared.handler
    }

    pub fn worker_pool(&self) -> &WorkerPool<H> {
        &self.shared.workers
    }

    pub fn exec_pool(&self) -> &ExecPool<H> {
        &self.shared.exec
    }
}

impl<H: Handler> Drop for Server<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardnet_core::{AcceptBalance, DecodeError, Frame};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    /// Echoes every chunk back as one packet
    struct Echo;

    impl Handler for Echo {
        type Packet = Vec<u8>;

        fn read(&self, input: &[u8], mut leftover: Vec<u8>) -> Frame<Vec<u8>> {
            leftover.extend_from_slice(input);
            if leftover.is_empty() {
                return Frame::incomplete(leftover);
            }
            Frame::packet(leftover, Vec::new())
        }

        fn handle(&self, conn: &Arc<Conn>, packet: Option<Vec<u8>>, _error: Option<DecodeError>) {
            if let Some(p) = packet {
                let _ = conn.write(&p);
            }
        }
    }

    fn config(shards: usize) -> ServerConfig {
        ServerConfig::new().addr("127.0.0.1:0").shards(shards)
    }

    fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let err = Server::new(config(1).worker_pool_size(0), Echo).err();
        assert_eq!(err, Some(Error::InvalidPoolSize));
    }

    #[test]
    fn test_wait_requires_start() {
        let server = Server::new(config(1), Echo).unwrap();
        assert_eq!(server.wait(), Err(Error::NotStarted));
        server.start().unwrap();
        server.stop();
        assert_eq!(server.wait(), Ok(()));
    }

    #[test]
    fn test_start_twice() {
        let server = Server::new(config(1), Echo).unwrap();
        server.start().unwrap();
        assert_eq!(server.start(), Err(Error::AlreadyStarted));
        server.stop();
        server.stop();
        assert_eq!(server.start(), Err(Error::PollerClosed));
    }

    #[test]
    fn test_echo_and_stop_closes_everything() {
        let server = Server::new(config(2), Echo).unwrap();
        server.start().unwrap();

        let mut client = TcpStream::connect(server.listener_addr()).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert!(eventually(|| server.connection_count() == 1));
        assert_eq!(server.shard_connection_counts().iter().sum::<usize>(), 1);

        server.stop();
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.worker_pool().idle_len(), 0);
        assert_eq!(server.exec_pool().idle_len(), 0);
        assert_eq!(server.worker_pool().running(), 0);
        assert_eq!(server.exec_pool().running(), 0);

        // Peer sees the close
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap(), 0);
    }

    #[test]
    fn test_peer_close_removes_conn() {
        let server = Server::new(config(1).balance(AcceptBalance::LeastConn), Echo).unwrap();
        server.start().unwrap();
        let client = TcpStream::connect(server.listener_addr()).unwrap();
        assert!(eventually(|| server.connection_count() == 1));
        drop(client);
        assert!(eventually(|| server.connection_count() == 0));
        assert_eq!(server.shard_connection_counts(), vec![0]);
    }

    #[test]
    fn test_serve_returns_after_stop() {
        let server = Arc::new(Server::new(config(2), Echo).unwrap());
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        server.set_pre_serving(move |s| {
            assert_eq!(s.shard_count(), 2);
            r.store(true, Ordering::SeqCst);
            Ok(())
        });

        let s = server.clone();
        let serving = thread::spawn(move || s.serve());
        // Counted only once a shard is accepting
        let _client = TcpStream::connect(server.listener_addr()).unwrap();
        assert!(eventually(|| server.connection_count() == 1));
        server.stop();
        assert_eq!(serving.join().unwrap(), Ok(()));
        assert!(ran.load(Ordering::SeqCst));
    }
}
