//! Server configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use shardnet_runtime::config::ServerConfig;
//! use shardnet_core::AcceptBalance;
//!
//! // Defaults with SHARDNET_* overrides
//! let config = ServerConfig::from_env();
//!
//! // Or customize programmatically
//! let config = ServerConfig::new()
//!     .addr("0.0.0.0:7000")
//!     .shards(4)
//!     .balance(AcceptBalance::LeastConn);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use shardnet_core::constants::{
    DEFAULT_BUFFER_CACHE, DEFAULT_CONN_CACHE, DEFAULT_EXEC_EXPIRY, DEFAULT_EXEC_POOL_SIZE,
    DEFAULT_READ_BUFFER, DEFAULT_WORKER_EXPIRY, DEFAULT_WORKER_POOL_SIZE,
};
use shardnet_core::{env_get, env_get_duration_ms, env_get_str, AcceptBalance, Error, Result};

pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Called when a pool worker panics: `(pool name, panic message)`
#[derive(Clone)]
pub struct FailureHook(Arc<dyn Fn(&'static str, &str) + Send + Sync>);

impl FailureHook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&'static str, &str) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    #[inline]
    pub fn call(&self, pool: &'static str, message: &str) {
        (self.0)(pool, message)
    }
}

impl Default for FailureHook {
    fn default() -> Self {
        Self::new(|pool, message| {
            shardnet_core::kerror!("{}: worker exits from a panic: {}", pool, message);
        })
    }
}

impl fmt::Debug for FailureHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FailureHook(..)")
    }
}

/// Server configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address, `host:port`
    pub addr: String,
    /// Reactor shards (0 = number of cores)
    pub shards: usize,
    /// Accept balancing policy
    pub balance: AcceptBalance,
    /// Framing worker pool capacity
    pub worker_pool_size: usize,
    /// Framing worker idle expiry
    pub worker_expiry: Duration,
    /// Execution pool capacity
    pub exec_pool_size: usize,
    /// Execution worker idle expiry
    pub exec_expiry: Duration,
    /// Bytes per `read(2)`
    pub read_buffer: usize,
    /// Free-list capacity for `Conn` objects
    pub conn_cache: usize,
    /// Free-list capacity for read buffers
    pub buffer_cache: usize,
    /// Panic reporter for both pools
    pub failure_hook: FailureHook,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    /// Library defaults, no environment lookup.
    pub fn new() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            shards: 0,
            balance: AcceptBalance::default(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            worker_expiry: DEFAULT_WORKER_EXPIRY,
            exec_pool_size: DEFAULT_EXEC_POOL_SIZE,
            exec_expiry: DEFAULT_EXEC_EXPIRY,
            read_buffer: DEFAULT_READ_BUFFER,
            conn_cache: DEFAULT_CONN_CACHE,
            buffer_cache: DEFAULT_BUFFER_CACHE,
            failure_hook: FailureHook::default(),
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `SHARDNET_ADDR` - Listen address
    /// - `SHARDNET_SHARDS` - Reactor shards (0 = cores)
    /// - `SHARDNET_BALANCE` - random | round-robin | least-conn
    /// - `SHARDNET_WORKERS` - Framing worker pool capacity
    /// - `SHARDNET_WORKER_EXPIRY_MS` - Framing worker idle expiry
    /// - `SHARDNET_EXEC_WORKERS` - Execution pool capacity
    /// - `SHARDNET_EXEC_EXPIRY_MS` - Execution worker idle expiry
    /// - `SHARDNET_READ_BUFFER` - Bytes per read
    pub fn from_env() -> Self {
        Self {
            addr: env_get_str("SHARDNET_ADDR", DEFAULT_ADDR),
            shards: env_get("SHARDNET_SHARDS", 0),
            balance: env_get("SHARDNET_BALANCE", AcceptBalance::default()),
            worker_pool_size: env_get("SHARDNET_WORKERS", DEFAULT_WORKER_POOL_SIZE),
            worker_expiry: env_get_duration_ms("SHARDNET_WORKER_EXPIRY_MS", DEFAULT_WORKER_EXPIRY),
            exec_pool_size: env_get("SHARDNET_EXEC_WORKERS", DEFAULT_EXEC_POOL_SIZE),
            exec_expiry: env_get_duration_ms("SHARDNET_EXEC_EXPIRY_MS", DEFAULT_EXEC_EXPIRY),
            read_buffer: env_get("SHARDNET_READ_BUFFER", DEFAULT_READ_BUFFER),
            ..Self::new()
        }
    }

    // Builder methods

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn shards(mut self, n: usize) -> Self {
        self.shards = n;
        self
    }

    pub fn balance(mut self, policy: AcceptBalance) -> Self {
        self.balance = policy;
        self
    }

    pub fn worker_pool_size(mut self, n: usize) -> Self {
        self.worker_pool_size = n;
        self
    }

    pub fn worker_expiry(mut self, d: Duration) -> Self {
        self.worker_expiry = d;
        self
    }

    pub fn exec_pool_size(mut self, n: usize) -> Self {
        self.exec_pool_size = n;
        self
    }

    pub fn exec_expiry(mut self, d: Duration) -> Self {
        self.exec_expiry = d;
        self
    }

    pub fn read_buffer(mut self, size: usize) -> Self {
        self.read_buffer = size;
        self
    }

    pub fn conn_cache(mut self, n: usize) -> Self {
        self.conn_cache = n;
        self
    }

    pub fn buffer_cache(mut self, n: usize) -> Self {
        self.buffer_cache = n;
        self
    }

    pub fn failure_hook(mut self, hook: FailureHook) -> Self {
        self.failure_hook = hook;
        self
    }

    /// Shard count with 0 resolved to the number of available cores.
    pub fn resolved_shards(&self) -> usize {
        if self.shards > 0 {
            return self.shards;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.addr.trim().is_empty() {
            return Err(Error::InvalidConfig("addr must not be empty"));
        }
        if self.worker_pool_size == 0 || self.exec_pool_size == 0 {
            return Err(Error::InvalidPoolSize);
        }
        if self.worker_expiry.is_zero() || self.exec_expiry.is_zero() {
            return Err(Error::InvalidPoolExpiry);
        }
        if self.read_buffer == 0 {
            return Err(Error::InvalidConfig("read_buffer must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.balance, AcceptBalance::Random);
        assert_eq!(config.worker_expiry, Duration::from_secs(1));
        assert_eq!(config.exec_expiry, Duration::from_secs(5));
        assert!(config.exec_pool_size > config.worker_pool_size);
        assert!(config.resolved_shards() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new()
            .addr("0.0.0.0:9000")
            .shards(3)
            .balance(AcceptBalance::RoundRobin)
            .worker_pool_size(8)
            .read_buffer(512);
        assert_eq!(config.addr, "0.0.0.0:9000");
        assert_eq!(config.resolved_shards(), 3);
        assert_eq!(config.balance, AcceptBalance::RoundRobin);
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.read_buffer, 512);
    }

    #[test]
    fn test_validate() {
        assert_eq!(
            ServerConfig::new().worker_pool_size(0).validate(),
            Err(Error::InvalidPoolSize)
        );
        assert_eq!(
            ServerConfig::new().exec_expiry(Duration::ZERO).validate(),
            Err(Error::InvalidPoolExpiry)
        );
        assert!(matches!(
            ServerConfig::new().read_buffer(0).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            ServerConfig::new().addr(" ").validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("SHARDNET_BALANCE", "least-conn");
        std::env::set_var("SHARDNET_WORKER_EXPIRY_MS", "250");
        let config = ServerConfig::from_env();
        std::env::remove_var("SHARDNET_BALANCE");
        std::env::remove_var("SHARDNET_WORKER_EXPIRY_MS");

        assert_eq!(config.balance, AcceptBalance::LeastConn);
        assert_eq!(config.worker_expiry, Duration::from_millis(250));
    }

    #[test]
    fn test_failure_hook_invoked() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let hook = FailureHook::new(move |pool, msg| {
            assert_eq!(pool, "workers");
            assert_eq!(msg, "boom");
            h.fetch_add(1, Ordering::SeqCst);
        });
        hook.call("workers", "boom");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
