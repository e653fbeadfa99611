//! # shardnet-core
//!
//! Core types and traits for the shardnet event-driven TCP server.
//!
//! This crate is platform-agnostic. The epoll-backed runtime lives in
//! `shardnet-runtime`.
//!
//! ## Modules
//!
//! - `error` - Error type shared by every shardnet crate
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable helpers for configuration
//! - `mux` - The `Multiplexer` trait and readiness events
//! - `balance` - Accept-balancing policies across reactor shards
//! - `frame` - Framing contract types (`Frame`, `DecodeError`)
//! - `pool` - Elastic idle pool: capacity, LIFO idle list, expiry, release

pub mod error;
pub mod kprint;
pub mod env;
pub mod mux;
pub mod balance;
pub mod frame;
pub mod pool;

// Re-exports for convenience
pub use error::{Error, Result};
pub use env::{env_get, env_get_bool, env_get_duration_ms, env_get_opt, env_get_str};
pub use mux::{Multiplexer, PollEvent, Readiness};
pub use balance::AcceptBalance;
pub use frame::{DecodeError, Frame};
pub use pool::{Checkout, IdlePool, Retire};

/// Defaults shared by the runtime and the configuration layer
pub mod constants {
    use std::time::Duration;

    /// Events fetched per `epoll_wait` call
    pub const POLL_EVENTS: usize = 64;

    /// Read buffer size handed to the kernel per `read(2)`
    pub const DEFAULT_READ_BUFFER: usize = 4096;

    /// Framing worker pool capacity
    pub const DEFAULT_WORKER_POOL_SIZE: usize = 1024;

    /// Framing worker idle expiry
    pub const DEFAULT_WORKER_EXPIRY: Duration = Duration::from_secs(1);

    /// Execution pool capacity (much larger than the framing pool)
    pub const DEFAULT_EXEC_POOL_SIZE: usize = 65536;

    /// Execution worker idle expiry
    pub const DEFAULT_EXEC_EXPIRY: Duration = Duration::from_secs(5);

    /// Pooled `Conn` objects kept for reuse
    pub const DEFAULT_CONN_CACHE: usize = 4096;

    /// Pooled read buffers kept for reuse
    pub const DEFAULT_BUFFER_CACHE: usize = 4096;
}
