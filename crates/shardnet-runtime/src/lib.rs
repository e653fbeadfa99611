//! # shardnet-runtime
//!
//! Linux runtime for the shardnet TCP server core.
//!
//! This crate provides:
//! - The epoll `Poller` (a `Multiplexer`)
//! - `Conn`: accepted connection, one-shot close, queued writes
//! - `Registry`: fd -> conn map with pooled conns and read buffers
//! - Reactor shards with accept balancing and hand-off
//! - `WorkerPool`: elastic framing workers bound per connection
//! - `ExecPool`: elastic handler execution with per-connection lanes
//! - `Server`: start / stop / serve orchestration

pub mod config;
pub mod conn;
pub mod exec;
pub mod handler;
pub mod poller;
pub mod registry;
pub mod server;
pub mod shard;
pub mod worker;
mod sys;

// Re-exports
pub use config::{FailureHook, ServerConfig};
pub use conn::{Conn, ConnStatus};
pub use exec::{ExecPool, Job};
pub use handler::Handler;
pub use poller::{new_poller, Poller};
pub use registry::Registry;
pub use server::Server;
pub use worker::WorkerPool;

use std::any::Any;

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
