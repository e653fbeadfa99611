//! # shardnet - Sharded epoll TCP server core
//!
//! Event-driven TCP serving built directly on epoll: a few reactor shards
//! own the sockets, an elastic framing pool turns bytes into packets, and
//! an elastic execution pool runs your handler with per-connection
//! ordering and bounded concurrency.
//!
//! ## Quick Start
//!
//! ```ignore
//! use shardnet::{CodecHandler, LineDelimited, Codec, Server, ServerConfig};
//!
//! fn main() -> shardnet::Result<()> {
//!     let handler = CodecHandler::new(LineDelimited::default(), |codec, conn, line, _err| {
//!         if let Some(line) = line {
//!             let mut out = Vec::new();
//!             codec.encode(&line, &mut out);
//!             let _ = conn.write(&out);
//!         }
//!     });
//!     let server = Server::new(ServerConfig::from_env(), handler)?;
//!     server.serve()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!                        ┌──────────────┐
//!                        │   listener   │
//!                        └──────┬───────┘
//!          accept (balanced) ┌──┴───────────────┐
//!                 ┌──────────┴─┐            ┌───┴────────┐
//!                 │  shard 0   │    ...     │  shard N   │   epoll + thread
//!                 └──────┬─────┘            └─────┬──────┘
//!                        │ chunks                 │
//!                 ┌──────┴────────────────────────┴──────┐
//!                 │  WorkerPool: one worker per conn     │   Handler::read
//!                 └──────────────────┬───────────────────┘
//!                                    │ packets
//!                 ┌──────────────────┴───────────────────┐
//!                 │  ExecPool: one lane per conn         │   Handler::handle
//!                 └──────────────────────────────────────┘
//! ```

pub mod codec;

pub use shardnet_core::{
    kdebug, kerror, kinfo, ktrace, kwarn, AcceptBalance, DecodeError, Error, Frame, Multiplexer,
    PollEvent, Readiness, Result,
};
pub use shardnet_core::kprint::{set_log_level, LogLevel};
pub use shardnet_runtime::{
    Conn, ConnStatus, ExecPool, FailureHook, Handler, Poller, Registry, Server, ServerConfig,
    WorkerPool,
};

pub use codec::{Codec, CodecHandler, LengthDelimited, LineDelimited};
