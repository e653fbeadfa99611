//! User-supplied framing and handling strategy

use std::sync::Arc;

use shardnet_core::{DecodeError, Frame};

use crate::conn::Conn;

/// Protocol plug-in for a `Server`.
///
/// `read` runs on a framing worker and must not block. `handle` runs on the
/// execution pool and may block; calls for one connection never overlap
/// and arrive in packet order.
pub trait Handler: Send + Sync + 'static {
    /// Decoded unit handed from `read` to `handle`. Queued packets sit in
    /// a shared lane map, hence `Sync`.
    type Packet: Send + Sync + 'static;

    /// Called once per accepted connection before any read is processed.
    fn pre_open(&self, _conn: &Conn) {}

    /// Frame at most one packet from `input` plus the bytes left over from
    /// the previous call. Called again with an empty `input` while the
    /// returned frame is `ready` and not `finished`.
    fn read(&self, input: &[u8], leftover: Vec<u8>) -> Frame<Self::Packet>;

    /// Process one packet (or decode error).
    fn handle(&self, conn: &Arc<Conn>, packet: Option<Self::Packet>, error: Option<DecodeError>);
}
