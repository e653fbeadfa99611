//! Platform readiness multiplexer
//!
//! Only Linux (epoll) is supported.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll_linux;
        pub use epoll_linux::EpollPoller as Poller;
    } else {
        compile_error!("shardnet-runtime requires Linux (epoll)");
    }
}

use shardnet_core::Result;

/// Create a new platform poller
pub fn new_poller() -> Result<Poller> {
    Poller::new()
}
