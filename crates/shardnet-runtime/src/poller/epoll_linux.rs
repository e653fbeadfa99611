//! epoll-backed `Multiplexer`.
//!
//! One epoll instance plus an eventfd registered level-triggered for
//! read. `wake()` and `trigger_close()` write to the eventfd; the wait loop
//! drains it and reports `Woken` or returns `PollerClosed`.
//!
//! Coalescing: several `wake()` calls before the loop reads the eventfd
//! produce a single `Woken` (eventfd counter semantics).

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use shardnet_core::constants::POLL_EVENTS;
use shardnet_core::{Error, Multiplexer, PollEvent, Readiness, Result};

use crate::sys;

const READ_EVENTS: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const WRITE_EVENTS: u32 = (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32;

const LISTENER_INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLET) as u32;
const CONN_INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLET) as u32;

pub struct EpollPoller {
    epfd: RawFd,
    wake_fd: RawFd,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl EpollPoller {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::last_os());
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = Error::last_os();
            let _ = sys::close(epfd);
            return Err(err);
        }
        let poller = Self {
            epfd,
            wake_fd,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        poller.ctl(libc::EPOLL_CTL_ADD, wake_fd, libc::EPOLLIN as u32)?;
        Ok(poller)
    }

    /// The epoll descriptor (for diagnostics)
    pub fn fd(&self) -> RawFd {
        self.epfd
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    /// Reset the eventfd counter. EAGAIN means it was already zero.
    fn drain_wake(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.wake_fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    fn readiness(bits: u32) -> Readiness {
        Readiness {
            read: bits & READ_EVENTS != 0,
            write: bits & WRITE_EVENTS != 0,
        }
    }
}

impl Multiplexer for EpollPoller {
    fn register_listener(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, LISTENER_INTEREST)
    }

    fn register_connection(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, CONN_INTEREST)
    }

    fn set_write_interest(&self, fd: RawFd, enabled: bool) -> Result<()> {
        let events = if enabled {
            CONN_INTEREST | libc::EPOLLOUT as u32
        } else {
            CONN_INTEREST
        };
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    fn deregister(&self, fd: RawFd) -> Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) } < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    fn wait(&self, on_event: &mut dyn FnMut(PollEvent) -> Result<()>) -> Result<()> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; POLL_EVENTS];
        loop {
            if self.is_closing() {
                return Err(Error::PollerClosed);
            }
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), POLL_EVENTS as libc::c_int, -1)
            };
            if n < 0 {
                let err = Error::last_os();
                if err.is_interrupted() {
                    continue;
                }
                return Err(err);
            }

            for ev in &events[..n as usize] {
                // epoll_event is packed on x86_64; copy the fields out
                let bits = ev.events;
                let fd = ev.u64 as RawFd;

                if fd == self.wake_fd {
                    self.drain_wake();
                    if self.is_closing() {
                        return Err(Error::PollerClosed);
                    }
                    on_event(PollEvent::Woken)?;
                    continue;
                }
                on_event(PollEvent::Ready {
                    fd,
                    readiness: Self::readiness(bits),
                })?;
            }
        }
    }

    fn wake(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wake_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = Error::last_os();
            // Counter saturated: a wake is already pending
            if err.is_would_block() {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn trigger_close(&self) {
        self.closing.store(true, Ordering::Release);
        let _ = self.wake();
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closing.store(true, Ordering::Release);
        let r1 = sys::close(self.wake_fd);
        let r2 = sys::close(self.epfd);
        r1.and(r2)
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_trigger_close_ends_wait() {
        let poller = Arc::new(EpollPoller::new().unwrap());
        let p2 = poller.clone();
        let waiter = thread::spawn(move || p2.wait(&mut |_| Ok(())));
        thread::sleep(Duration::from_millis(20));
        poller.trigger_close();
        assert_eq!(waiter.join().unwrap(), Err(Error::PollerClosed));
        assert!(poller.is_closing());
        poller.close().unwrap();
        poller.close().unwrap();
    }

    #[test]
    fn test_wake_delivers_woken() {
        let poller = Arc::new(EpollPoller::new().unwrap());
        poller.wake().unwrap();
        poller.wake().unwrap();

        let p2 = poller.clone();
        let result = p2.wait(&mut |ev| {
            assert_eq!(ev, PollEvent::Woken);
            Err(Error::InvalidConfig("stop"))
        });
        assert_eq!(result, Err(Error::InvalidConfig("stop")));
    }

    #[test]
    fn test_connection_readiness() {
        let poller = EpollPoller::new().unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        poller.register_connection(b.as_raw_fd()).unwrap();
        a.write_all(b"x").unwrap();

        let fd = b.as_raw_fd();
        let result = poller.wait(&mut |ev| match ev {
            PollEvent::Ready { fd: got, readiness } => {
                assert_eq!(got, fd);
                assert!(readiness.read);
                Err(Error::InvalidConfig("done"))
            }
            PollEvent::Woken => Ok(()),
        });
        assert_eq!(result, Err(Error::InvalidConfig("done")));

        poller.set_write_interest(fd, true).unwrap();
        let result = poller.wait(&mut |ev| match ev {
            PollEvent::Ready { readiness, .. } if readiness.write => Err(Error::InvalidConfig("writable")),
            _ => Ok(()),
        });
        assert_eq!(result, Err(Error::InvalidConfig("writable")));

        poller.set_write_interest(fd, false).unwrap();
        poller.deregister(fd).unwrap();
        assert!(poller.deregister(fd).is_err());
    }
}
