//! Thin syscall wrappers returning `shardnet_core::Result`

use std::os::fd::RawFd;

use shardnet_core::{Error, Result};

/// `read(2)` into `buf`. `Ok(0)` is end-of-stream.
#[inline]
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(Error::last_os());
    }
    Ok(n as usize)
}

/// `write(2)` from `buf`; may write fewer bytes than requested.
#[inline]
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(Error::last_os());
    }
    Ok(n as usize)
}

#[inline]
pub(crate) fn close(fd: RawFd) -> Result<()> {
    if unsafe { libc::close(fd) } < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}
