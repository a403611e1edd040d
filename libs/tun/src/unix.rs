use std::{io, os::fd::RawFd, time::Duration};

/// Waits until `fd` becomes readable or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout.
/// A wait interrupted by a signal is reported as [`io::ErrorKind::Interrupted`].
pub fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    // Safety: `pollfd` outlives the call and we pass exactly one entry.
    match unsafe { libc::poll(&mut pollfd, 1, timeout_ms) } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(false),
        _ if pollfd.revents & libc::POLLNVAL != 0 => Err(io::Error::from_raw_os_error(libc::EBADF)),
        _ if pollfd.revents & libc::POLLERR != 0 => {
            Err(io::Error::other("Error condition on file descriptor"))
        }
        _ => Ok(true),
    }
}

/// Reads from the given file descriptor into the buffer.
///
/// # Safety
///
/// The file descriptor must be open.
pub unsafe fn read(fd: RawFd, dst: &mut [u8]) -> io::Result<usize> {
    match unsafe { libc::read(fd, dst.as_mut_ptr() as _, dst.len()) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}

/// Writes the buffer to the given file descriptor.
///
/// # Safety
///
/// The file descriptor must be open.
pub unsafe fn write(fd: RawFd, src: &[u8]) -> io::Result<usize> {
    match unsafe { libc::write(fd, src.as_ptr() as _, src.len() as _) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}
