//! The device node's file descriptor, shared by every stage of the pipeline.

use std::{
    ffi::CString,
    io,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd as _, OwnedFd, RawFd},
        unix::ffi::OsStrExt as _,
    },
    path::Path,
    sync::Arc,
};

use crate::Error;

/// An open device descriptor.
///
/// Clones share the same descriptor, it is closed once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct SharedFd(Arc<OwnedFd>);

impl SharedFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self(Arc::new(fd))
    }

    /// Writes one packet to the device.
    pub fn write(&self, packet: &[u8]) -> io::Result<usize> {
        // Safety: We own the descriptor for as long as `self` is alive.
        unsafe { tun::unix::write(self.as_raw_fd(), packet) }
    }
}

impl AsRawFd for SharedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for SharedFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Opens the device node at `path` for reading and writing.
pub fn open(path: &Path) -> Result<OwnedFd, Error> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| Error::Open {
        path: path.to_owned(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })?;

    // Safety: `c_path` is a valid, NUL-terminated string.
    let fd = match unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) } {
        -1 => {
            return Err(Error::Open {
                path: path.to_owned(),
                source: io::Error::last_os_error(),
            });
        }
        fd => fd,
    };

    // Safety: The descriptor was just opened and nobody else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
