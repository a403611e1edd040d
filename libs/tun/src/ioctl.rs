use std::{
    borrow::Cow,
    ffi::{CStr, c_short, c_uchar},
    io,
    os::fd::RawFd,
};

/// Attaches the descriptor to a (possibly new) TUN / TAP interface.
pub const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
/// Reads back the interface the descriptor is attached to.
pub const TUNGETIFF: libc::c_ulong = 0x8004_54d2;

/// Layer 3 device, exchanges IP packets.
pub const IFF_TUN: c_short = libc::IFF_TUN as c_short;
/// Layer 2 device, exchanges Ethernet frames.
pub const IFF_TAP: c_short = libc::IFF_TAP as c_short;
/// Don't prefix every frame with the 4-byte packet information header.
pub const IFF_NO_PI: c_short = libc::IFF_NO_PI as c_short;

/// The size of the union following the name in `struct ifreq` on 64-bit targets.
///
/// `TUNGETIFF` copies an entire `struct ifreq` back to userspace, our buffer must be at least as large.
const IFREQ_UNION_SIZE: usize = 24;

/// Executes the `ioctl` syscall on the given file descriptor with the provided request.
///
/// # Safety
///
/// The file descriptor must be open.
pub unsafe fn exec<P>(fd: RawFd, code: libc::c_ulong, req: &mut Request<P>) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, code as _, req) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Represents a control request to an IO device, addressed by the device's name.
///
/// The payload MUST also be `#[repr(C)]` and its layout depends on the particular request you are sending.
#[repr(C)]
pub struct Request<P> {
    name: [c_uchar; libc::IF_NAMESIZE],
    payload: P,
}

impl Request<InterfaceFlagsPayload> {
    /// Creates a request for the interface `name` with the given flags.
    ///
    /// An empty name lets the kernel pick one, e.g. `tap0`.
    pub fn new(name: &str, flags: c_short) -> io::Result<Self> {
        let name_as_bytes = name.as_bytes();

        if name_as_bytes.len() >= libc::IF_NAMESIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Interface name '{name}' is longer than {} bytes",
                    libc::IF_NAMESIZE - 1
                ),
            ));
        }

        if name_as_bytes.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Interface name must not contain NUL bytes",
            ));
        }

        let mut buf = [0u8; libc::IF_NAMESIZE];
        buf[..name_as_bytes.len()].copy_from_slice(name_as_bytes);

        Ok(Self {
            name: buf,
            payload: InterfaceFlagsPayload {
                flags,
                _padding: [0u8; IFREQ_UNION_SIZE - size_of::<c_short>()],
            },
        })
    }

    pub fn flags(&self) -> c_short {
        self.payload.flags
    }
}

impl<P> Request<P> {
    /// The interface name currently stored in the request.
    pub fn name(&self) -> Cow<'_, str> {
        match CStr::from_bytes_until_nul(&self.name) {
            Ok(cstr) => cstr.to_string_lossy(),
            Err(_) => String::from_utf8_lossy(&self.name),
        }
    }
}

#[repr(C)]
pub struct InterfaceFlagsPayload {
    flags: c_short,
    _padding: [c_uchar; IFREQ_UNION_SIZE - size_of::<c_short>()],
}
