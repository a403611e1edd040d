//! Attaches a descriptor of the control device to a TUN / TAP interface.

use std::os::fd::{AsRawFd as _, BorrowedFd};

use tun::ioctl;

use crate::{DeviceKind, Error};

/// Requests an interface of the given kind on `fd` and returns the name the kernel assigned.
///
/// An empty `requested_name` lets the kernel choose, e.g. `tap0`.
/// The kernel may also rename or suffix a requested name, so the result is read back with `TUNGETIFF`.
pub fn configure(
    fd: BorrowedFd<'_>,
    kind: DeviceKind,
    requested_name: &str,
) -> Result<String, Error> {
    let mut req =
        ioctl::Request::new(requested_name, kind.flags()).map_err(Error::Configuration)?;

    // Safety: `fd` is borrowed and therefore open for the duration of this function.
    unsafe {
        ioctl::exec(fd.as_raw_fd(), ioctl::TUNSETIFF, &mut req).map_err(Error::Configuration)?;
        ioctl::exec(fd.as_raw_fd(), ioctl::TUNGETIFF, &mut req).map_err(Error::Configuration)?;
    }

    let actual_name = req.name().into_owned();

    tracing::debug!(%kind, requested = %requested_name, actual = %actual_name, "Configured interface");

    Ok(actual_name)
}

#[cfg(test)]
mod tests {
    use std::{io, os::fd::AsFd as _, path::Path};

    use super::*;

    #[test]
    fn non_tun_descriptor_fails_with_configuration_error() {
        let fd = crate::device_file::open(Path::new("/dev/null")).unwrap();

        let error = configure(fd.as_fd(), DeviceKind::Tap, "").unwrap_err();

        let Error::Configuration(source) = error else {
            panic!("Unexpected error: {error:?}")
        };
        assert_eq!(source.raw_os_error(), Some(libc::ENOTTY));
    }

    #[test]
    fn overlong_name_fails_before_any_ioctl() {
        let fd = crate::device_file::open(Path::new("/dev/null")).unwrap();

        let error = configure(fd.as_fd(), DeviceKind::Tun, "name-longer-than-ifnamsiz").unwrap_err();

        let Error::Configuration(source) = error else {
            panic!("Unexpected error: {error:?}")
        };
        assert_eq!(source.kind(), io::ErrorKind::InvalidInput);
    }
}
