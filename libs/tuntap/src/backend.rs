use std::{
    os::fd::{AsFd as _, OwnedFd},
    path::Path,
};

use async_trait::async_trait;

use crate::{DeviceKind, Error, device_file, device_file::SharedFd, link, setup};

/// The privileged operations needed to bring up a device.
///
/// [`Kernel`] talks to the real kernel; other implementations can stand in for it where creating interfaces is not possible.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Opens the control device node.
    ///
    /// Dropping the returned future must not leak a descriptor that is opened afterwards.
    async fn open(&self, path: &Path) -> Result<OwnedFd, Error>;

    /// Attaches `fd` to an interface and returns the interface's actual name.
    async fn configure(
        &self,
        fd: SharedFd,
        kind: DeviceKind,
        requested_name: &str,
    ) -> Result<String, Error>;

    /// Brings the link named `name` up and returns its interface index.
    async fn activate_link(&self, name: &str) -> Result<u32, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

#[async_trait]
impl Backend for Kernel {
    async fn open(&self, path: &Path) -> Result<OwnedFd, Error> {
        let path = path.to_owned();

        // If we get cancelled, the blocking task still completes and drops (i.e. closes) the descriptor.
        tokio::task::spawn_blocking(move || device_file::open(&path))
            .await
            .map_err(|e| Error::Crashed(e.to_string()))?
    }

    async fn configure(
        &self,
        fd: SharedFd,
        kind: DeviceKind,
        requested_name: &str,
    ) -> Result<String, Error> {
        setup::configure(fd.as_fd(), kind, requested_name)
    }

    async fn activate_link(&self, name: &str) -> Result<u32, Error> {
        link::activate_link(name).await
    }
}
