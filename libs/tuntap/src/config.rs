use std::{path::PathBuf, time::Duration};

/// The kernel's TUN / TAP control device.
pub const TUN_FILE: &str = "/dev/net/tun";

/// The class of virtual interface to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeviceKind {
    /// Exchanges IP packets.
    Tun,
    /// Exchanges Ethernet frames.
    #[default]
    Tap,
}

impl DeviceKind {
    pub(crate) fn flags(&self) -> std::ffi::c_short {
        let class = match self {
            DeviceKind::Tun => tun::ioctl::IFF_TUN,
            DeviceKind::Tap => tun::ioctl::IFF_TAP,
        };

        class | tun::ioctl::IFF_NO_PI
    }
}

/// Configuration of a [`Device`](crate::Device).
#[derive(Debug, Clone)]
pub struct Config {
    pub kind: DeviceKind,
    /// The requested interface name; `None` lets the kernel pick one.
    pub name: Option<String>,
    /// Path of the control device node.
    pub path: PathBuf,
    /// How many packets the receive worker may emit before it has to wait for an acknowledgement.
    pub max_in_flight: usize,
    pub read_buffer_size: usize,
    /// How long the receive worker waits for readiness before re-checking its control messages.
    pub poll_timeout: Duration,
    /// How long to wait for the receive worker to exit on teardown before detaching it.
    pub destroy_timeout: Duration,
    /// Capacity of the channel between the event-loop and the [`EventStream`](crate::EventStream).
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kind: DeviceKind::default(),
            name: None,
            path: PathBuf::from(TUN_FILE),
            max_in_flight: 100,
            read_buffer_size: 16_000,
            poll_timeout: Duration::from_millis(100),
            destroy_timeout: Duration::from_secs(5),
            event_capacity: 128,
        }
    }
}

impl Config {
    pub fn tun() -> Self {
        Self {
            kind: DeviceKind::Tun,
            ..Self::default()
        }
    }

    pub fn tap() -> Self {
        Self {
            kind: DeviceKind::Tap,
            ..Self::default()
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..self
        }
    }

    /// Sets the credit window of the receive worker; at least 2 so that acknowledgements are batched.
    pub fn with_max_in_flight(self, max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(2),
            ..self
        }
    }

    pub fn with_destroy_timeout(self, destroy_timeout: Duration) -> Self {
        Self {
            destroy_timeout,
            ..self
        }
    }

    pub(crate) fn requested_name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }
}
