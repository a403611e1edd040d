use std::{io, path::PathBuf};

/// Fatal errors of a [`Device`](crate::Device) pipeline, plus the synchronous errors of [`Device::send`](crate::Device::send).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to open '{}'", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to configure interface")]
    Configuration(#[source] io::Error),
    #[error("Failed to open netlink session")]
    NetlinkSession(#[source] io::Error),
    #[error("No link named '{name}'")]
    LinkNotFound { name: String },
    #[error("Failed to look up link '{name}'")]
    LinkLookup {
        name: String,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("Failed to bring up link '{name}'")]
    LinkModify {
        name: String,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("Failed to read from device")]
    Read(#[source] io::Error),
    #[error("Receive loop ended unexpectedly")]
    ReceiveLoopEnded,
    #[error("Flow-control protocol violated")]
    ProtocolViolation(#[source] Violation),
    #[error("Device not ready or closed")]
    NotReady,
    #[error("Failed to write to device")]
    Send(#[source] io::Error),
    #[error("Failed to spawn receive worker")]
    Spawn(#[source] io::Error),
    #[error("Device event-loop crashed: {0}")]
    Crashed(String),
}

impl Error {
    /// Whether the device node could not be opened due to missing privileges.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::Open { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
            Error::Configuration(_)
            | Error::NetlinkSession(_)
            | Error::LinkNotFound { .. }
            | Error::LinkLookup { .. }
            | Error::LinkModify { .. }
            | Error::Read(_)
            | Error::ReceiveLoopEnded
            | Error::ProtocolViolation(_)
            | Error::NotReady
            | Error::Send(_)
            | Error::Spawn(_)
            | Error::Crashed(_) => false,
        }
    }
}

/// A broken invariant of the credit-based flow control.
///
/// These indicate a bug in the pipeline, never a recoverable condition.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("Acknowledged {acked} packets but only {in_flight} are in flight")]
    AckExceedsInFlight { acked: usize, in_flight: usize },
    #[error("Emitted a packet with {in_flight} of {max} credits in use")]
    CreditExhausted { in_flight: usize, max: usize },
}
