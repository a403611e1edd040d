#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Syscall-level building blocks for TUN / TAP devices.

#[cfg(target_os = "linux")]
pub mod ioctl;
#[cfg(target_family = "unix")]
pub mod unix;
