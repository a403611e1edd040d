//! The receive worker: a dedicated thread that blocks on the device and streams packets to a [`PacketReceiver`].

use std::{io, os::fd::AsRawFd as _, time::Duration};

use bytes::Bytes;

use crate::{
    Error,
    device_file::SharedFd,
    flow::{self, PacketReceiver, Producer},
};

/// Outcome of waiting for the next packet.
#[derive(Debug)]
pub enum Recv {
    Packet(Bytes),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The source is exhausted.
    Closed,
}

/// A blocking source of packets, driven by the receive worker.
pub trait PacketSource: Send + 'static {
    /// Waits at most `timeout` for the next packet.
    ///
    /// Errors of kind [`io::ErrorKind::Interrupted`] are retried by the caller.
    fn recv(&mut self, timeout: Duration) -> io::Result<Recv>;
}

/// Reads packets from a TUN / TAP descriptor.
#[derive(Debug)]
pub struct DeviceSource {
    fd: SharedFd,
    buffer: Vec<u8>,
}

impl DeviceSource {
    pub fn new(fd: SharedFd, buffer_size: usize) -> Self {
        Self {
            fd,
            buffer: vec![0u8; buffer_size],
        }
    }
}

impl PacketSource for DeviceSource {
    fn recv(&mut self, timeout: Duration) -> io::Result<Recv> {
        match tun::unix::poll_readable(self.fd.as_raw_fd(), timeout) {
            Ok(true) => {}
            Ok(false) => return Ok(Recv::Timeout),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Recv::Timeout),
            Err(e) => return Err(e),
        }

        loop {
            // Safety: `self.fd` keeps the descriptor open.
            match unsafe { tun::unix::read(self.fd.as_raw_fd(), &mut self.buffer) } {
                Ok(0) => return Ok(Recv::Closed),
                Ok(n) => return Ok(Recv::Packet(Bytes::copy_from_slice(&self.buffer[..n]))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Recv::Timeout),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Spawns a receive worker for `source` and returns the consuming end of its channel.
pub fn spawn<S>(
    source: S,
    max_in_flight: usize,
    poll_timeout: Duration,
) -> Result<PacketReceiver, Error>
where
    S: PacketSource,
{
    let (mut producer, mut receiver) = flow::channel(max_in_flight);

    let worker = std::thread::Builder::new()
        .name("tuntap recv".to_owned())
        .spawn(move || {
            let mut source = source;

            let result = run(&mut source, &mut producer, poll_timeout);
            drop(source); // Release the descriptor before the consumer observes our exit.

            match result {
                Ok(()) => tracing::debug!("Receive loop finished"),
                Err(e) => {
                    tracing::debug!("Receive loop failed: {}", logging::err_with_src(&e));

                    producer.fail(e);
                }
            }
        })
        .map_err(Error::Spawn)?;

    receiver.set_worker(worker);

    Ok(receiver)
}

fn run<S>(source: &mut S, producer: &mut Producer, poll_timeout: Duration) -> Result<(), Error>
where
    S: PacketSource,
{
    loop {
        while !producer.can_emit() {
            if producer.wait_control()?.is_break() {
                return Ok(());
            }
        }

        let packet = match source.recv(poll_timeout) {
            Ok(Recv::Packet(packet)) => packet,
            Ok(Recv::Timeout) => {
                if producer.drain_control()?.is_break() {
                    return Ok(());
                }

                continue;
            }
            Ok(Recv::Closed) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Read(e)),
        };

        if producer.emit(packet)?.is_break() {
            return Ok(());
        }
    }
}
