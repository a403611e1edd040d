#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Linux TUN / TAP devices with a flow-controlled receive pipeline.
//!
//! A [`Device`] is created with [`Device::create`] which returns the device handle together with an [`EventStream`].
//! The handle sends packets and controls the pipeline; the stream reports when the interface is open, every received packet and, at most once, the error that failed the device.

mod backend;
mod config;
pub mod device_file;
mod error;
mod eventloop;
pub mod flow;
mod link;
mod setup;
pub mod worker;

use std::{
    future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use eventloop::{Command, Eventloop};
use futures::{FutureExt as _, future::Fuse};
use parking_lot::RwLock;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::device_file::SharedFd;

pub use backend::{Backend, Kernel};
pub use config::{Config, DeviceKind, TUN_FILE};
pub use error::{Error, Violation};

/// Handle to a TUN / TAP device.
///
/// Dropping all clones of this handle closes the device, as does dropping its [`EventStream`].
#[derive(Clone, Debug)]
pub struct Device {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<State>,
    shared: Arc<Shared>,
}

/// The identity the kernel assigned to the interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
}

/// The lifecycle of a [`Device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Opening,
    ConfiguringInterface,
    ActivatingLink,
    Open(Interface),
    Closed,
    Failed,
}

/// Events the application should react to.
#[derive(Debug)]
pub enum Event {
    /// The interface exists and is up.
    ///
    /// Packets may be delivered before this.
    Open(Interface),
    Packet(Bytes),
    /// The device failed and has been torn down; this is the last event.
    Error(Error),
}

#[derive(Debug)]
pub struct EventStream {
    eventloop: Fuse<JoinHandle<Result<(), Error>>>,
    open_rx: Option<oneshot::Receiver<Interface>>,
    packet_rx: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,

    finished: bool,
}

/// State shared between the handle, the event stream and the event-loop.
#[derive(Debug, Default)]
struct Shared {
    /// The descriptor used by [`Device::send`]; withdrawn on teardown.
    fd: RwLock<Option<SharedFd>>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Device {
    /// Creates a device backed by the kernel.
    ///
    /// The device is opened and configured in the background, watch the [`EventStream`] for [`Event::Open`].
    pub fn create(config: Config, handle: tokio::runtime::Handle) -> (Self, EventStream) {
        Self::with_backend(config, Kernel, handle)
    }

    pub fn with_backend(
        config: Config,
        backend: impl Backend,
        handle: tokio::runtime::Handle,
    ) -> (Self, EventStream) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(State::Opening);
        let shared = Arc::new(Shared::default());

        let event_capacity = config.event_capacity;
        let eventloop_shared = shared.clone();
        let event_stream = EventStream::new(
            move |open_tx, packet_tx| {
                Eventloop::new(
                    Arc::new(backend),
                    config,
                    cmd_rx,
                    state_tx,
                    open_tx,
                    packet_tx,
                    eventloop_shared,
                )
                .run()
            },
            event_capacity,
            shared.clone(),
            handle,
        );

        (
            Self {
                cmd_tx,
                state_rx,
                shared,
            },
            event_stream,
        )
    }

    /// Writes one packet to the device.
    ///
    /// Fails with [`Error::NotReady`] unless the descriptor is open.
    pub fn send(&self, packet: &[u8]) -> Result<usize, Error> {
        if self.shared.is_closed() {
            return Err(Error::NotReady);
        }

        let fd = self.shared.fd.read().clone().ok_or(Error::NotReady)?;

        fd.write(packet).map_err(Error::Send)
    }

    /// Stops reading from the device until [`Device::resume`] is called.
    ///
    /// Packets already in flight are still delivered.
    pub fn pause(&self) {
        let _ = self.cmd_tx.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.cmd_tx.send(Command::Resume);
    }

    /// Closes the device.
    ///
    /// No events are delivered afterwards; the [`EventStream`] ends once teardown has completed.
    /// Closing an already closed device does nothing.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!("Closing device");

        let _ = self.cmd_tx.send(Command::Close);
    }

    pub fn state(&self) -> State {
        self.state_rx.borrow().clone()
    }

    /// The interface's identity, once it is open.
    pub fn interface(&self) -> Option<Interface> {
        match &*self.state_rx.borrow() {
            State::Open(interface) => Some(interface.clone()),
            State::Opening
            | State::ConfiguringInterface
            | State::ActivatingLink
            | State::Closed
            | State::Failed => None,
        }
    }
}

impl EventStream {
    pub fn poll_next(&mut self, cx: &mut Context) -> Poll<Option<Event>> {
        if self.finished {
            return Poll::Ready(None);
        }

        if self.shared.is_closed() {
            return self.poll_closed(cx);
        }

        if let Some(open_rx) = self.open_rx.as_mut()
            && let Poll::Ready(result) = open_rx.poll_unpin(cx)
        {
            self.open_rx = None;

            if let Ok(interface) = result {
                return Poll::Ready(Some(Event::Open(interface)));
            }
        }

        if let Poll::Ready(Some(packet)) = self.packet_rx.poll_recv(cx) {
            return Poll::Ready(Some(Event::Packet(packet)));
        }

        match self.eventloop.poll_unpin(cx) {
            Poll::Ready(Ok(Ok(()))) => {
                self.finished = true;

                Poll::Ready(None)
            }
            Poll::Ready(Ok(Err(e))) => {
                self.finished = true;

                Poll::Ready(Some(Event::Error(e)))
            }
            Poll::Ready(Err(e)) => {
                self.finished = true;

                Poll::Ready(Some(Event::Error(Error::Crashed(e.to_string()))))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    pub async fn next(&mut self) -> Option<Event> {
        future::poll_fn(|cx| self.poll_next(cx)).await
    }

    /// Discards everything still queued and waits for teardown to complete.
    fn poll_closed(&mut self, cx: &mut Context) -> Poll<Option<Event>> {
        while let Poll::Ready(Some(_)) = self.packet_rx.poll_recv(cx) {}

        match self.eventloop.poll_unpin(cx) {
            Poll::Ready(Ok(Ok(()))) => {}
            Poll::Ready(Ok(Err(e))) => {
                tracing::debug!("Device failed after close: {}", logging::err_with_src(&e));
            }
            Poll::Ready(Err(e)) => tracing::debug!("Device event-loop crashed after close: {e}"),
            Poll::Pending => return Poll::Pending,
        }

        self.finished = true;

        Poll::Ready(None)
    }

    fn new<E>(
        make_event_loop: impl FnOnce(oneshot::Sender<Interface>, mpsc::Sender<Bytes>) -> E,
        event_capacity: usize,
        shared: Arc<Shared>,
        handle: tokio::runtime::Handle,
    ) -> Self
    where
        E: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let (open_tx, open_rx) = oneshot::channel();
        let (packet_tx, packet_rx) = mpsc::channel(event_capacity.max(1));

        let eventloop = handle.spawn(make_event_loop(open_tx, packet_tx));

        Self {
            eventloop: eventloop.fuse(),
            open_rx: Some(open_rx),
            packet_rx,
            shared,
            finished: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_stream<E>(
        make_event_loop: impl FnOnce(oneshot::Sender<Interface>, mpsc::Sender<Bytes>) -> E,
    ) -> (EventStream, Arc<Shared>)
    where
        E: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let stream = EventStream::new(
            make_event_loop,
            8,
            shared.clone(),
            tokio::runtime::Handle::current(),
        );

        (stream, shared)
    }

    #[tokio::test]
    async fn event_stream_turns_panic_into_crashed() {
        let (mut stream, _) = spawn_stream(|_, _| async move { panic!("Boom!") });

        let Event::Error(Error::Crashed(message)) = stream.next().await.unwrap() else {
            panic!("Unexpected event!");
        };

        assert!(message.contains("Boom!"));
    }

    #[tokio::test]
    async fn repeated_polls_after_error_end_the_stream() {
        let (mut stream, _) = spawn_stream(|_, _| async move { Err(Error::ReceiveLoopEnded) });

        let Event::Error(Error::ReceiveLoopEnded) = stream.next().await.unwrap() else {
            panic!("Unexpected event!");
        };
        let poll = stream.poll_next(&mut Context::from_waker(futures::task::noop_waker_ref()));

        assert!(matches!(poll, Poll::Ready(None)));
    }

    #[tokio::test]
    async fn open_and_queued_packets_precede_the_error() {
        let (mut stream, _) = spawn_stream(|open_tx, packet_tx| async move {
            packet_tx.send(Bytes::from_static(b"early")).await.unwrap();
            open_tx
                .send(Interface {
                    name: "tap0".to_owned(),
                    index: 3,
                })
                .unwrap();
            packet_tx.send(Bytes::from_static(b"late")).await.unwrap();

            Err(Error::ReceiveLoopEnded)
        });

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], Event::Open(Interface { name, index: 3 }) if name == "tap0"));
        assert!(matches!(&events[1], Event::Packet(p) if p.as_ref() == b"early"));
        assert!(matches!(&events[2], Event::Packet(p) if p.as_ref() == b"late"));
        assert!(matches!(&events[3], Event::Error(Error::ReceiveLoopEnded)));
    }

    #[tokio::test]
    async fn closed_stream_discards_pending_events() {
        let (mut stream, shared) = spawn_stream(|_, packet_tx| async move {
            packet_tx.send(Bytes::from_static(b"packet")).await.unwrap();

            Err(Error::ReceiveLoopEnded)
        });
        shared.closed.store(true, Ordering::SeqCst);

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_ends_when_event_loop_returns() {
        let (mut stream, _) = spawn_stream(|_, _| async move { Ok(()) });

        assert!(
            stream.next().await.is_none(),
            "stream should be closed if event-loop returns"
        );
    }

    #[test]
    fn send_before_open_is_not_ready() {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(State::Opening);
        let device = Device {
            cmd_tx,
            state_rx,
            shared: Arc::new(Shared::default()),
        };

        assert!(matches!(device.send(&[0u8; 42]), Err(Error::NotReady)));
        assert_eq!(device.interface(), None);
    }

    #[test]
    fn close_is_sent_once() {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(State::Opening);
        let device = Device {
            cmd_tx,
            state_rx,
            shared: Arc::new(Shared::default()),
        };

        device.close();
        device.close();

        assert!(matches!(cmd_rx.try_recv(), Ok(Command::Close)));
        assert!(cmd_rx.try_recv().is_err());
    }
}
