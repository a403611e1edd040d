use std::{
    future,
    ops::ControlFlow,
    pin::pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{
    FutureExt as _, SinkExt as _,
    future::{BoxFuture, Either, select},
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::PollSender;

use crate::{
    Backend, Config, Error, Interface, Shared, State,
    device_file::SharedFd,
    flow::PacketReceiver,
    worker::{self, DeviceSource},
};

/// Commands that can be sent to the [`Eventloop`].
#[derive(Debug)]
pub enum Command {
    Pause,
    Resume,
    Close,
}

/// Drives a single device from opening the control node until teardown.
///
/// The setup chain (configure, then activate the link) and the receive chain both start as soon as the descriptor is open and progress independently.
/// The first error of either chain fails the whole device.
pub struct Eventloop {
    backend: Arc<dyn Backend>,
    config: Config,

    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<State>,
    open_tx: Option<oneshot::Sender<Interface>>,
    packet_tx: PollSender<Bytes>,
    shared: Arc<Shared>,

    setup: Setup,
    receiver: Option<PacketReceiver>,
    paused: bool,
}

enum Setup {
    Idle,
    Configuring(BoxFuture<'static, Result<String, Error>>),
    Activating(BoxFuture<'static, Result<Interface, Error>>),
}

enum CombinedEvent {
    Command(Option<Command>),
    Configured(Result<String, Error>),
    Activated(Result<Interface, Error>),
    Packet(Option<Result<Bytes, Error>>),
    EventStreamGone,
}

impl Eventloop {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        config: Config,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<State>,
        open_tx: oneshot::Sender<Interface>,
        packet_tx: mpsc::Sender<Bytes>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            backend,
            config,
            cmd_rx,
            state_tx,
            open_tx: Some(open_tx),
            packet_tx: PollSender::new(packet_tx),
            shared,
            setup: Setup::Idle,
            receiver: None,
            paused: false,
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        let result = self.open_and_run().await;

        self.shut_down().await;

        match &result {
            Ok(()) => {
                tracing::debug!("Device closed");

                self.state_tx.send_replace(State::Closed);
            }
            Err(e) => {
                tracing::debug!("Device failed: {}", logging::err_with_src(e));

                self.state_tx.send_replace(State::Failed);
            }
        }

        result
    }

    async fn open_and_run(&mut self) -> Result<(), Error> {
        let Some(fd) = self.open().await? else {
            return Ok(());
        };

        self.start(fd)?;

        loop {
            match self.tick().await? {
                ControlFlow::Continue(()) => continue,
                ControlFlow::Break(()) => return Ok(()),
            }
        }
    }

    /// Opens the control node, unless we get closed first.
    async fn open(&mut self) -> Result<Option<SharedFd>, Error> {
        let backend = Arc::clone(&self.backend);
        let path = self.config.path.clone();
        let mut open = pin!(async move { backend.open(&path).await });

        loop {
            match select(pin!(self.cmd_rx.recv()), open.as_mut()).await {
                Either::Left((Some(Command::Pause), _)) => self.paused = true,
                Either::Left((Some(Command::Resume), _)) => self.paused = false,
                Either::Left((Some(Command::Close) | None, _)) => {
                    tracing::debug!("Device closed before it was opened");

                    return Ok(None);
                }
                Either::Right((result, _)) => return Ok(Some(SharedFd::new(result?))),
            }
        }
    }

    /// Fans the descriptor out to the send path, the receive worker and the setup chain.
    fn start(&mut self, fd: SharedFd) -> Result<(), Error> {
        *self.shared.fd.write() = Some(fd.clone());

        let mut receiver = worker::spawn(
            DeviceSource::new(fd.clone(), self.config.read_buffer_size),
            self.config.max_in_flight,
            self.config.poll_timeout,
        )?;
        if self.paused {
            receiver.pause();
        }
        self.receiver = Some(receiver);

        let backend = Arc::clone(&self.backend);
        let kind = self.config.kind;
        let requested_name = self.config.requested_name().to_owned();

        self.setup = Setup::Configuring(
            async move { backend.configure(fd, kind, &requested_name).await }.boxed(),
        );
        self.state_tx.send_replace(State::ConfiguringInterface);

        Ok(())
    }

    async fn tick(&mut self) -> Result<ControlFlow<(), ()>, Error> {
        match future::poll_fn(|cx| self.next_event(cx)).await {
            CombinedEvent::Command(None) => {
                tracing::debug!("All device handles dropped");

                Ok(ControlFlow::Break(()))
            }
            CombinedEvent::Command(Some(Command::Close)) => Ok(ControlFlow::Break(())),
            CombinedEvent::Command(Some(Command::Pause)) => {
                self.set_paused(true);

                Ok(ControlFlow::Continue(()))
            }
            CombinedEvent::Command(Some(Command::Resume)) => {
                self.set_paused(false);

                Ok(ControlFlow::Continue(()))
            }
            CombinedEvent::Configured(result) => {
                let name = result?;

                let backend = Arc::clone(&self.backend);
                self.setup = Setup::Activating(
                    async move {
                        let index = backend.activate_link(&name).await?;

                        Ok(Interface { name, index })
                    }
                    .boxed(),
                );
                self.state_tx.send_replace(State::ActivatingLink);

                Ok(ControlFlow::Continue(()))
            }
            CombinedEvent::Activated(result) => {
                let interface = result?;

                tracing::info!(name = %interface.name, index = %interface.index, "Device is open");

                self.state_tx.send_replace(State::Open(interface.clone()));
                if let Some(open_tx) = self.open_tx.take() {
                    let _ = open_tx.send(interface);
                }

                Ok(ControlFlow::Continue(()))
            }
            CombinedEvent::Packet(Some(Ok(packet))) => {
                if self.packet_tx.start_send_unpin(packet).is_err() {
                    tracing::debug!("Event stream dropped");

                    return Ok(ControlFlow::Break(()));
                }

                Ok(ControlFlow::Continue(()))
            }
            CombinedEvent::Packet(Some(Err(e))) => Err(e),
            CombinedEvent::Packet(None) => Err(Error::ReceiveLoopEnded),
            CombinedEvent::EventStreamGone => {
                tracing::debug!("Event stream dropped");

                Ok(ControlFlow::Break(()))
            }
        }
    }

    fn next_event(&mut self, cx: &mut Context) -> Poll<CombinedEvent> {
        if let Poll::Ready(cmd) = self.cmd_rx.poll_recv(cx) {
            return Poll::Ready(CombinedEvent::Command(cmd));
        }

        match &mut self.setup {
            Setup::Idle => {}
            Setup::Configuring(future) => {
                if let Poll::Ready(result) = future.poll_unpin(cx) {
                    self.setup = Setup::Idle;

                    return Poll::Ready(CombinedEvent::Configured(result));
                }
            }
            Setup::Activating(future) => {
                if let Poll::Ready(result) = future.poll_unpin(cx) {
                    self.setup = Setup::Idle;

                    return Poll::Ready(CombinedEvent::Activated(result));
                }
            }
        }

        // The receiver only hands out packets while we have room for them, failures always come through.
        if let Some(receiver) = self.receiver.as_mut() {
            match self.packet_tx.poll_ready_unpin(cx) {
                Poll::Ready(Ok(())) => receiver.set_downstream_ready(true),
                Poll::Ready(Err(_)) => return Poll::Ready(CombinedEvent::EventStreamGone),
                Poll::Pending => receiver.set_downstream_ready(false),
            }

            if let Poll::Ready(packet) = receiver.poll_recv(cx) {
                return Poll::Ready(CombinedEvent::Packet(packet));
            }
        }

        Poll::Pending
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused = paused;

        let Some(receiver) = self.receiver.as_mut() else {
            return;
        };

        if paused {
            receiver.pause();
        } else {
            receiver.resume();
        }
    }

    async fn shut_down(&mut self) {
        if self.shared.fd.write().take().is_some() {
            tracing::debug!("Device descriptor withdrawn from send path");
        }

        // Drops any in-flight setup operation, its result no longer matters.
        self.setup = Setup::Idle;

        if let Some(mut receiver) = self.receiver.take() {
            receiver.destroy(self.config.destroy_timeout).await;
        }
    }
}
