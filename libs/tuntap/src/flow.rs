//! Credit-based flow control between the receive worker and its consumer.
//!
//! The worker may have at most `max_in_flight` packets outstanding.
//! The consumer acknowledges packets in batches of `max_in_flight / 2`, which keeps roughly half of the window in flight at all times without flooding the worker with acknowledgements.

use std::{
    collections::VecDeque,
    ops::ControlFlow,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use flume::TryRecvError;
use futures::StreamExt as _;

use crate::{Error, error::Violation};

/// How many packets the consumer processes in one go before yielding to other tasks.
pub const MAX_BATCH: usize = 20;

/// Messages from the worker to the consumer.
#[derive(Debug)]
pub enum Upstream {
    Packet(Bytes),
    Failed(Error),
}

/// Control messages from the consumer to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// The consumer has processed this many packets.
    Ack(usize),
    Pause,
    Resume,
    Destroy,
}

/// Creates the two ends of a flow-controlled packet channel.
pub fn channel(max_in_flight: usize) -> (Producer, PacketReceiver) {
    let (packets_tx, packets_rx) = flume::bounded(max_in_flight);
    let (control_tx, control_rx) = flume::unbounded();

    (
        Producer::new(packets_tx, control_rx, max_in_flight),
        PacketReceiver::new(packets_rx, control_tx, max_in_flight),
    )
}

/// The worker's view of the credit window.
#[derive(Debug)]
pub struct Credit {
    in_flight: usize,
    max_in_flight: usize,
    pause_requested: bool,
}

impl Credit {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            in_flight: 0,
            max_in_flight,
            pause_requested: false,
        }
    }

    pub fn can_emit(&self) -> bool {
        self.in_flight < self.max_in_flight && !self.pause_requested
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn on_emit(&mut self) -> Result<(), Violation> {
        if self.in_flight >= self.max_in_flight {
            return Err(Violation::CreditExhausted {
                in_flight: self.in_flight,
                max: self.max_in_flight,
            });
        }

        self.in_flight += 1;

        Ok(())
    }

    pub fn on_ack(&mut self, acked: usize) -> Result<(), Violation> {
        self.in_flight = self
            .in_flight
            .checked_sub(acked)
            .ok_or(Violation::AckExceedsInFlight {
                acked,
                in_flight: self.in_flight,
            })?;

        Ok(())
    }

    pub fn pause(&mut self) {
        self.pause_requested = true;
    }

    pub fn resume(&mut self) {
        self.pause_requested = false;
    }
}

/// The consumer's view of the credit window.
#[derive(Debug)]
pub struct AckWindow {
    received_without_ack: usize,
    ack_threshold: usize,
    pause_sent: bool,
}

impl AckWindow {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            received_without_ack: 0,
            ack_threshold: (max_in_flight / 2).max(1),
            pause_sent: false,
        }
    }

    /// Records a pulled packet, returns the acknowledgement to send once the threshold is reached.
    pub fn on_received(&mut self) -> Option<Control> {
        self.received_without_ack += 1;

        if self.received_without_ack < self.ack_threshold {
            return None;
        }

        Some(Control::Ack(std::mem::take(&mut self.received_without_ack)))
    }

    /// Returns the control message to send, if the consumer's demand changed.
    pub fn set_wants_more(&mut self, wants_more: bool) -> Option<Control> {
        match (wants_more, self.pause_sent) {
            (false, false) => {
                self.pause_sent = true;

                Some(Control::Pause)
            }
            (true, true) => {
                self.pause_sent = false;

                Some(Control::Resume)
            }
            (false, true) | (true, false) => None,
        }
    }

    pub fn wants_more(&self) -> bool {
        !self.pause_sent
    }
}

/// The worker's end of the channel.
#[derive(Debug)]
pub struct Producer {
    packets: flume::Sender<Upstream>,
    control: flume::Receiver<Control>,
    credit: Credit,
}

impl Producer {
    pub(crate) fn new(
        packets: flume::Sender<Upstream>,
        control: flume::Receiver<Control>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            packets,
            control,
            credit: Credit::new(max_in_flight),
        }
    }

    pub fn can_emit(&self) -> bool {
        self.credit.can_emit()
    }

    /// Hands a packet to the consumer and processes whatever control messages arrived in the meantime.
    ///
    /// Breaks if the consumer is gone or asked us to stop.
    pub fn emit(&mut self, packet: Bytes) -> Result<ControlFlow<()>, Error> {
        self.credit.on_emit().map_err(Error::ProtocolViolation)?;

        if self.packets.send(Upstream::Packet(packet)).is_err() {
            return Ok(ControlFlow::Break(()));
        }

        self.drain_control()
    }

    /// Processes all control messages that have already arrived, without blocking.
    pub fn drain_control(&mut self) -> Result<ControlFlow<()>, Error> {
        loop {
            match self.control.try_recv() {
                Ok(control) => {
                    if self.handle_control(control)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(ControlFlow::Continue(())),
                Err(TryRecvError::Disconnected) => return Ok(ControlFlow::Break(())),
            }
        }
    }

    /// Blocks until the next control message arrives and processes it.
    pub fn wait_control(&mut self) -> Result<ControlFlow<()>, Error> {
        match self.control.recv() {
            Ok(control) => self.handle_control(control),
            Err(flume::RecvError::Disconnected) => Ok(ControlFlow::Break(())),
        }
    }

    /// Reports a terminal error to the consumer.
    pub fn fail(self, error: Error) {
        if let Err(flume::SendError(Upstream::Failed(error))) =
            self.packets.send(Upstream::Failed(error))
        {
            tracing::debug!(
                "Consumer gone before error could be reported: {}",
                logging::err_with_src(&error)
            );
        }
    }

    fn handle_control(&mut self, control: Control) -> Result<ControlFlow<()>, Error> {
        match control {
            Control::Ack(acked) => self
                .credit
                .on_ack(acked)
                .map_err(Error::ProtocolViolation)?,
            Control::Pause => self.credit.pause(),
            Control::Resume => self.credit.resume(),
            Control::Destroy => {
                tracing::debug!("Receive worker asked to stop");

                return Ok(ControlFlow::Break(()));
            }
        }

        Ok(ControlFlow::Continue(()))
    }
}

/// The consumer's end of the channel.
///
/// Packets are pulled via [`PacketReceiver::poll_recv`].
/// Every pulled packet counts towards the next acknowledgement.
pub struct PacketReceiver {
    packets: flume::r#async::RecvStream<'static, Upstream>,
    control: flume::Sender<Control>,
    window: AckWindow,
    /// Packets that arrived while the consumer did not want any.
    held: VecDeque<Bytes>,
    paused: bool,
    downstream_ready: bool,
    processed_this_turn: usize,
    worker: Option<std::thread::JoinHandle<()>>,
    destroyed: bool,
}

impl std::fmt::Debug for PacketReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReceiver")
            .field("window", &self.window)
            .field("held", &self.held.len())
            .field("paused", &self.paused)
            .field("downstream_ready", &self.downstream_ready)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl PacketReceiver {
    pub(crate) fn new(
        packets: flume::Receiver<Upstream>,
        control: flume::Sender<Control>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            packets: packets.into_stream(),
            control,
            window: AckWindow::new(max_in_flight),
            held: VecDeque::new(),
            paused: false,
            downstream_ready: true,
            processed_this_turn: 0,
            worker: None,
            destroyed: false,
        }
    }

    pub(crate) fn set_worker(&mut self, worker: std::thread::JoinHandle<()>) {
        self.worker = Some(worker);
    }

    /// Pulls the next packet.
    ///
    /// - `Ready(Some(Ok(_)))`: A packet.
    /// - `Ready(Some(Err(_)))`: The worker failed, no more packets will follow.
    /// - `Ready(None)`: The worker exited.
    ///
    /// While the consumer does not want more, packets are held back until it does, but a failure or the end of the worker is reported right away.
    /// Packets held back at that point are discarded.
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Option<Result<Bytes, Error>>> {
        if self.window.wants_more() {
            if self.processed_this_turn >= MAX_BATCH {
                self.processed_this_turn = 0;
                cx.waker().wake_by_ref();

                return Poll::Pending;
            }

            if let Some(packet) = self.held.pop_front() {
                return Poll::Ready(Some(Ok(self.deliver(packet))));
            }
        }

        loop {
            match self.packets.poll_next_unpin(cx) {
                Poll::Ready(Some(Upstream::Packet(packet))) if self.window.wants_more() => {
                    return Poll::Ready(Some(Ok(self.deliver(packet))));
                }
                // Bounded by the credit window, nothing is acknowledged while held.
                Poll::Ready(Some(Upstream::Packet(packet))) => self.held.push_back(packet),
                Poll::Ready(Some(Upstream::Failed(e))) => {
                    self.discard_held();

                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.discard_held();

                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    self.processed_this_turn = 0;

                    return Poll::Pending;
                }
            }
        }
    }

    /// Asks the worker to stop producing.
    pub fn pause(&mut self) {
        self.paused = true;
        self.update_demand();
    }

    /// Asks the worker to produce again.
    pub fn resume(&mut self) {
        self.paused = false;
        self.update_demand();
    }

    /// Tells the receiver whether the consumer currently has room for another packet.
    ///
    /// The worker is paused while either this or [`PacketReceiver::pause`] says so.
    pub fn set_downstream_ready(&mut self, ready: bool) {
        self.downstream_ready = ready;
        self.update_demand();
    }

    fn update_demand(&mut self) {
        if let Some(control) = self
            .window
            .set_wants_more(!self.paused && self.downstream_ready)
        {
            self.send_control(control);
        }
    }

    fn deliver(&mut self, packet: Bytes) -> Bytes {
        self.processed_this_turn += 1;

        if let Some(ack) = self.window.on_received() {
            self.send_control(ack);
        }

        packet
    }

    fn discard_held(&mut self) {
        if !self.held.is_empty() {
            tracing::debug!(count = %self.held.len(), "Discarding held back packets");

            self.held.clear();
        }
    }

    /// Stops the worker.
    ///
    /// Waits up to `timeout` for the worker to exit; after that, the worker is detached and exits as soon as it notices that this end is gone.
    /// Calling this more than once is a no-op.
    pub async fn destroy(&mut self, timeout: Duration) {
        if std::mem::replace(&mut self.destroyed, true) {
            return;
        }

        self.send_control(Control::Destroy);

        // Packets still in flight are discarded, the channel closes once the worker is gone.
        let drained = tokio::time::timeout(timeout, async {
            while self.packets.next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(?timeout, "Receive worker did not exit in time, detaching it");

            self.worker = None;
            return;
        }

        let Some(worker) = self.worker.take() else {
            return;
        };

        match tokio::task::spawn_blocking(move || worker.join()).await {
            Ok(Ok(())) => tracing::debug!("Receive worker exited"),
            Ok(Err(_)) => tracing::warn!("Receive worker panicked"),
            Err(e) => tracing::debug!("Failed to join receive worker: {e}"),
        }
    }

    fn send_control(&self, control: Control) {
        if self.control.send(control).is_err() {
            tracing::trace!(?control, "Receive worker already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{future::poll_fn, time::Duration};

    use super::*;
    use proptest::{collection, prelude::*};

    #[test]
    fn credit_blocks_emission_when_window_is_full() {
        let mut credit = Credit::new(2);

        credit.on_emit().unwrap();
        credit.on_emit().unwrap();

        assert!(!credit.can_emit());
        assert_eq!(
            credit.on_emit().unwrap_err(),
            Violation::CreditExhausted {
                in_flight: 2,
                max: 2
            }
        );
    }

    #[test]
    fn credit_rejects_acks_beyond_in_flight() {
        let mut credit = Credit::new(10);
        credit.on_emit().unwrap();

        assert_eq!(
            credit.on_ack(2).unwrap_err(),
            Violation::AckExceedsInFlight {
                acked: 2,
                in_flight: 1
            }
        );
        assert_eq!(credit.in_flight(), 1);
    }

    #[test]
    fn pause_blocks_emission_until_resumed() {
        let mut credit = Credit::new(10);

        credit.pause();
        assert!(!credit.can_emit());

        credit.resume();
        assert!(credit.can_emit());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Emit,
        Ack(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Emit), (0..20usize).prop_map(Op::Ack)]
    }

    #[test_strategy::proptest]
    fn in_flight_stays_within_window(
        #[strategy(1..50usize)] max_in_flight: usize,
        #[strategy(collection::vec(op(), 0..500))] ops: Vec<Op>,
    ) {
        let mut credit = Credit::new(max_in_flight);

        for op in ops {
            match op {
                Op::Emit if credit.can_emit() => credit.on_emit().unwrap(),
                Op::Emit => {
                    prop_assert!(credit.on_emit().is_err());
                }
                Op::Ack(acked) => {
                    let before = credit.in_flight();

                    match credit.on_ack(acked) {
                        Ok(()) => {
                            prop_assert_eq!(credit.in_flight(), before - acked);
                        }
                        Err(_) => {
                            prop_assert!(acked > before);
                            prop_assert_eq!(credit.in_flight(), before);
                        }
                    }
                }
            }

            prop_assert!(credit.in_flight() <= max_in_flight);
        }
    }

    #[test]
    fn acks_half_the_window() {
        let mut window = AckWindow::new(50);

        for _ in 0..24 {
            assert_eq!(window.on_received(), None);
        }

        assert_eq!(window.on_received(), Some(Control::Ack(25)));
        assert_eq!(window.on_received(), None);
    }

    #[test]
    fn odd_window_rounds_threshold_down() {
        let mut window = AckWindow::new(5);

        assert_eq!(window.on_received(), None);
        assert_eq!(window.on_received(), Some(Control::Ack(2)));
    }

    #[test]
    fn demand_changes_are_sent_once() {
        let mut window = AckWindow::new(10);

        assert_eq!(window.set_wants_more(true), None);
        assert_eq!(window.set_wants_more(false), Some(Control::Pause));
        assert_eq!(window.set_wants_more(false), None);
        assert_eq!(window.set_wants_more(true), Some(Control::Resume));
        assert_eq!(window.set_wants_more(true), None);
    }

    #[test]
    fn producer_applies_drained_acks() {
        let (packets_tx, _packets_rx) = flume::bounded(4);
        let (control_tx, control_rx) = flume::unbounded();
        let mut producer = Producer::new(packets_tx, control_rx, 4);

        for _ in 0..4 {
            assert!(producer.emit(Bytes::from_static(b"x")).unwrap().is_continue());
        }
        assert!(!producer.can_emit());

        control_tx.send(Control::Ack(2)).unwrap();
        assert!(producer.drain_control().unwrap().is_continue());

        assert!(producer.can_emit());
        assert_eq!(producer.credit.in_flight(), 2);
    }

    #[test]
    fn producer_stops_on_destroy() {
        let (packets_tx, _packets_rx) = flume::bounded(4);
        let (control_tx, control_rx) = flume::unbounded();
        let mut producer = Producer::new(packets_tx, control_rx, 4);

        control_tx.send(Control::Pause).unwrap();
        control_tx.send(Control::Destroy).unwrap();

        assert!(producer.drain_control().unwrap().is_break());
    }

    #[test]
    fn producer_fails_on_excess_ack() {
        let (packets_tx, _packets_rx) = flume::bounded(4);
        let (control_tx, control_rx) = flume::unbounded();
        let mut producer = Producer::new(packets_tx, control_rx, 4);

        control_tx.send(Control::Ack(1)).unwrap();

        assert!(matches!(
            producer.drain_control(),
            Err(Error::ProtocolViolation(Violation::AckExceedsInFlight { .. }))
        ));
    }

    #[tokio::test]
    async fn receiver_acks_after_threshold() {
        let (packets_tx, packets_rx) = flume::bounded(50);
        let (control_tx, control_rx) = flume::unbounded();
        let mut receiver = PacketReceiver::new(packets_rx, control_tx, 50);

        for _ in 0..25 {
            packets_tx.send(Upstream::Packet(Bytes::from_static(b"packet"))).unwrap();
        }

        for _ in 0..24 {
            poll_fn(|cx| receiver.poll_recv(cx)).await.unwrap().unwrap();
        }
        assert!(control_rx.is_empty());

        poll_fn(|cx| receiver.poll_recv(cx)).await.unwrap().unwrap();
        assert_eq!(control_rx.drain().collect::<Vec<_>>(), vec![Control::Ack(25)]);
    }

    #[test]
    fn receiver_yields_after_batch() {
        let (packets_tx, packets_rx) = flume::bounded(50);
        let (control_tx, _control_rx) = flume::unbounded();
        let mut receiver = PacketReceiver::new(packets_rx, control_tx, 50);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        for _ in 0..25 {
            packets_tx.send(Upstream::Packet(Bytes::from_static(b"packet"))).unwrap();
        }

        for _ in 0..MAX_BATCH {
            assert!(matches!(receiver.poll_recv(&mut cx), Poll::Ready(Some(Ok(_)))));
        }
        assert!(receiver.poll_recv(&mut cx).is_pending());
        assert!(matches!(receiver.poll_recv(&mut cx), Poll::Ready(Some(Ok(_)))));
    }

    #[test]
    fn repeated_pause_sends_single_message() {
        let (_packets_tx, packets_rx) = flume::bounded(10);
        let (control_tx, control_rx) = flume::unbounded();
        let mut receiver = PacketReceiver::new(packets_rx, control_tx, 10);

        receiver.pause();
        receiver.pause();
        assert_eq!(control_rx.drain().collect::<Vec<_>>(), vec![Control::Pause]);

        receiver.resume();
        receiver.resume();
        assert_eq!(control_rx.drain().collect::<Vec<_>>(), vec![Control::Resume]);
    }

    #[test]
    fn paused_receiver_does_not_deliver() {
        let (packets_tx, packets_rx) = flume::bounded(10);
        let (control_tx, _control_rx) = flume::unbounded();
        let mut receiver = PacketReceiver::new(packets_rx, control_tx, 10);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        packets_tx.send(Upstream::Packet(Bytes::from_static(b"packet"))).unwrap();

        receiver.pause();
        assert!(receiver.poll_recv(&mut cx).is_pending());

        receiver.resume();
        assert!(matches!(receiver.poll_recv(&mut cx), Poll::Ready(Some(Ok(_)))));
    }

    #[test]
    fn worker_error_is_propagated() {
        let (packets_tx, packets_rx) = flume::bounded(10);
        let (control_tx, control_rx) = flume::unbounded();
        let mut receiver = PacketReceiver::new(packets_rx, control_tx, 10);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        Producer::new(packets_tx, control_rx, 10).fail(Error::ReceiveLoopEnded);

        assert!(matches!(
            receiver.poll_recv(&mut cx),
            Poll::Ready(Some(Err(Error::ReceiveLoopEnded)))
        ));
        assert!(matches!(receiver.poll_recv(&mut cx), Poll::Ready(None)));
    }

    #[test]
    fn paused_receiver_reports_failure_immediately() {
        let (packets_tx, packets_rx) = flume::bounded(10);
        let (control_tx, control_rx) = flume::unbounded();
        let mut receiver = PacketReceiver::new(packets_rx, control_tx, 10);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        receiver.pause();
        let mut producer = Producer::new(packets_tx, control_rx, 10);
        producer.emit(Bytes::from_static(b"packet")).unwrap();
        producer.fail(Error::Read(std::io::Error::from_raw_os_error(libc::EIO)));

        assert!(matches!(
            receiver.poll_recv(&mut cx),
            Poll::Ready(Some(Err(Error::Read(_))))
        ));
        assert!(matches!(receiver.poll_recv(&mut cx), Poll::Ready(None)));
    }

    #[test]
    fn paused_receiver_reports_end_of_worker() {
        let (packets_tx, packets_rx) = flume::bounded(10);
        let (control_tx, _control_rx) = flume::unbounded();
        let mut receiver = PacketReceiver::new(packets_rx, control_tx, 10);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        receiver.pause();
        drop(packets_tx);

        assert!(matches!(receiver.poll_recv(&mut cx), Poll::Ready(None)));
    }

    #[test]
    fn held_packets_keep_their_order() {
        let (packets_tx, packets_rx) = flume::bounded(10);
        let (control_tx, _control_rx) = flume::unbounded();
        let mut receiver = PacketReceiver::new(packets_rx, control_tx, 10);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        receiver.pause();
        for i in 0..3u8 {
            packets_tx.send(Upstream::Packet(Bytes::from(vec![i]))).unwrap();
        }
        assert!(receiver.poll_recv(&mut cx).is_pending());
        packets_tx.send(Upstream::Packet(Bytes::from(vec![3]))).unwrap();

        receiver.resume();
        for i in 0..4u8 {
            let Poll::Ready(Some(Ok(packet))) = receiver.poll_recv(&mut cx) else {
                panic!("Expected packet {i}")
            };
            assert_eq!(packet.as_ref(), &[i]);
        }
    }

    #[test]
    fn full_downstream_pauses_worker() {
        let (_packets_tx, packets_rx) = flume::bounded(10);
        let (control_tx, control_rx) = flume::unbounded();
        let mut receiver = PacketReceiver::new(packets_rx, control_tx, 10);

        receiver.set_downstream_ready(false);
        receiver.set_downstream_ready(false);
        assert_eq!(control_rx.drain().collect::<Vec<_>>(), vec![Control::Pause]);

        receiver.pause();
        receiver.set_downstream_ready(true);
        assert!(control_rx.is_empty());

        receiver.resume();
        assert_eq!(control_rx.drain().collect::<Vec<_>>(), vec![Control::Resume]);
    }

    #[tokio::test]
    async fn destroy_sends_single_destroy_message() {
        let (packets_tx, packets_rx) = flume::bounded(10);
        let (control_tx, control_rx) = flume::unbounded();
        let mut receiver = PacketReceiver::new(packets_rx, control_tx, 10);
        drop(packets_tx); // Worker is gone.

        receiver.destroy(Duration::from_secs(1)).await;
        receiver.destroy(Duration::from_secs(1)).await;

        assert_eq!(control_rx.drain().collect::<Vec<_>>(), vec![Control::Destroy]);
    }
}
