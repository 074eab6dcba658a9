use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::event_sink::EventSink;
use crate::frame::{DeliveryKind, Frame, FrameError, FrameKind};
use crate::ordering_channel::{ChannelConsumer, ChannelMode, OrderingChannel};
use crate::outbound::OutboundQueue;
use crate::sequence_number::SequenceNumber;

/// What the transport manager has to do in response to a datagram, beyond what the connection
///  handles itself
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InboundAction {
    None,
    Connect,
    Disconnect,
}

/// The transport's state for a single peer address. A connection exists from the first datagram
///  received from that address until it is removed for one of the reasons in
///  [DisconnectReason](crate::event_sink::DisconnectReason), and it is never reused after that.
pub struct Connection {
    peer_addr: SocketAddr,
    outbound: OutboundQueue,
    sink: Arc<dyn EventSink>,
    sequenced: OrderingChannel,
    reliable: OrderingChannel,
    /// shared by RELIABLE and SEQUENCED frames, so each of the two streams has gaps in its
    ///  numbering as seen by the peer
    next_sequence_number: AtomicI32,
    created_at: Instant,
    /// nanos since `created_at`
    last_liveness: AtomicU64,
    disposed: AtomicBool,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{:?}}}", self.peer_addr)
    }
}

impl Connection {
    /// Spawns the connection's two channel consumers - this must be called from inside a tokio
    ///  runtime
    pub fn new(peer_addr: SocketAddr, outbound: OutboundQueue, sink: Arc<dyn EventSink>, config: &TransportConfig) -> Arc<Connection> {
        Arc::new_cyclic(|connection: &Weak<Connection>| {
            let consumer = Arc::new(ConnectionChannelConsumer {
                connection: connection.clone(),
            });

            Connection {
                peer_addr,
                outbound,
                sink,
                sequenced: OrderingChannel::spawn(ChannelMode::Sequenced, config.channel_queue_capacity, config.reorder_window, consumer.clone()),
                reliable: OrderingChannel::spawn(ChannelMode::Reliable, config.channel_queue_capacity, config.reorder_window, consumer),
                next_sequence_number: AtomicI32::new(0),
                created_at: Instant::now(),
                last_liveness: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn last_liveness(&self) -> Instant {
        self.created_at + Duration::from_nanos(self.last_liveness.load(Ordering::Acquire))
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_liveness()) > timeout
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn refresh_liveness(&self) {
        let nanos = Instant::now()
            .saturating_duration_since(self.created_at)
            .as_nanos();
        self.last_liveness.fetch_max(nanos.min(u64::MAX as u128) as u64, Ordering::AcqRel);
    }

    fn next_sequence_number(&self) -> SequenceNumber {
        SequenceNumber::from_raw(self.next_sequence_number.fetch_add(1, Ordering::AcqRel))
    }

    fn create_frame(&self, payload: &[u8], kind: DeliveryKind) -> Frame {
        let sequence_number = if kind.is_ordered() {
            self.next_sequence_number()
        }
        else {
            SequenceNumber::ZERO
        };
        Frame::new(kind.frame_kind(), sequence_number, Bytes::copy_from_slice(payload))
    }

    /// Enqueues the payload for sending, without waiting for the network write
    pub async fn send(&self, payload: &[u8], kind: DeliveryKind) {
        let frame = self.create_frame(payload, kind);
        trace!("sending {:?} to {:?}", frame, self.peer_addr);
        self.outbound.enqueue(frame.encode(), self.peer_addr).await;
    }

    /// Waits until the send loop wrote the datagram, returning the outcome of the write
    pub async fn send_and_wait(&self, payload: &[u8], kind: DeliveryKind) -> anyhow::Result<()> {
        let frame = self.create_frame(payload, kind);
        trace!("sending {:?} to {:?}", frame, self.peer_addr);
        self.outbound.enqueue_and_wait(frame.encode(), self.peer_addr).await
    }

    pub(crate) async fn send_control(&self, kind: FrameKind) {
        self.outbound.enqueue(Frame::control(kind).encode(), self.peer_addr).await;
    }

    /// Handles a single datagram received from this connection's peer. Ordered frames are only
    ///  queued for their channel here, so they may not be delivered yet when this returns.
    pub async fn process_inbound(self: &Arc<Self>, raw: &[u8]) -> Result<InboundAction, FrameError> {
        let frame = Frame::decode(raw)?;
        trace!("received {:?} from {:?}", frame, self.peer_addr);

        if self.is_disposed() {
            debug!("connection to {:?} is disposed - ignoring {:?}", self.peer_addr, frame);
            return Ok(InboundAction::None);
        }

        match frame.kind() {
            FrameKind::Connect => return Ok(InboundAction::Connect),
            FrameKind::Disconnect => return Ok(InboundAction::Disconnect),
            FrameKind::Ping => {
                self.refresh_liveness();
                self.send_control(FrameKind::Pong).await;
            }
            FrameKind::Ack | FrameKind::Pong => {}
            FrameKind::Reliable => self.enqueue_ordered(&self.reliable, frame).await,
            FrameKind::Sequenced => self.enqueue_ordered(&self.sequenced, frame).await,
            FrameKind::Unreliable => {
                self.sink.on_packet_received(self.clone(), frame.payload()).await;
            }
        }
        Ok(InboundAction::None)
    }

    async fn enqueue_ordered(&self, channel: &OrderingChannel, frame: Frame) {
        if let Err(e) = channel.enqueue(frame).await {
            debug!("dropping frame from {:?}: {}", self.peer_addr, e);
        }
    }

    /// Closes both channels, waiting until all frames they already accepted are delivered (and
    ///  acknowledged). Calling this repeatedly is harmless.
    pub async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            debug!("disposing connection to {:?}", self.peer_addr);
        }
        tokio::join!(self.sequenced.dispose(), self.reliable.dispose());
    }
}

struct ConnectionChannelConsumer {
    connection: Weak<Connection>,
}

#[async_trait]
impl ChannelConsumer for ConnectionChannelConsumer {
    async fn on_deliver(&self, frame: Frame) {
        if let Some(connection) = self.connection.upgrade() {
            connection.sink.on_packet_received(connection.clone(), frame.payload()).await;
        }
    }

    async fn on_acknowledge(&self, sequence_number: SequenceNumber) {
        if let Some(connection) = self.connection.upgrade() {
            trace!("acknowledging #{} to {:?}", sequence_number, connection.peer_addr);
            connection.outbound.enqueue(Frame::ack(sequence_number).encode(), connection.peer_addr).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sink::MockEventSink;
    use crate::test_util::{wait_until, CollectingSink, SinkEvent, TestOutbound};
    use rstest::rstest;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 4711))
    }

    fn ordered(kind: FrameKind, sequence_number: i32, payload: &[u8]) -> Vec<u8> {
        Frame::new(kind, SequenceNumber::from_raw(sequence_number), payload.to_vec()).encode().to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_refreshes_liveness_and_answers_pong() {
        let outbound = TestOutbound::start();
        let connection = Connection::new(peer(), outbound.queue.clone(), CollectingSink::new(), &TransportConfig::default());
        let created = connection.last_liveness();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(connection.is_timed_out(Instant::now(), Duration::from_secs(4)));

        let action = connection.process_inbound(&Frame::control(FrameKind::Ping).encode()).await.unwrap();
        assert_eq!(action, InboundAction::None);
        assert_eq!(connection.last_liveness(), created + Duration::from_secs(5));
        assert!(!connection.is_timed_out(Instant::now(), Duration::from_secs(4)));

        let socket = outbound.socket.clone();
        wait_until(|| !socket.sent().is_empty()).await;
        assert_eq!(socket.sent_frames(), vec![(Frame::control(FrameKind::Pong), peer())]);
    }

    #[rstest]
    #[case::fresh(0, false)]
    #[case::at_timeout(10_000, false)]
    #[case::just_after_timeout(10_001, true)]
    #[case::long_after_timeout(60_000, true)]
    #[tokio::test(start_paused = true)]
    async fn test_is_timed_out(#[case] elapsed_millis: u64, #[case] expected: bool) {
        let outbound = TestOutbound::start();
        let connection = Connection::new(peer(), outbound.queue.clone(), CollectingSink::new(), &TransportConfig::default());

        let now = connection.last_liveness() + Duration::from_millis(elapsed_millis);
        assert_eq!(connection.is_timed_out(now, Duration::from_secs(10)), expected);
    }

    #[tokio::test]
    async fn test_ordered_kinds_share_sequence_numbers() {
        let outbound = TestOutbound::start();
        let connection = Connection::new(peer(), outbound.queue.clone(), CollectingSink::new(), &TransportConfig::default());

        connection.send(b"a", DeliveryKind::Reliable).await;
        connection.send(b"b", DeliveryKind::Sequenced).await;
        connection.send(b"c", DeliveryKind::Unreliable).await;
        connection.send_and_wait(b"d", DeliveryKind::Reliable).await.unwrap();

        assert_eq!(outbound.socket.sent_frames(), vec![
            (Frame::new(FrameKind::Reliable, SequenceNumber::from_raw(0), b"a".to_vec()), peer()),
            (Frame::new(FrameKind::Sequenced, SequenceNumber::from_raw(1), b"b".to_vec()), peer()),
            (Frame::new(FrameKind::Unreliable, SequenceNumber::ZERO, b"c".to_vec()), peer()),
            (Frame::new(FrameKind::Reliable, SequenceNumber::from_raw(2), b"d".to_vec()), peer()),
        ]);
    }

    #[tokio::test]
    async fn test_reliable_frames_are_reordered_and_acknowledged() {
        let outbound = TestOutbound::start();
        let sink = CollectingSink::new();
        let connection = Connection::new(peer(), outbound.queue.clone(), sink.clone(), &TransportConfig::default());

        for s in [0, 2, 1, 0] {
            connection.process_inbound(&ordered(FrameKind::Reliable, s, &[s as u8])).await.unwrap();
        }
        connection.dispose().await;

        assert_eq!(sink.events(), vec![
            SinkEvent::Received(peer(), vec![0]),
            SinkEvent::Received(peer(), vec![1]),
            SinkEvent::Received(peer(), vec![2]),
        ]);

        let socket = outbound.socket.clone();
        wait_until(|| socket.sent().len() == 3).await;
        assert_eq!(socket.sent_frames(), vec![
            (Frame::ack(SequenceNumber::from_raw(0)), peer()),
            (Frame::ack(SequenceNumber::from_raw(1)), peer()),
            (Frame::ack(SequenceNumber::from_raw(2)), peer()),
        ]);
    }

    #[tokio::test]
    async fn test_sequenced_frames_are_reordered_without_ack() {
        let outbound = TestOutbound::start();
        let sink = CollectingSink::new();
        let connection = Connection::new(peer(), outbound.queue.clone(), sink.clone(), &TransportConfig::default());

        for s in [2, 0, 1, 1] {
            connection.process_inbound(&ordered(FrameKind::Sequenced, s, &[s as u8])).await.unwrap();
        }
        connection.dispose().await;

        assert_eq!(sink.received(), vec![vec![0], vec![1], vec![2]]);

        outbound.queue.enqueue_and_wait(Bytes::new(), peer()).await.unwrap();
        assert_eq!(outbound.socket.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let outbound = TestOutbound::start();
        let sink = CollectingSink::new();
        let connection = Connection::new(peer(), outbound.queue.clone(), sink.clone(), &TransportConfig::default());

        // a gap on the reliable channel does not hold back the sequenced channel
        connection.process_inbound(&ordered(FrameKind::Reliable, 1, b"r1")).await.unwrap();
        connection.process_inbound(&ordered(FrameKind::Sequenced, 0, b"s0")).await.unwrap();
        connection.dispose().await;

        assert_eq!(sink.received(), vec![b"s0".to_vec()]);
    }

    #[tokio::test]
    async fn test_unreliable_goes_to_sink_immediately() {
        let outbound = TestOutbound::start();
        let mut sink = MockEventSink::new();
        sink.expect_on_packet_received()
            .once()
            .withf(|connection, payload| connection.peer_addr() == peer() && payload == b"hello")
            .returning(|_, _| ());

        let connection = Connection::new(peer(), outbound.queue.clone(), Arc::new(sink), &TransportConfig::default());
        connection.process_inbound(&Frame::new(FrameKind::Unreliable, SequenceNumber::ZERO, b"hello".to_vec()).encode()).await.unwrap();
    }

    #[rstest]
    #[case::connect(vec![0], InboundAction::Connect)]
    #[case::disconnect(vec![1], InboundAction::Disconnect)]
    #[case::ack(vec![2, 0,0,0,5], InboundAction::None)]
    #[case::pong(vec![4], InboundAction::None)]
    #[tokio::test]
    async fn test_control_frames(#[case] raw: Vec<u8>, #[case] expected: InboundAction) {
        let outbound = TestOutbound::start();
        let sink = CollectingSink::new();
        let connection = Connection::new(peer(), outbound.queue.clone(), sink.clone(), &TransportConfig::default());

        assert_eq!(connection.process_inbound(&raw).await, Ok(expected));
        connection.dispose().await;
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_datagram() {
        let outbound = TestOutbound::start();
        let connection = Connection::new(peer(), outbound.queue.clone(), CollectingSink::new(), &TransportConfig::default());

        assert_eq!(connection.process_inbound(&[9, 1, 2]).await, Err(FrameError::UnknownKind(9)));
        assert_eq!(connection.process_inbound(&[]).await, Err(FrameError::FrameTooShort { needed: 1, remaining: 0 }));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_final() {
        let outbound = TestOutbound::start();
        let sink = CollectingSink::new();
        let connection = Connection::new(peer(), outbound.queue.clone(), sink.clone(), &TransportConfig::default());

        connection.dispose().await;
        assert!(connection.is_disposed());
        connection.dispose().await;

        connection.process_inbound(&ordered(FrameKind::Reliable, 0, b"late")).await.unwrap();
        connection.process_inbound(&Frame::new(FrameKind::Unreliable, SequenceNumber::ZERO, b"late".to_vec()).encode()).await.unwrap();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_send_after_transport_shutdown() {
        let outbound = TestOutbound::start();
        let connection = Connection::new(peer(), outbound.queue.clone(), CollectingSink::new(), &TransportConfig::default());

        outbound.shutdown.trigger();
        outbound.join().await;

        connection.send(b"dropped", DeliveryKind::Reliable).await;
        assert!(connection.send_and_wait(b"dropped", DeliveryKind::Sequenced).await.is_err());
        assert!(outbound.socket.sent().is_empty());
    }
}
