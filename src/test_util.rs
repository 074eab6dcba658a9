use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::datagram_socket::DatagramSocket;
use crate::event_sink::{DisconnectReason, EventSink};
use crate::frame::Frame;
use crate::outbound::{send_loop, OutboundQueue};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SinkEvent {
    Established(SocketAddr),
    Lost(SocketAddr, DisconnectReason),
    Received(SocketAddr, Vec<u8>),
}

/// An [EventSink] that records all callbacks in the order they happen
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<CollectingSink> {
        Default::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.events().into_iter()
            .filter_map(|e| match e {
                SinkEvent::Received(_, payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn lost(&self) -> Vec<(SocketAddr, DisconnectReason)> {
        self.events().into_iter()
            .filter_map(|e| match e {
                SinkEvent::Lost(addr, reason) => Some((addr, reason)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: SinkEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn on_connection_established(&self, connection: Arc<Connection>) {
        self.push(SinkEvent::Established(connection.peer_addr()));
    }

    async fn on_connection_lost(&self, connection: Arc<Connection>, reason: DisconnectReason) {
        self.push(SinkEvent::Lost(connection.peer_addr(), reason));
    }

    async fn on_packet_received(&self, connection: Arc<Connection>, payload: &[u8]) {
        self.push(SinkEvent::Received(connection.peer_addr(), payload.to_vec()));
    }
}

/// A [DatagramSocket] backed by memory: received datagrams are injected through the sender
///  returned by [InMemorySocket::new], sent datagrams are recorded. Receiving fails with
///  `NotConnected` once all injecting senders are dropped.
pub struct InMemorySocket {
    local_addr: SocketAddr,
    inbound: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl InMemorySocket {
    pub fn new(local_addr: SocketAddr) -> (Arc<InMemorySocket>, mpsc::Sender<(Vec<u8>, SocketAddr)>) {
        let (sender, receiver) = mpsc::channel(1024);
        let socket = InMemorySocket {
            local_addr,
            inbound: tokio::sync::Mutex::new(receiver),
            sent: Default::default(),
        };
        (Arc::new(socket), sender)
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_frames(&self) -> Vec<(Frame, SocketAddr)> {
        self.sent().into_iter()
            .map(|(buf, to)| (Frame::decode(&buf).unwrap(), to))
            .collect()
    }

    pub fn sent_frames_to(&self, to: SocketAddr) -> Vec<Frame> {
        self.sent_frames().into_iter()
            .filter(|(_, addr)| *addr == to)
            .map(|(frame, _)| frame)
            .collect()
    }
}

#[async_trait]
impl DatagramSocket for InMemorySocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.inbound.lock().await.recv().await {
            Some((datagram, from)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.sent.lock().unwrap().push((buf.to_vec(), to));
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// An outbound queue with a running send loop writing to an [InMemorySocket]
pub struct TestOutbound {
    pub queue: OutboundQueue,
    pub socket: Arc<InMemorySocket>,
    pub shutdown: ShutdownSignal,
    send_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    _inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
}

impl TestOutbound {
    pub fn start() -> TestOutbound {
        let (socket, inbound) = InMemorySocket::new(SocketAddr::from(([127, 0, 0, 1], 1)));
        let (queue, receiver) = OutboundQueue::new(64);
        let shutdown = ShutdownSignal::new();
        let send_loop = tokio::spawn(send_loop(receiver, socket.clone(), shutdown.clone()));

        TestOutbound {
            queue,
            socket,
            shutdown,
            send_loop: tokio::sync::Mutex::new(Some(send_loop)),
            _inbound: inbound,
        }
    }

    pub async fn join(&self) {
        if let Some(handle) = self.send_loop.lock().await.take() {
            handle.await.unwrap();
        }
    }
}

/// polls `condition` until it holds, failing the test if that takes too long
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition was not reached in time");
}
