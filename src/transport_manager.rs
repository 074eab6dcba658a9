use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

use crate::config::TransportConfig;
use crate::connection::{Connection, InboundAction};
use crate::datagram_socket::{is_endpoint_closed, DatagramSocket};
use crate::event_sink::{DisconnectReason, EventSink};
use crate::frame::{DeliveryKind, FrameKind};
use crate::outbound::{send_loop, OutboundItem, OutboundQueue};
use crate::shutdown::ShutdownSignal;

/// The TransportManager owns the UDP endpoint and everything that goes with it: It listens on
///  the socket, creating a [Connection] for each new peer address, dispatches received datagrams
///  to their connections, evicts connections that time out, and writes all outgoing datagrams.
///
/// A manager goes through its lifecycle exactly once: it is created idle, runs after `start`,
///  and can not be restarted after `stop`.
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: TransportConfig,
    sink: Arc<dyn EventSink>,
    shutdown: ShutdownSignal,
    /// raised after the remaining connections are retired, so that their final acks are written
    send_stop: ShutdownSignal,
    connections: RwLock<FxHashMap<SocketAddr, Arc<Connection>>>,
    outbound: OutboundQueue,
    lifecycle: Mutex<Lifecycle>,
    local_addr: OnceLock<SocketAddr>,
}

enum Lifecycle {
    Idle {
        outbound_receiver: mpsc::Receiver<OutboundItem>,
    },
    Running(Workers),
    Stopped,
}

struct Workers {
    socket: Arc<dyn DatagramSocket>,
    receive_loop: JoinHandle<()>,
    sweep_loop: JoinHandle<()>,
    send_loop: JoinHandle<()>,
}

async fn join_worker(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!("{} terminated abnormally: {}", name, e);
    }
}

impl TransportManager {
    pub fn new(config: TransportConfig, sink: Arc<dyn EventSink>) -> anyhow::Result<TransportManager> {
        config.validate()?;

        let (outbound, outbound_receiver) = OutboundQueue::new(config.outbound_queue_capacity);
        Ok(TransportManager {
            inner: Arc::new(ManagerInner {
                config,
                sink,
                shutdown: ShutdownSignal::new(),
                send_stop: ShutdownSignal::new(),
                connections: Default::default(),
                outbound,
                lifecycle: Mutex::new(Lifecycle::Idle { outbound_receiver }),
                local_addr: OnceLock::new(),
            }),
        })
    }

    /// Binds a UDP socket to the configured IP address and the given port (0 for an ephemeral
    ///  port) and starts the workers
    pub async fn start(&self, port: u16) -> anyhow::Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !Self::is_startable(&lifecycle)? {
            return Ok(());
        }

        let socket = UdpSocket::bind(SocketAddr::new(self.inner.config.bind_ip, port)).await?;
        info!("bound UDP socket to {:?}", socket.local_addr()?);
        self.launch(&mut lifecycle, Arc::new(socket))
    }

    /// Starts the workers on an endpoint provided by the caller
    pub async fn start_with_socket(&self, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !Self::is_startable(&lifecycle)? {
            return Ok(());
        }
        self.launch(&mut lifecycle, socket)
    }

    fn is_startable(lifecycle: &Lifecycle) -> anyhow::Result<bool> {
        match lifecycle {
            Lifecycle::Idle { .. } => Ok(true),
            Lifecycle::Running(_) => {
                debug!("transport is already running - ignoring start");
                Ok(false)
            }
            Lifecycle::Stopped => bail!("transport was stopped and can not be restarted"),
        }
    }

    fn launch(&self, lifecycle: &mut Lifecycle, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<()> {
        let local_addr = socket.local_addr()?;

        let Lifecycle::Idle { outbound_receiver } = std::mem::replace(lifecycle, Lifecycle::Stopped)
        else {
            bail!("transport is not idle");
        };

        let _ = self.inner.local_addr.set(local_addr);
        info!("starting transport on {:?}", local_addr);

        let workers = Workers {
            socket: socket.clone(),
            receive_loop: tokio::spawn(self.inner.clone().receive_loop(socket.clone())),
            sweep_loop: tokio::spawn(self.inner.clone().sweep_loop()),
            send_loop: tokio::spawn(send_loop(outbound_receiver, socket, self.inner.send_stop.clone())),
        };
        *lifecycle = Lifecycle::Running(workers);
        Ok(())
    }

    /// Stops all workers and reports every remaining connection as lost with reason
    ///  [DisconnectReason::Shutdown]. Datagrams that were queued for sending before are still
    ///  written.
    ///
    /// Calling this more than once (or concurrently) is harmless. It must however not be awaited
    ///  from inside an [EventSink] callback, since it waits for the workers invoking them.
    pub async fn stop(&self) {
        self.inner.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.local_addr.get().is_some() && !self.inner.shutdown.is_triggered()
    }

    /// The address the endpoint is bound to, `None` before the transport was started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    pub async fn connection(&self, peer_addr: SocketAddr) -> Option<Arc<Connection>> {
        self.inner.connections.read().await
            .get(&peer_addr)
            .cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn send(&self, connection: &Connection, data: &[u8], kind: DeliveryKind) {
        connection.send(data, kind).await
    }

    pub async fn send_and_wait(&self, connection: &Connection, data: &[u8], kind: DeliveryKind) -> anyhow::Result<()> {
        connection.send_and_wait(data, kind).await
    }

    /// Sends to every connection known at the time of the call, except those with an address
    ///  in `excluded`
    pub async fn send_to_all(&self, data: &[u8], kind: DeliveryKind, excluded: &[SocketAddr]) {
        let recipients = self.inner.connections.read().await
            .values()
            .filter(|c| !excluded.contains(&c.peer_addr()))
            .cloned()
            .collect::<Vec<_>>();

        trace!("sending to {} connection(s)", recipients.len());
        for connection in recipients {
            connection.send(data, kind).await;
        }
    }

    /// Tells the peer that the connection is closed and removes it, reporting it as lost with
    ///  reason [DisconnectReason::ExplicitDisconnect]. Returns `false` if there was no connection
    ///  for the address.
    pub async fn disconnect(&self, peer_addr: SocketAddr) -> bool {
        match self.inner.remove_connection(peer_addr).await {
            Some(connection) => {
                connection.send_control(FrameKind::Disconnect).await;
                self.inner.retire_connection(connection, DisconnectReason::ExplicitDisconnect).await;
                true
            }
            None => false,
        }
    }
}

impl ManagerInner {
    async fn receive_loop(self: Arc<Self>, socket: Arc<dyn DatagramSocket>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.receive_buffer_size];
        loop {
            let (num_read, from) = select! {
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok(x) => x,
                        Err(e) if is_endpoint_closed(&e) => {
                            error!("UDP endpoint is closed: {}", e);
                            break;
                        }
                        Err(e) => {
                            warn!("error receiving datagram: {}", e);
                            continue;
                        }
                    }
                }
                _ = self.shutdown.wait() => {
                    debug!("receive loop canceled");
                    break;
                }
            };

            let span = span!(Level::TRACE, "datagram_received", peer = ?from);
            self.on_datagram(&buf[..num_read], from)
                .instrument(span)
                .await;
        }

        if self.shutdown.trigger() {
            info!("receive loop terminated on its own - shutting down transport");
            let inner = self.clone();
            tokio::spawn(async move { inner.stop().await });
        }
        info!("receive loop terminated");
    }

    async fn on_datagram(self: &Arc<Self>, raw: &[u8], from: SocketAddr) {
        trace!("received {} bytes", raw.len());

        let Some(connection) = self.get_or_create_connection(from).await
        else {
            return;
        };

        match connection.process_inbound(raw).await {
            Ok(InboundAction::None) => {}
            Ok(InboundAction::Connect) => {
                debug!("received CONNECT from {:?}", from);
            }
            Ok(InboundAction::Disconnect) => {
                debug!("received DISCONNECT from {:?}", from);
                if let Some(connection) = self.remove_connection(from).await {
                    self.retire_connection(connection, DisconnectReason::ExplicitDisconnect).await;
                }
            }
            Err(e) => {
                warn!("dropping undecodable datagram from {:?}: {}", from, e);
            }
        }
    }

    async fn get_or_create_connection(&self, peer_addr: SocketAddr) -> Option<Arc<Connection>> {
        if let Some(connection) = self.connections.read().await.get(&peer_addr) {
            return Some(connection.clone());
        }

        let connection = {
            let mut connections = self.connections.write().await;
            if let Some(connection) = connections.get(&peer_addr) {
                return Some(connection.clone());
            }
            if connections.len() >= self.config.max_connections {
                warn!("connection limit of {} reached - dropping datagram from {:?}", self.config.max_connections, peer_addr);
                return None;
            }

            let connection = Connection::new(peer_addr, self.outbound.clone(), self.sink.clone(), &self.config);
            connections.insert(peer_addr, connection.clone());
            connection
        };

        debug!("new connection from {:?}", peer_addr);
        self.sink.on_connection_established(connection.clone()).await;
        Some(connection)
    }

    /// Removal happens under the write lock, so only one caller gets the connection and is
    ///  responsible for retiring it
    async fn remove_connection(&self, peer_addr: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(&peer_addr)
    }

    async fn retire_connection(&self, connection: Arc<Connection>, reason: DisconnectReason) {
        debug!("connection to {:?} lost: {}", connection.peer_addr(), reason);
        self.sink.on_connection_lost(connection.clone(), reason).await;
        connection.dispose().await;
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticks = interval(self.config.sweep_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => self.sweep_timed_out().await,
                _ = self.shutdown.wait() => break,
            }
        }
        debug!("sweep loop terminated");
    }

    async fn sweep_timed_out(&self) {
        let now = Instant::now();

        let timed_out = {
            let mut connections = self.connections.write().await;
            let addrs = connections.iter()
                .filter(|(_, c)| c.is_timed_out(now, self.config.connection_timeout))
                .map(|(addr, _)| *addr)
                .collect::<Vec<_>>();

            addrs.iter()
                .flat_map(|addr| connections.remove(addr))
                .collect::<Vec<_>>()
        };

        for connection in timed_out {
            info!("connection to {:?} timed out", connection.peer_addr());
            self.retire_connection(connection, DisconnectReason::Timeout).await;
        }
    }

    async fn stop(&self) {
        // the lock is held until shutdown is complete, so concurrent callers return only after that
        let mut lifecycle = self.lifecycle.lock().await;

        let workers = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(workers) => Some(workers),
            Lifecycle::Idle { .. } => None,
            Lifecycle::Stopped => {
                debug!("transport is already stopped");
                return;
            }
        };

        info!("shutting down transport");
        self.shutdown.trigger();

        let workers = match workers {
            Some(workers) => {
                join_worker("receive loop", workers.receive_loop).await;
                join_worker("sweep loop", workers.sweep_loop).await;
                Some((workers.send_loop, workers.socket))
            }
            None => None,
        };

        // the send loop is still running here, so acks for frames that are drained on dispose
        //  are written
        let remaining = self.connections.write().await
            .drain()
            .map(|(_, c)| c)
            .collect::<Vec<_>>();
        for connection in remaining {
            self.retire_connection(connection, DisconnectReason::Shutdown).await;
        }

        self.send_stop.trigger();
        if let Some((send_loop, socket)) = workers {
            join_worker("send loop", send_loop).await;
            drop(socket);
        }

        info!("transport shut down");
    }
}
