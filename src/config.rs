use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::bail;

use crate::frame::Frame;

pub struct TransportConfig {
    /// The local IP address to bind to - the port is passed to
    ///  [TransportManager::start](crate::transport_manager::TransportManager::start)
    pub bind_ip: IpAddr,

    /// Size of the buffer a single datagram is received into. Datagrams that are bigger are
    ///  truncated by the operating system, so this should not be smaller than the biggest
    ///  datagram any peer sends. The default is the biggest possible UDP payload.
    pub receive_buffer_size: usize,

    /// A connection that did not receive a PING for this long is considered lost. The
    ///  transport never sends PINGs itself, keeping a connection alive is the peer's business.
    pub connection_timeout: Duration,

    /// The interval at which connections are checked for timeouts. Timeouts are detected with
    ///  a delay of up to this interval.
    pub sweep_interval: Duration,

    /// Number of datagrams that can be waiting for the send loop before senders have to wait
    pub outbound_queue_capacity: usize,

    /// Number of received frames per ordered channel that can be waiting for delivery before
    ///  the receive loop has to wait
    pub channel_queue_capacity: usize,

    /// Ordered frames that are this many sequence numbers (or more) ahead of the next deliverable
    ///  one are dropped. This bounds the memory a single peer can make a channel buffer.
    pub reorder_window: u32,

    /// Datagrams from new addresses are dropped while this many connections exist
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            receive_buffer_size: 65_507,
            connection_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            outbound_queue_capacity: 4096,
            channel_queue_capacity: 1024,
            reorder_window: 1024,
            max_connections: 4096,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.receive_buffer_size < Frame::MAX_HEADER_LEN {
            bail!("receive buffer size must be at least {} bytes to hold a frame header", Frame::MAX_HEADER_LEN);
        }
        if self.connection_timeout.is_zero() {
            bail!("connection timeout must not be zero");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must not be zero");
        }
        if self.outbound_queue_capacity == 0 {
            bail!("outbound queue capacity must not be zero");
        }
        if self.channel_queue_capacity == 0 {
            bail!("channel queue capacity must not be zero");
        }
        if self.reorder_window == 0 {
            bail!("reorder window must not be zero");
        }
        if self.max_connections == 0 {
            bail!("max connections must not be zero");
        }

        Ok(())
    }
}
