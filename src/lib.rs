//! A connection-oriented transport on top of UDP. Every peer address gets a [Connection] with
//!  three ways of sending data: unreliable datagrams, a sequenced channel that delivers in order
//!  and drops stale frames, and a reliable channel that additionally acknowledges every delivered
//!  frame.
//!
//! The [TransportManager] owns the UDP endpoint and reports everything that happens to the
//!  application through an [EventSink].

pub mod config;
pub mod connection;
pub mod datagram_socket;
pub mod event_sink;
pub mod frame;
pub mod ordering_channel;
pub mod outbound;
pub mod sequence_number;
pub mod shutdown;
pub mod transport_manager;

#[cfg(test)]
pub mod test_util;

pub use config::TransportConfig;
pub use connection::Connection;
pub use event_sink::{DisconnectReason, EventSink};
pub use frame::DeliveryKind;
pub use transport_manager::TransportManager;
