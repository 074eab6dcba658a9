use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::connection::Connection;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DisconnectReason {
    /// no PING from the peer within the configured connection timeout
    Timeout,
    /// the peer sent a DISCONNECT frame, or the application called
    ///  [TransportManager::disconnect](crate::transport_manager::TransportManager::disconnect)
    ExplicitDisconnect,
    /// the transport was stopped
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ExplicitDisconnect => "explicit disconnect",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The application's view of the transport. Callbacks for a given connection and channel are
///  invoked in order, but callbacks for different connections (or for different channels of
///  the same connection) may run concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn on_connection_established(&self, connection: Arc<Connection>);

    /// Called exactly once per connection, after which the connection is no longer known to
    ///  the transport
    async fn on_connection_lost(&self, connection: Arc<Connection>, reason: DisconnectReason);

    async fn on_packet_received(&self, connection: Arc<Connection>, payload: &[u8]);
}
