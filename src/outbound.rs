use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::datagram_socket::DatagramSocket;
use crate::shutdown::ShutdownSignal;

pub struct OutboundItem {
    buf: Bytes,
    to: SocketAddr,
    completion: Option<oneshot::Sender<io::Result<()>>>,
}

/// The producer side of the transport's single outbound queue. Every datagram the transport
///  sends goes through here, and the send loop writes them strictly in enqueue order.
#[derive(Clone)]
pub struct OutboundQueue {
    sender: mpsc::Sender<OutboundItem>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> (OutboundQueue, mpsc::Receiver<OutboundItem>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (OutboundQueue { sender }, receiver)
    }

    /// Fire and forget: this waits for queue capacity but not for the write itself. If the
    ///  send loop is gone, the datagram is dropped.
    pub async fn enqueue(&self, buf: Bytes, to: SocketAddr) {
        let item = OutboundItem { buf, to, completion: None };
        if self.sender.send(item).await.is_err() {
            warn!("outbound queue is closed - dropping datagram to {:?}", to);
        }
    }

    /// Waits until the send loop has written the datagram, returning the outcome of the write
    pub async fn enqueue_and_wait(&self, buf: Bytes, to: SocketAddr) -> anyhow::Result<()> {
        let (completion, written) = oneshot::channel();
        let item = OutboundItem { buf, to, completion: Some(completion) };

        if self.sender.send(item).await.is_err() {
            warn!("outbound queue is closed - dropping datagram to {:?}", to);
            return Err(anyhow!("transport is shut down, datagram to {:?} was not sent", to));
        }

        written.await
            .map_err(|_| anyhow!("datagram to {:?} was discarded before it was written", to))??;
        Ok(())
    }
}

/// The sole consumer of the outbound queue. A failed write affects only its own datagram.
///  When the shutdown signal is raised, datagrams that are already queued are still written.
pub async fn send_loop(mut receiver: mpsc::Receiver<OutboundItem>, socket: Arc<dyn DatagramSocket>, shutdown: ShutdownSignal) {
    info!("starting send loop");

    loop {
        select! {
            item = receiver.recv() => {
                match item {
                    Some(item) => write(socket.as_ref(), item).await,
                    None => {
                        debug!("all outbound queue handles are dropped");
                        break;
                    }
                }
            }
            _ = shutdown.wait() => {
                receiver.close();
                let mut num_flushed = 0usize;
                while let Ok(item) = receiver.try_recv() {
                    write(socket.as_ref(), item).await;
                    num_flushed += 1;
                }
                debug!("flushed {} queued datagram(s) on shutdown", num_flushed);
                break;
            }
        }
    }

    info!("send loop terminated");
}

async fn write(socket: &dyn DatagramSocket, item: OutboundItem) {
    trace!("writing {} bytes to {:?}", item.buf.len(), item.to);

    let result = socket.send_to(&item.buf, item.to).await
        .map(|_| ());
    if let Err(e) = &result {
        error!("error sending datagram to {:?}: {}", item.to, e);
    }

    if let Some(completion) = item.completion {
        // the caller may have stopped waiting
        let _ = completion.send(result);
    }
}
