use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// A single-shot cancellation signal shared by all workers of a transport. Once triggered it
///  stays triggered, and tasks that start waiting afterwards return immediately.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        let (sender, _) = watch::channel(false);
        ShutdownSignal {
            sender: Arc::new(sender),
        }
    }

    /// Returns `true` for the call that actually raised the signal, `false` if it was raised
    ///  before
    pub fn trigger(&self) -> bool {
        let raised = self.sender.send_if_modified(|triggered| {
            if *triggered {
                false
            }
            else {
                *triggered = true;
                true
            }
        });
        if raised {
            debug!("shutdown signal raised");
        }
        raised
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // the sender is owned by self, so the channel can not close while we wait
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }
}
