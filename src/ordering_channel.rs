use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::frame::Frame;
use crate::sequence_number::SequenceNumber;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelMode {
    /// ordered delivery without acknowledgement
    Sequenced,
    /// ordered delivery, each delivered sequence number is acknowledged exactly once
    Reliable,
}

/// The receiving end of a channel: gets frames in sequence order and, for reliable channels,
///  the acknowledgement for each delivered frame right after its delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelConsumer: Send + Sync + 'static {
    async fn on_deliver(&self, frame: Frame);
    async fn on_acknowledge(&self, sequence_number: SequenceNumber);
}

/// The reorder state of a single channel. It is owned by the channel's consuming task, so it
///  is never accessed concurrently.
///
/// There is no skip-ahead: If a frame is lost for good, everything after it stays buffered
///  and the channel stalls. `missing` records the gaps but does not trigger re-sending.
///
/// Frames that are `reorder_window` or more ahead of `expected` are dropped, which bounds both
///  `pending` and `missing`.
pub struct ReorderBuffer {
    mode: ChannelMode,
    reorder_window: u32,
    /// the next sequence number eligible for delivery
    expected: SequenceNumber,
    /// the highest sequence number that was buffered so far - gaps below it are already marked
    highest_buffered: Option<SequenceNumber>,
    /// frames that arrived ahead of `expected`
    pending: BTreeMap<SequenceNumber, Frame>,
    /// sequence numbers that were skipped over and did not arrive yet - reliable mode only
    missing: BTreeSet<SequenceNumber>,
}

impl ReorderBuffer {
    pub fn new(mode: ChannelMode, reorder_window: u32) -> ReorderBuffer {
        ReorderBuffer {
            mode,
            reorder_window,
            expected: SequenceNumber::ZERO,
            highest_buffered: None,
            pending: Default::default(),
            missing: Default::default(),
        }
    }

    pub fn expected(&self) -> SequenceNumber {
        self.expected
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn missing(&self) -> &BTreeSet<SequenceNumber> {
        &self.missing
    }

    /// Returns the frames that become deliverable through this frame's arrival, in sequence
    ///  order. That is either nothing, or the frame itself followed by the buffered frames it
    ///  unblocked.
    pub fn submit(&mut self, frame: Frame) -> Vec<Frame> {
        let sequence_number = frame.sequence_number();

        if sequence_number < self.expected {
            trace!("frame #{} is below expected #{} - discarding duplicate", sequence_number, self.expected);
            return Vec::new();
        }

        if sequence_number > self.expected {
            let distance = sequence_number.to_raw() as i64 - self.expected.to_raw() as i64;
            if distance >= self.reorder_window as i64 {
                debug!("frame #{} is beyond the reorder window of {} ahead of #{} - dropping", sequence_number, self.reorder_window, self.expected);
                return Vec::new();
            }

            if self.pending.contains_key(&sequence_number) {
                trace!("frame #{} is already buffered - discarding duplicate", sequence_number);
                return Vec::new();
            }

            if self.mode == ChannelMode::Reliable {
                // only the part of the gap above everything buffered so far is new
                match self.highest_buffered.filter(|highest| *highest >= self.expected) {
                    Some(highest) if highest > sequence_number => {}
                    Some(highest) => self.missing.extend(highest.next().to(sequence_number)),
                    None => self.missing.extend(self.expected.to(sequence_number)),
                }
                self.missing.remove(&sequence_number);
            }

            trace!("frame #{} arrived ahead of #{} - buffering", sequence_number, self.expected);
            self.highest_buffered = self.highest_buffered.max(Some(sequence_number));
            self.pending.insert(sequence_number, frame);
            return Vec::new();
        }

        let mut released = vec![frame];
        self.mark_delivered(sequence_number);

        while let Some(buffered) = self.pending.remove(&self.expected) {
            let sequence_number = buffered.sequence_number();
            released.push(buffered);
            self.mark_delivered(sequence_number);
        }

        released
    }

    fn mark_delivered(&mut self, sequence_number: SequenceNumber) {
        self.missing.remove(&sequence_number);
        self.expected = sequence_number.next();
    }
}

/// A channel is fed through a queue and drained by exactly one task which owns the
///  [ReorderBuffer], so reordering needs no locking.
pub struct OrderingChannel {
    mode: ChannelMode,
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OrderingChannel {
    /// Starts the consuming task - this must be called from inside a tokio runtime
    pub fn spawn(mode: ChannelMode, queue_capacity: usize, reorder_window: u32, consumer: Arc<dyn ChannelConsumer>) -> OrderingChannel {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let worker = tokio::spawn(Self::consume_loop(mode, reorder_window, receiver, consumer));

        OrderingChannel {
            mode,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Hands a frame to the consuming task, waiting for queue capacity if necessary
    pub async fn enqueue(&self, frame: Frame) -> anyhow::Result<()> {
        let sender = self.sender.lock().await.clone();
        match sender {
            Some(sender) => sender.send(frame).await
                .map_err(|_| anyhow!("{:?} channel is closed", self.mode)),
            None => Err(anyhow!("{:?} channel is disposed", self.mode)),
        }
    }

    /// Stops accepting frames and waits until the consuming task has processed everything
    ///  that was queued before. Calling this repeatedly is harmless.
    pub async fn dispose(&self) {
        drop(self.sender.lock().await.take());

        let mut worker = self.worker.lock().await;
        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                error!("{:?} channel consumer terminated abnormally: {}", self.mode, e);
            }
            debug!("{:?} channel disposed", self.mode);
        }
    }

    async fn consume_loop(mode: ChannelMode, reorder_window: u32, mut receiver: mpsc::Receiver<Frame>, consumer: Arc<dyn ChannelConsumer>) {
        let mut reorder_buffer = ReorderBuffer::new(mode, reorder_window);

        while let Some(frame) = receiver.recv().await {
            for released in reorder_buffer.submit(frame) {
                let sequence_number = released.sequence_number();
                consumer.on_deliver(released).await;
                if mode == ChannelMode::Reliable {
                    consumer.on_acknowledge(sequence_number).await;
                }
            }
        }

        if reorder_buffer.num_pending() > 0 {
            debug!("{:?} channel closed with {} undeliverable frame(s) waiting for #{}", mode, reorder_buffer.num_pending(), reorder_buffer.expected());
        }
    }
}
