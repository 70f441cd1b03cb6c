use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::MtrError;

/// Queue capacity; publishing beyond it drops events
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Lifecycle notification from a run.
///
/// Events only say *that* something changed; read the details from
/// [`Controller::snapshot`](super::Controller::snapshot).
#[derive(Debug, Clone)]
pub enum Event {
    /// A probe result was applied to the hop at `ttl`
    HopUpdated { ttl: u8, round: u64 },
    /// A sweep finished (early on destination reached)
    RoundCompleted { round: u64 },
    /// All rounds finished
    Done,
    /// The run stopped: fatal error or cancellation ([`MtrError::Cancelled`])
    Error { cause: Arc<MtrError> },
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Done | Event::Error { .. })
    }
}

pub type EventReceiver = mpsc::Receiver<Event>;

/// Bounded, non-blocking event bus with a single consumer
pub struct EventQueue {
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    receiver: Mutex<Option<EventReceiver>>,
    dropped: AtomicU64,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Hand out the receiving end. Only the first call gets it.
    pub fn subscribe(&self) -> Option<EventReceiver> {
        self.receiver.lock().take()
    }

    /// Publish without waiting. Returns false if the event was dropped
    /// (queue full) or the queue is already closed.
    pub fn publish(&self, event: Event) -> bool {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(?event, "event queue full, dropping");
                false
            }
            // Consumer went away; nothing to deliver to
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Publish the terminal event and close the queue. Later calls are no-ops.
    pub fn finish(&self, event: Event) {
        self.publish(event);
        self.close();
    }

    /// Close the queue; consumers see the end of the stream once drained
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Number of events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
