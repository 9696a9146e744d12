//! Operator-facing failure channel

use crate::error::ErrorKind;
use serde::Serialize;
use tokio::sync::broadcast;

/// Data that could not be written, published for operators and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FailureEvent {
    /// Documents the store rejected for their content
    DocumentsDropped {
        target: String,
        count: u64,
        reason: String,
    },
    /// A batch (or its retryable remainder) that exhausted its retries
    BatchFailed {
        target: String,
        samples: u64,
        attempts: u32,
        error: String,
    },
    /// Batches still queued or in flight when the drain deadline passed
    ShutdownLoss { batches: u64, samples: u64 },
}

impl FailureEvent {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FailureEvent::DocumentsDropped { .. } => ErrorKind::PartialDocument,
            FailureEvent::BatchFailed { .. } => ErrorKind::Transient,
            FailureEvent::ShutdownLoss { .. } => ErrorKind::ShutdownLoss,
        }
    }

    /// Samples this event accounts for
    pub fn samples(&self) -> u64 {
        match self {
            FailureEvent::DocumentsDropped { count, .. } => *count,
            FailureEvent::BatchFailed { samples, .. } => *samples,
            FailureEvent::ShutdownLoss { samples, .. } => *samples,
        }
    }
}

/// Broadcast channel distributing failure events to subscribers
#[derive(Debug)]
pub struct FailureChannel {
    sender: broadcast::Sender<FailureEvent>,
}

impl FailureChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers reached, zero
    /// when nobody listens.
    pub fn publish(&self, event: FailureEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailureEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for FailureChannel {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
