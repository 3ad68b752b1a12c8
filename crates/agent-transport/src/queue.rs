//! Bounded in-memory delivery queue with byte-capacity accounting.

use crate::serializer::{ByteLengthSizer, PayloadSizer};
use crate::{Envelope, TransportError, TransportResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

/// FIFO of envelopes awaiting delivery.
///
/// All operations are safe to call concurrently from any number of
/// producers and consumers. Every dequeue hands a given envelope to exactly
/// one caller.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Insert or fail with [`TransportError::QueueFull`].
    fn add(&self, envelope: Envelope) -> TransportResult<()>;

    /// Insert if there is room, handing the envelope back otherwise.
    fn offer(&self, envelope: Envelope) -> Result<(), Envelope>;

    /// Pop the oldest envelope or fail with [`TransportError::EmptyQueue`].
    fn remove(&self) -> TransportResult<Envelope>;

    /// Pop the oldest envelope if there is one.
    fn poll(&self) -> Option<Envelope>;

    /// Pop the oldest envelope, waiting up to `timeout` for one to arrive.
    async fn poll_timeout(&self, timeout: Duration) -> Option<Envelope>;

    /// Copy of the oldest envelope or [`TransportError::EmptyQueue`].
    fn element(&self) -> TransportResult<Envelope>;

    /// Copy of the oldest envelope if there is one.
    fn peek(&self) -> Option<Envelope>;

    /// Number of queued envelopes.
    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

struct QueueState {
    /// Envelopes with the byte cost charged when they were inserted.
    entries: VecDeque<(Envelope, u64)>,
    total_bytes: u64,
}

/// Memory-only [`MessageQueue`] bounded by the total byte cost of its
/// entries.
///
/// The entry list and the byte counter live under one lock and are always
/// updated together.
pub struct InMemoryMessageQueue {
    capacity: u64,
    sizer: Arc<dyn PayloadSizer>,
    state: Mutex<QueueState>,
    available: Notify,
}

impl InMemoryMessageQueue {
    /// Create a queue charging raw string and byte lengths.
    pub fn new(capacity: u64) -> Self {
        Self::with_sizer(capacity, Arc::new(ByteLengthSizer))
    }

    /// Create a queue charging sizes declared by `sizer`, usually the
    /// serializer that produced the payloads.
    pub fn with_sizer(capacity: u64, sizer: Arc<dyn PayloadSizer>) -> Self {
        Self {
            capacity,
            sizer,
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                total_bytes: 0,
            }),
            available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total byte cost of the envelopes currently held.
    pub fn bytes_size(&self) -> u64 {
        self.state.lock().total_bytes
    }

    fn size_of(&self, envelope: &Envelope) -> u64 {
        self.sizer
            .size_of_destination(&envelope.destination)
            .saturating_add(self.sizer.size_of_payload(&envelope.payload))
    }

    /// Insert if capacity allows; on rejection returns the envelope and the
    /// byte total the insertion would have needed.
    fn insert(&self, envelope: Envelope) -> Result<(), (Envelope, u64)> {
        let size = self.size_of(&envelope);
        {
            let mut state = self.state.lock();
            let required = state.total_bytes.saturating_add(size);
            if required > self.capacity {
                return Err((envelope, required));
            }
            state.total_bytes = required;
            state.entries.push_back((envelope, size));
            trace!(size, total_bytes = required, "Enqueued envelope");
        }
        self.available.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<Envelope> {
        let mut state = self.state.lock();
        let (envelope, size) = state.entries.pop_front()?;
        state.total_bytes -= size;
        Some(envelope)
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    fn add(&self, envelope: Envelope) -> TransportResult<()> {
        self.insert(envelope)
            .map_err(|(_, required)| TransportError::QueueFull {
                required,
                capacity: self.capacity,
            })
    }

    fn offer(&self, envelope: Envelope) -> Result<(), Envelope> {
        self.insert(envelope).map_err(|(envelope, _)| envelope)
    }

    fn remove(&self) -> TransportResult<Envelope> {
        self.pop().ok_or(TransportError::EmptyQueue)
    }

    fn poll(&self) -> Option<Envelope> {
        self.pop()
    }

    async fn poll_timeout(&self, timeout: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so an insert between the
            // check and the await is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.pop() {
                return Some(envelope);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop();
            }
        }
    }

    fn element(&self) -> TransportResult<Envelope> {
        self.peek().ok_or(TransportError::EmptyQueue)
    }

    fn peek(&self) -> Option<Envelope> {
        self.state
            .lock()
            .entries
            .front()
            .map(|(envelope, _)| envelope.clone())
    }

    fn size(&self) -> usize {
        self.state.lock().entries.len()
    }
}
