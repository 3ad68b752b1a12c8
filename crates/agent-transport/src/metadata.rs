//! Handshake gate: registers the agent before anything else is sent.

use crate::backoff::{try_with_exponential_backoff, BackoffConfig, Sleeper, TokioSleeper};
use crate::listener::{ListenerRegistry, TransportStateListener};
use crate::mapper::DestinationMapper;
use crate::serializer::MessageSerializer;
use crate::transport::MessageTransport;
use crate::{Destination, Envelope, TransportResult, TransportState};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Logical destination of the registration message, before mapping.
pub fn metadata_destination() -> Destination {
    Destination::new("PUT", "instances")
}

/// Completion of one handshake run.
pub struct HandshakeHandle {
    handle: JoinHandle<bool>,
}

impl HandshakeHandle {
    /// Wait for the run to end. `true` once registered, `false` if the gate
    /// was shut down first.
    pub async fn wait(self) -> bool {
        self.handle.await.unwrap_or(false)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

struct Shared {
    transport: Arc<dyn MessageTransport>,
    listeners: ListenerRegistry<dyn TransportStateListener>,
    retry: BackoffConfig,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
    complete: AtomicBool,
}

impl Shared {
    async fn attempt(&self, envelope: &Envelope, attempt: u32) -> bool {
        let send = self
            .transport
            .send(&envelope.destination, &envelope.payload, &envelope.content_type);

        match AssertUnwindSafe(send).catch_unwind().await {
            Ok(Ok(status)) if status.success => true,
            Ok(Ok(status)) => {
                warn!(
                    attempt,
                    status = ?status.status_code,
                    error = status.error.as_deref().unwrap_or("unsuccessful response"),
                    "Registration rejected, retrying"
                );
                false
            }
            Ok(Err(e)) => {
                warn!(attempt, error = %e, "Registration failed, retrying");
                false
            }
            Err(_) => {
                warn!(attempt, "Transport panicked during registration, retrying");
                false
            }
        }
    }

    async fn run(self: Arc<Self>, envelope: Envelope) -> bool {
        debug!(destination = %envelope.destination, "Registering agent");
        let registered = try_with_exponential_backoff(&self.retry, self.sleeper.as_ref(), &self.cancel, |attempt, _| {
            self.attempt(&envelope, attempt)
        })
        .await;

        if registered {
            self.complete.store(true, Ordering::SeqCst);
            info!("Agent registered");
            self.listeners.notify(TransportState::Alive);
        } else {
            debug!("Registration stopped before it succeeded");
        }
        registered
    }
}

/// Sends the one-time registration message, retrying at a fixed interval
/// until it is accepted or the gate is shut down.
///
/// Overlapping [`send`](Self::send) calls each start their own loop; callers
/// are expected to register once.
pub struct RetryingMetadataSender<M: ?Sized> {
    shared: Arc<Shared>,
    serializer: Arc<dyn MessageSerializer<M>>,
    mapper: Arc<dyn DestinationMapper>,
}

impl<M: ?Sized> RetryingMetadataSender<M> {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        serializer: Arc<dyn MessageSerializer<M>>,
        mapper: Arc<dyn DestinationMapper>,
        retry_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            shared: Arc::new(Shared {
                transport,
                listeners: ListenerRegistry::new(),
                retry: BackoffConfig::fixed(retry_interval),
                sleeper: Arc::new(TokioSleeper::new(cancel.clone())),
                cancel,
                complete: AtomicBool::new(false),
            }),
            serializer,
            mapper,
        }
    }

    /// Replace the timer between attempts. Call before the first `send`.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.sleeper = sleeper;
        }
        self
    }

    pub fn add_state_listener(&self, listener: Arc<dyn TransportStateListener>) {
        self.shared.listeners.add(listener);
    }

    /// Serialize `metadata` and start registering in the background.
    ///
    /// Only serialization errors are returned; transport failures are
    /// retried. Must be called inside a tokio runtime.
    pub fn send(&self, metadata: &M) -> TransportResult<HandshakeHandle> {
        let payload = self.serializer.serialize(metadata)?;
        let content_type = self.serializer.content_type().to_string();
        Ok(self.spawn(payload, content_type))
    }

    /// Register with an already serialized payload. An empty content type
    /// falls back to the serializer's.
    pub fn send_serialized(&self, payload: Vec<u8>, content_type: &str) -> HandshakeHandle {
        let content_type = if content_type.is_empty() {
            self.serializer.content_type()
        } else {
            content_type
        };
        self.spawn(payload, content_type.to_string())
    }

    fn spawn(&self, payload: Vec<u8>, content_type: String) -> HandshakeHandle {
        let destination = self.mapper.map(&metadata_destination());
        let envelope = Envelope::new(destination, payload, content_type);
        HandshakeHandle {
            handle: tokio::spawn(self.shared.clone().run(envelope)),
        }
    }

    /// Whether a registration has been accepted.
    pub fn is_complete(&self) -> bool {
        self.shared.complete.load(Ordering::SeqCst)
    }

    /// Interrupt any registration loop still retrying.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }
}

impl<M: ?Sized> Drop for RetryingMetadataSender<M> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
