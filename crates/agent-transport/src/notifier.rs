//! Single-flight recovery for transports that report failure out of band.
//!
//! A session-oriented transport calls [`RetryingStateNotifier::on_state_failed`]
//! when it notices the connection is gone. The notifier takes the oldest
//! queued envelope and keeps re-sending it at a fixed interval until the
//! collector accepts it, then announces the transport alive again. Signals
//! that arrive while a recovery is running are coalesced into it.

use crate::backoff::{try_with_exponential_backoff, BackoffConfig, Sleeper, TokioSleeper};
use crate::listener::{ListenerRegistry, MessageSendingListener, TransportStateListener};
use crate::queue::MessageQueue;
use crate::transport::MessageTransport;
use crate::{Envelope, TransportResult, TransportState, UnsentReason};
use futures_util::FutureExt;
use parking_lot::{Mutex, ReentrantMutex};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Shared {
    queue: Arc<dyn MessageQueue>,
    transport: Arc<dyn MessageTransport>,
    state_listeners: ListenerRegistry<dyn TransportStateListener>,
    sending_listeners: ListenerRegistry<dyn MessageSendingListener>,
    retry: BackoffConfig,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
    /// Held across a state change and its notification so listeners see
    /// `Failed` and `Alive` in the order the changes happened. Reentrant so
    /// a listener may signal again from its callback.
    transitions: ReentrantMutex<()>,
    /// Single-flight gate. Held only while checking and arming.
    retrying: Mutex<bool>,
    state: Mutex<TransportState>,
    /// Envelope the recovery task removed from the queue. Whoever takes it
    /// reports its outcome.
    probe: Mutex<Option<Arc<Envelope>>>,
}

impl Shared {
    async fn attempt(&self, envelope: &Envelope, attempt: u32) -> bool {
        let send = self
            .transport
            .send(&envelope.destination, &envelope.payload, &envelope.content_type);

        match AssertUnwindSafe(send).catch_unwind().await {
            Ok(Ok(status)) if status.success => true,
            Ok(Ok(status)) => {
                debug!(
                    attempt,
                    status = ?status.status_code,
                    "Recovery probe rejected"
                );
                false
            }
            Ok(Err(e)) => {
                debug!(attempt, error = %e, "Recovery probe failed");
                false
            }
            Err(_) => {
                warn!(attempt, "Transport panicked during recovery probe");
                false
            }
        }
    }

    async fn recover(self: Arc<Self>) {
        let envelope = match self.queue.remove() {
            Ok(envelope) => Arc::new(envelope),
            Err(_) => {
                // Drained by the sender between the signal and this task.
                debug!("Nothing left to probe with, recovery abandoned");
                *self.retrying.lock() = false;
                return;
            }
        };
        *self.probe.lock() = Some(envelope.clone());

        debug!(destination = %envelope.destination, "Recovery started");
        let recovered = try_with_exponential_backoff(&self.retry, self.sleeper.as_ref(), &self.cancel, |attempt, _| {
            self.attempt(&envelope, attempt)
        })
        .await;

        let owned = self.probe.lock().take().is_some();
        let _transition = self.transitions.lock();
        {
            let mut retrying = self.retrying.lock();
            if recovered {
                *self.state.lock() = TransportState::Alive;
            }
            *retrying = false;
        }

        if recovered {
            info!("Transport recovered");
            if owned {
                self.sending_listeners
                    .sent(&envelope.destination, &envelope.payload);
            }
            self.state_listeners.notify(TransportState::Alive);
        } else {
            debug!("Recovery stopped before the transport came back");
            if owned {
                self.sending_listeners
                    .unsent(&envelope.destination, &envelope.payload, UnsentReason::Cancelled);
            }
        }
    }
}

/// Reacts to asynchronous transport failure signals with at most one
/// recovery task at a time.
pub struct RetryingStateNotifier {
    shared: Arc<Shared>,
    shutdown_grace: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RetryingStateNotifier {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        transport: Arc<dyn MessageTransport>,
        retry_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            shared: Arc::new(Shared {
                queue,
                transport,
                state_listeners: ListenerRegistry::new(),
                sending_listeners: ListenerRegistry::new(),
                retry: BackoffConfig::fixed(retry_interval),
                sleeper: Arc::new(TokioSleeper::new(cancel.clone())),
                cancel,
                transitions: ReentrantMutex::new(()),
                retrying: Mutex::new(false),
                state: Mutex::new(TransportState::Alive),
                probe: Mutex::new(None),
            }),
            shutdown_grace: Duration::from_secs(5),
            task: Mutex::new(None),
        }
    }

    /// Replace the timer between probes. Call before the first signal.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.sleeper = sleeper;
        }
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn add_state_listener(&self, listener: Arc<dyn TransportStateListener>) {
        self.shared.state_listeners.add(listener);
    }

    /// Listeners told whether the probe envelope was finally delivered.
    pub fn add_sending_listener(&self, listener: Arc<dyn MessageSendingListener>) {
        self.shared.sending_listeners.add(listener);
    }

    /// Signal that the transport failed.
    ///
    /// Starts a recovery unless one is already running. Fails with
    /// [`TransportError::EmptyQueue`](crate::TransportError::EmptyQueue) when
    /// there is no queued envelope to probe with. Must be called inside a
    /// tokio runtime.
    pub fn on_state_failed(&self) -> TransportResult<()> {
        let _transition = self.shared.transitions.lock();
        {
            let mut retrying = self.shared.retrying.lock();
            if *retrying {
                debug!("Recovery already in progress");
                return Ok(());
            }
            if self.shared.cancel.is_cancelled() {
                debug!("Notifier shut down, ignoring failure signal");
                return Ok(());
            }
            self.shared.queue.element()?;
            *retrying = true;
            *self.shared.state.lock() = TransportState::Failed;
        }

        warn!("Transport failed, starting recovery");
        self.shared.state_listeners.notify(TransportState::Failed);

        let handle = tokio::spawn(self.shared.clone().recover());
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Whether a recovery task is running.
    pub fn is_retrying(&self) -> bool {
        *self.shared.retrying.lock()
    }

    pub fn state(&self) -> TransportState {
        *self.shared.state.lock()
    }

    /// Stop any running recovery. Its probe envelope is reported unsent.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();

        let task = self.task.lock().take();
        let Some(mut handle) = task else {
            return;
        };

        if tokio::time::timeout(self.shutdown_grace, &mut handle).await.is_err() {
            warn!("Recovery did not stop within grace period, aborting");
            handle.abort();
            let _ = handle.await;

            let abandoned = self.shared.probe.lock().take();
            if let Some(envelope) = abandoned {
                self.shared.sending_listeners.unsent(
                    &envelope.destination,
                    &envelope.payload,
                    UnsentReason::Cancelled,
                );
            }
            *self.shared.retrying.lock() = false;
        }
    }
}

impl Drop for RetryingStateNotifier {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
