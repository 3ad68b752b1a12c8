//! Queue-draining sender.
//!
//! Producers call [`QueuedMessageSender::send`], which never blocks: the
//! message is either enqueued or reported unsent right away. A fixed pool of
//! tokio workers drains the queue and delivers each envelope with
//! exponential backoff. Every message handed to `send` produces exactly one
//! `on_sent` or `on_unsent` notification, including across shutdown.
//!
//! Delivery can be paused while the collector is known to be unreachable.
//! [`QueuedMessageSender::state_listener`] hands out a
//! [`TransportStateListener`] that pauses on `Failed` and resumes on
//! `Alive`, so the sender can follow a handshake gate or a retry notifier.
//! Producers keep enqueueing while paused.

use crate::backoff::{try_with_exponential_backoff, BackoffConfig, Sleeper, TokioSleeper};
use crate::config::TransportConfig;
use crate::listener::{ListenerRegistry, MessageSendingListener, TransportStateListener};
use crate::mapper::{DestinationMapper, IdentityDestinationMapper};
use crate::queue::MessageQueue;
use crate::serializer::MessageSerializer;
use crate::transport::MessageTransport;
use crate::{Destination, Envelope, TransportResult, UnsentReason};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Floor for the idle wait so an idle worker never spins.
const MIN_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Sender tuning.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Number of delivery workers.
    pub worker_count: usize,
    /// Idle wait on the queue; bounds how quickly workers notice shutdown.
    pub poll_timeout: Duration,
    /// How long shutdown waits for workers before aborting them.
    pub shutdown_grace: Duration,
    /// Retry policy per envelope.
    pub backoff: BackoffConfig,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            worker_count: 1,
            poll_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

impl From<&TransportConfig> for SenderOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            poll_timeout: config.poll_timeout(),
            shutdown_grace: config.shutdown_grace(),
            backoff: config.backoff.clone(),
        }
    }
}

/// Immediate result of [`QueuedMessageSender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Enqueued; the outcome arrives later through the listeners.
    Queued,
    /// Not enqueued; listeners were already told `on_unsent` with this reason.
    Rejected(UnsentReason),
}

impl SendOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// Final result of one worker delivery.
enum Delivery {
    Sent,
    Exhausted,
    Panicked,
    Cancelled,
}

/// Envelope a worker is currently delivering. Whoever takes it out of the
/// slot owns the notification for it.
type InFlight = Arc<Mutex<Option<Arc<Envelope>>>>;

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
    in_flight: InFlight,
}

/// State shared between the sender handle and its workers.
struct Shared {
    queue: Arc<dyn MessageQueue>,
    transport: Arc<dyn MessageTransport>,
    listeners: ListenerRegistry<dyn MessageSendingListener>,
    backoff: BackoffConfig,
    sleeper: Arc<dyn Sleeper>,
    poll_timeout: Duration,
    cancel: CancellationToken,
    /// Writers flip this once on shutdown; `send` holds a read guard across
    /// the enqueue so nothing lands in the queue after the final drain.
    accepting: RwLock<bool>,
    /// `false` while paused. Workers finish their current envelope but take
    /// no new one until it flips back.
    resumed: watch::Sender<bool>,
}

impl Shared {
    /// One transport call; errors and unsuccessful responses are failures.
    async fn attempt(&self, envelope: &Envelope, attempt: u32, delay: Duration) -> bool {
        let result = self
            .transport
            .send(&envelope.destination, &envelope.payload, &envelope.content_type)
            .await;

        match result {
            Ok(status) if status.success => true,
            Ok(status) => {
                warn!(
                    destination = %envelope.destination,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    status = ?status.status_code,
                    error = status.error.as_deref().unwrap_or("unsuccessful response"),
                    "Delivery attempt failed"
                );
                false
            }
            Err(e) => {
                warn!(
                    destination = %envelope.destination,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Delivery attempt failed"
                );
                false
            }
        }
    }

    async fn deliver(&self, envelope: &Envelope) -> Delivery {
        let run = try_with_exponential_backoff(
            &self.backoff,
            self.sleeper.as_ref(),
            &self.cancel,
            |attempt, delay| self.attempt(envelope, attempt, delay),
        );

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(true) => Delivery::Sent,
            Ok(false) if self.cancel.is_cancelled() => Delivery::Cancelled,
            Ok(false) => Delivery::Exhausted,
            Err(_) => Delivery::Panicked,
        }
    }

    fn report(&self, envelope: &Envelope, delivery: Delivery) {
        let reason = match delivery {
            Delivery::Sent => {
                debug!(destination = %envelope.destination, "Message sent");
                self.listeners.sent(&envelope.destination, &envelope.payload);
                return;
            }
            Delivery::Exhausted => UnsentReason::RetriesExhausted,
            Delivery::Panicked => UnsentReason::Panicked,
            Delivery::Cancelled => UnsentReason::Cancelled,
        };
        self.report_unsent(envelope, reason);
    }

    fn report_unsent(&self, envelope: &Envelope, reason: UnsentReason) {
        warn!(destination = %envelope.destination, reason = %reason, "Message unsent");
        self.listeners
            .unsent(&envelope.destination, &envelope.payload, reason);
    }

    fn set_resumed(&self, resumed: bool) {
        let was = self.resumed.send_replace(resumed);
        if was != resumed {
            if resumed {
                info!(queued = self.queue.size(), "Delivery resumed");
            } else {
                info!(queued = self.queue.size(), "Delivery paused");
            }
        }
    }

    /// Wait while paused. Returns `false` if cancelled first.
    async fn wait_until_resumed(&self, resumed: &mut watch::Receiver<bool>) -> bool {
        loop {
            let running = *resumed.borrow_and_update();
            if running {
                return true;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                changed = resumed.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn run_worker(self: Arc<Self>, id: usize, in_flight: InFlight) {
        debug!(worker = id, "Delivery worker started");
        let mut resumed = self.resumed.subscribe();
        loop {
            if !self.wait_until_resumed(&mut resumed).await {
                break;
            }
            // A pause while idle takes effect before the next envelope.
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = resumed.changed() => continue,
                polled = self.queue.poll_timeout(self.poll_timeout) => polled,
            };
            let Some(envelope) = polled else {
                continue;
            };

            let envelope = Arc::new(envelope);
            *in_flight.lock() = Some(envelope.clone());

            let delivery = self.deliver(&envelope).await;
            if in_flight.lock().take().is_some() {
                self.report(&envelope, delivery);
            }
        }
        debug!(worker = id, "Delivery worker stopped");
    }
}

/// Builds and starts a [`QueuedMessageSender`].
pub struct SenderBuilder<M: ?Sized> {
    queue: Arc<dyn MessageQueue>,
    transport: Arc<dyn MessageTransport>,
    serializer: Arc<dyn MessageSerializer<M>>,
    mapper: Arc<dyn DestinationMapper>,
    options: SenderOptions,
    sleeper: Option<Arc<dyn Sleeper>>,
    listeners: Vec<Arc<dyn MessageSendingListener>>,
    paused: bool,
}

impl<M: ?Sized> SenderBuilder<M> {
    pub fn mapper(mut self, mapper: Arc<dyn DestinationMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn options(mut self, options: SenderOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the timer used between retries. Defaults to a [`TokioSleeper`]
    /// interrupted by shutdown.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn MessageSendingListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Start with delivery paused until [`QueuedMessageSender::resume`] or an
    /// `Alive` transition.
    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(self) -> QueuedMessageSender<M> {
        let cancel = CancellationToken::new();
        let sleeper = self
            .sleeper
            .unwrap_or_else(|| Arc::new(TokioSleeper::new(cancel.clone())));

        let listeners = ListenerRegistry::new();
        for listener in self.listeners {
            listeners.add(listener);
        }

        let shared = Arc::new(Shared {
            queue: self.queue,
            transport: self.transport,
            listeners,
            backoff: self.options.backoff,
            sleeper,
            poll_timeout: self.options.poll_timeout.max(MIN_POLL_TIMEOUT),
            cancel,
            accepting: RwLock::new(true),
            resumed: watch::channel(!self.paused).0,
        });

        let worker_count = self.options.worker_count.max(1);
        let workers = (0..worker_count)
            .map(|id| {
                let in_flight: InFlight = Arc::new(Mutex::new(None));
                let handle = tokio::spawn(shared.clone().run_worker(id, in_flight.clone()));
                Worker {
                    id,
                    handle,
                    in_flight,
                }
            })
            .collect();

        info!(workers = worker_count, paused = self.paused, "Sender started");

        QueuedMessageSender {
            shared,
            serializer: self.serializer,
            mapper: self.mapper,
            shutdown_grace: self.options.shutdown_grace,
            workers: Mutex::new(workers),
        }
    }
}

/// Fire-and-forget sender backed by a bounded queue and a worker pool.
pub struct QueuedMessageSender<M: ?Sized> {
    shared: Arc<Shared>,
    serializer: Arc<dyn MessageSerializer<M>>,
    mapper: Arc<dyn DestinationMapper>,
    shutdown_grace: Duration,
    workers: Mutex<Vec<Worker>>,
}

impl<M: ?Sized> QueuedMessageSender<M> {
    pub fn builder(
        queue: Arc<dyn MessageQueue>,
        transport: Arc<dyn MessageTransport>,
        serializer: Arc<dyn MessageSerializer<M>>,
    ) -> SenderBuilder<M> {
        SenderBuilder {
            queue,
            transport,
            serializer,
            mapper: Arc::new(IdentityDestinationMapper),
            options: SenderOptions::default(),
            sleeper: None,
            listeners: Vec::new(),
            paused: false,
        }
    }

    /// Map, serialize and enqueue `message`.
    ///
    /// Returns `Err` only when serialization fails. A rejected message has
    /// already been reported through `on_unsent` when this returns.
    pub fn send(&self, destination: &Destination, message: &M) -> TransportResult<SendOutcome> {
        let mapped = self.mapper.map(destination);
        let payload = self.serializer.serialize(message)?;
        trace!(
            destination = %mapped,
            payload = %self.serializer.describe(&payload),
            "Serialized message"
        );
        let envelope = Envelope::new(mapped, payload, self.serializer.content_type());

        let accepting = self.shared.accepting.read();
        if !*accepting {
            drop(accepting);
            self.shared.report_unsent(&envelope, UnsentReason::NotRunning);
            return Ok(SendOutcome::Rejected(UnsentReason::NotRunning));
        }

        match self.shared.queue.offer(envelope) {
            Ok(()) => Ok(SendOutcome::Queued),
            Err(envelope) => {
                drop(accepting);
                self.shared.report_unsent(&envelope, UnsentReason::QueueFull);
                Ok(SendOutcome::Rejected(UnsentReason::QueueFull))
            }
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageSendingListener>) {
        self.shared.listeners.add(listener);
    }

    /// Whether `send` still accepts messages.
    pub fn is_running(&self) -> bool {
        *self.shared.accepting.read()
    }

    /// Stop taking envelopes off the queue. Deliveries already underway
    /// finish; `send` keeps enqueueing.
    pub fn pause(&self) {
        self.shared.set_resumed(false);
    }

    pub fn resume(&self) {
        self.shared.set_resumed(true);
    }

    pub fn is_paused(&self) -> bool {
        !*self.shared.resumed.borrow()
    }

    /// Listener that pauses this sender on `Failed` and resumes it on
    /// `Alive`. It does not keep the sender alive.
    pub fn state_listener(&self) -> Arc<dyn TransportStateListener> {
        Arc::new(SenderStateListener {
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Envelopes waiting in the queue, excluding ones being delivered.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.size()
    }

    /// Stop accepting, stop the workers and drain what is left.
    ///
    /// Workers get the configured grace period to finish their current
    /// delivery before they are aborted. Remaining envelopes get one attempt
    /// each within a second grace period. Calling this again is a no-op.
    pub async fn shutdown(&self) {
        {
            let mut accepting = self.shared.accepting.write();
            if !*accepting {
                return;
            }
            *accepting = false;
        }

        info!(queued = self.shared.queue.size(), "Shutting down sender");
        self.shared.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        for mut worker in workers {
            match tokio::time::timeout_at(deadline, &mut worker.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(worker = worker.id, error = %e, "Delivery worker failed"),
                Err(_) => {
                    warn!(worker = worker.id, "Worker did not stop within grace period, aborting");
                    worker.handle.abort();
                    let _ = worker.handle.await;
                    let abandoned = worker.in_flight.lock().take();
                    if let Some(envelope) = abandoned {
                        self.shared.report_unsent(&envelope, UnsentReason::Cancelled);
                    }
                }
            }
        }

        // Leftovers share one more grace period; past it each attempt is
        // abandoned as soon as it would block.
        let drain_deadline = tokio::time::Instant::now() + self.shutdown_grace;
        let mut drained = 0usize;
        let mut failed = 0usize;
        while let Some(envelope) = self.shared.queue.poll() {
            drained += 1;
            let attempt = AssertUnwindSafe(self.shared.attempt(&envelope, 0, Duration::ZERO)).catch_unwind();
            match tokio::time::timeout_at(drain_deadline, attempt).await {
                Ok(Ok(true)) => self.shared.report(&envelope, Delivery::Sent),
                _ => {
                    failed += 1;
                    self.shared.report_unsent(&envelope, UnsentReason::DrainFailed);
                }
            }
        }

        info!(drained, failed, "Sender shut down");
    }
}

struct SenderStateListener {
    shared: Weak<Shared>,
}

impl TransportStateListener for SenderStateListener {
    fn on_state_alive(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_resumed(true);
        }
    }

    fn on_state_failed(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_resumed(false);
        }
    }
}

impl<M: ?Sized> Drop for QueuedMessageSender<M> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
