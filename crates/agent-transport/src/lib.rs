//! Agent transport: reliable delivery of agent messages to a collector.
//!
//! Messages flow from the producer through a serializer and a destination
//! mapper into a byte-bounded queue, and from there to the collector:
//!
//! ```text
//! send() -> serialize -> map -> InMemoryMessageQueue -> workers -> MessageTransport
//!                                       |
//!                                       +-> RetryingStateNotifier (probe on failure)
//! ```
//!
//! # Guarantees
//!
//! 1. **Bounded memory**: the queue never holds more than its byte capacity
//! 2. **Non-blocking producers**: `send` enqueues or rejects immediately
//! 3. **One outcome per message**: every message gets exactly one `on_sent`
//!    or `on_unsent`, including across shutdown
//! 4. **Single-flight recovery**: at most one recovery task per notifier
//! 5. **Cancellable retry**: every retry loop stops when its component shuts
//!    down, whatever timer it was given
//! 6. **Registration first**: a sender built `paused()` and subscribed to the
//!    handshake gate delivers nothing until the collector accepts the agent

pub mod backoff;
pub mod config;
pub mod error;
pub mod http;
pub mod listener;
pub mod mapper;
pub mod metadata;
pub mod notifier;
pub mod queue;
pub mod sender;
pub mod serializer;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

pub use backoff::{try_with_exponential_backoff, BackoffConfig, Sleeper, TokioSleeper};
pub use config::TransportConfig;
pub use error::{TransportError, TransportResult};
pub use http::{HttpOptions, HttpTransport};
pub use listener::{ListenerRegistry, MessageSendingListener, TransportStateListener};
pub use mapper::{DestinationMapper, HttpDestinationMapper, IdentityDestinationMapper};
pub use metadata::{metadata_destination, HandshakeHandle, RetryingMetadataSender};
pub use notifier::RetryingStateNotifier;
pub use queue::{InMemoryMessageQueue, MessageQueue};
pub use sender::{QueuedMessageSender, SendOutcome, SenderBuilder, SenderOptions};
pub use serializer::{ByteLengthSizer, JsonMessageSerializer, MessageSerializer, PayloadSizer};
pub use transport::MessageTransport;
pub use types::{Destination, Envelope, ResponseStatus, TransportState, UnsentReason};
