//! Value types shared by the queue, the senders and the transports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical address of a message: a transport verb plus a target path.
///
/// Destinations are compared by value. A destination that went through a
/// [`DestinationMapper`](crate::DestinationMapper) keeps the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
}

impl Destination {
    pub fn new(kind: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.target)
    }
}

/// A serialized message waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Destination after mapping.
    pub destination: Destination,
    /// Serialized message bytes.
    pub payload: Vec<u8>,
    /// Content type reported by the serializer.
    pub content_type: String,
}

impl Envelope {
    pub fn new(destination: Destination, payload: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            destination,
            payload,
            content_type: content_type.into(),
        }
    }
}

/// Outcome of a single transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStatus {
    pub success: bool,
    /// Transport specific status code, e.g. the HTTP status.
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl ResponseStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            status_code: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: None,
            error: Some(error.into()),
        }
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }
}

/// Why an envelope was reported unsent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnsentReason {
    /// The sender was already shut down when the message arrived.
    NotRunning,
    /// The queue had no room left for the message.
    QueueFull,
    /// Every backoff attempt failed.
    RetriesExhausted,
    /// The transport panicked during an attempt.
    Panicked,
    /// Delivery was interrupted by shutdown.
    Cancelled,
    /// The single best-effort attempt made while draining on shutdown failed.
    DrainFailed,
}

impl UnsentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRunning => "not running",
            Self::QueueFull => "queue full",
            Self::RetriesExhausted => "retries exhausted",
            Self::Panicked => "transport panicked",
            Self::Cancelled => "cancelled",
            Self::DrainFailed => "drain attempt failed",
        }
    }
}

impl fmt::Display for UnsentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a transport is currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Alive,
    Failed,
}
