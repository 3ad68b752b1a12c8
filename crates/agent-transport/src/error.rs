//! Transport error types.

use thiserror::Error;

/// Transport error type.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Inserting would push the queue past its byte capacity
    #[error("Queue is out of capacity: {required} bytes required, capacity is {capacity}")]
    QueueFull { required: u64, capacity: u64 },

    /// Non-optional dequeue or peek on an empty queue
    #[error("Queue is empty")]
    EmptyQueue,

    /// Message serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Destination type is not an HTTP method the transport knows
    #[error("Unknown destination type: {0}")]
    UnsupportedMethod(String),

    /// Send error
    #[error("Send failed: {0}")]
    Send(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using TransportError.
pub type TransportResult<T> = Result<T, TransportError>;
