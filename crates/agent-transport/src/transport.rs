//! The single-attempt delivery seam.

use crate::{Destination, ResponseStatus, TransportResult};
use async_trait::async_trait;

/// Performs exactly one delivery attempt.
///
/// Both an `Err` and an unsuccessful [`ResponseStatus`] count as a failed
/// attempt for retry purposes. Implementations must not retry internally.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(
        &self,
        destination: &Destination,
        payload: &[u8],
        content_type: &str,
    ) -> TransportResult<ResponseStatus>;
}
