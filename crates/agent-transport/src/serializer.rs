//! Message serialization and size accounting.

use crate::{Destination, TransportResult};
use serde::Serialize;
use std::marker::PhantomData;

/// Declares how many bytes a queued destination and payload cost.
///
/// The queue charges `size_of_destination + size_of_payload` against its
/// capacity for every envelope it holds.
pub trait PayloadSizer: Send + Sync {
    fn size_of_destination(&self, destination: &Destination) -> u64;

    fn size_of_payload(&self, payload: &[u8]) -> u64;
}

/// Turns domain messages of type `M` into bytes.
pub trait MessageSerializer<M: ?Sized>: PayloadSizer {
    fn serialize(&self, message: &M) -> TransportResult<Vec<u8>>;

    fn content_type(&self) -> &str;

    /// Human readable rendering of a serialized payload, for trace logs.
    fn describe(&self, payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).into_owned()
    }
}

/// Charges raw string and byte lengths.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteLengthSizer;

impl PayloadSizer for ByteLengthSizer {
    fn size_of_destination(&self, destination: &Destination) -> u64 {
        (destination.kind.len() + destination.target.len()) as u64
    }

    fn size_of_payload(&self, payload: &[u8]) -> u64 {
        payload.len() as u64
    }
}

/// JSON serializer for any `serde::Serialize` message.
pub struct JsonMessageSerializer<M: ?Sized> {
    _message: PhantomData<fn(&M)>,
}

impl<M: ?Sized> JsonMessageSerializer<M> {
    pub const CONTENT_TYPE: &'static str = "application/json";

    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M: ?Sized> Default for JsonMessageSerializer<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ?Sized> PayloadSizer for JsonMessageSerializer<M> {
    fn size_of_destination(&self, destination: &Destination) -> u64 {
        ByteLengthSizer.size_of_destination(destination)
    }

    fn size_of_payload(&self, payload: &[u8]) -> u64 {
        ByteLengthSizer.size_of_payload(payload)
    }
}

impl<M: Serialize + ?Sized> MessageSerializer<M> for JsonMessageSerializer<M> {
    fn serialize(&self, message: &M) -> TransportResult<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }

    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn describe(&self, payload: &[u8]) -> String {
        match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(value) => serde_json::to_string_pretty(&value)
                .unwrap_or_else(|_| String::from_utf8_lossy(payload).into_owned()),
            Err(_) => String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct CoverageBatch {
        class_name: String,
        probes: Vec<bool>,
    }

    #[test]
    fn json_serializer_encodes_message() {
        let serializer = JsonMessageSerializer::<CoverageBatch>::new();
        let bytes = serializer
            .serialize(&CoverageBatch {
                class_name: "Foo".into(),
                probes: vec![true, false],
            })
            .unwrap();

        assert_eq!(bytes, br#"{"className":"Foo","probes":[true,false]}"#);
        assert_eq!(serializer.content_type(), "application/json");
    }

    #[test]
    fn sizes_are_string_and_byte_lengths() {
        let serializer = JsonMessageSerializer::<serde_json::Value>::new();
        assert_eq!(serializer.size_of_destination(&Destination::new("foo", "bar")), 6);
        assert_eq!(serializer.size_of_payload(b"somestring"), 10);
    }

    #[test]
    fn describe_pretty_prints_json_and_tolerates_garbage() {
        let serializer = JsonMessageSerializer::<serde_json::Value>::new();
        assert!(serializer.describe(br#"{"a":1}"#).contains("\"a\": 1"));
        assert_eq!(serializer.describe(&[0x66, 0x6f, 0x6f]), "foo");
    }
}
