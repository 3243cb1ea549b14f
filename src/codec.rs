//! Pluggable payload serializers.

use crate::error::{BrokerError, Result};
use crate::types::PayloadEncoding;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts payloads to bytes and back again.
pub trait PayloadSerializer {
    /// Encoding tag recorded on envelopes produced by this serializer.
    fn encoding(&self) -> PayloadEncoding;

    fn serialize<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Vec<u8>>;

    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

/// JSON payloads (the default).
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn encoding(&self) -> PayloadEncoding {
        PayloadEncoding::Json
    }

    fn serialize<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| BrokerError::Deserialization(e.to_string()))
    }
}

/// MessagePack payloads, with named struct fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessagePackSerializer;

impl PayloadSerializer for MessagePackSerializer {
    fn encoding(&self) -> PayloadEncoding {
        PayloadEncoding::MessagePack
    }

    fn serialize<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(payload)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(data)?)
    }
}
