//! Core types for the broker.

use crate::codec::{JsonSerializer, MessagePackSerializer, PayloadSerializer};
use crate::error::{BrokerError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Payload encoding format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    #[default]
    Json,
    MessagePack,
    Raw,
}

/// Strip the qualifier from a type name (`"shop.Order, events"` → `"shop.Order"`).
pub fn routing_name(type_name: &str) -> &str {
    match type_name.find(',') {
        Some(index) if index > 0 => type_name[..index].trim_end(),
        _ => type_name,
    }
}

/// A published message.
///
/// `type_name` may be qualified (`"shop.Order, shop-events"`); only the part
/// before the first comma is used for routing, see [`MessageEnvelope::message_type`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Type name of the payload, optionally qualified.
    pub type_name: String,

    /// Serialized payload.
    pub payload: Vec<u8>,

    /// How `payload` is encoded.
    pub encoding: PayloadEncoding,

    /// Correlation identifier, or None if the message cannot be correlated.
    pub correlation_id: Option<String>,

    /// Whether this message was relayed by another broker.
    pub is_relayed: bool,
}

impl MessageEnvelope {
    /// Create an envelope with a JSON payload.
    pub fn json(type_name: impl Into<String>, payload: &impl Serialize) -> Result<Self> {
        Self::wrap(&JsonSerializer, type_name, payload)
    }

    /// Create an envelope with a MessagePack payload.
    pub fn msgpack(type_name: impl Into<String>, payload: &impl Serialize) -> Result<Self> {
        Self::wrap(&MessagePackSerializer, type_name, payload)
    }

    /// Create an envelope with raw bytes.
    pub fn raw(type_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            payload,
            encoding: PayloadEncoding::Raw,
            correlation_id: None,
            is_relayed: false,
        }
    }

    /// Create an envelope using the given serializer.
    pub fn wrap<S: PayloadSerializer>(
        serializer: &S,
        type_name: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self> {
        Ok(Self {
            type_name: type_name.into(),
            payload: serializer.serialize(payload)?,
            encoding: serializer.encoding(),
            correlation_id: None,
            is_relayed: false,
        })
    }

    /// Attach a correlation identifier.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Mark the envelope as relayed.
    pub fn relayed(mut self) -> Self {
        self.is_relayed = true;
        self
    }

    /// Routing name: the type name without its qualifier suffix.
    pub fn message_type(&self) -> &str {
        routing_name(&self.type_name)
    }

    /// Check the payload type, ignoring ASCII case.
    pub fn is_type(&self, type_name: &str) -> bool {
        self.type_name.eq_ignore_ascii_case(type_name)
            || self.message_type().eq_ignore_ascii_case(type_name)
    }

    /// Decode the payload according to its recorded encoding.
    pub fn unwrap_message<T: DeserializeOwned>(&self) -> Result<T> {
        match self.encoding {
            PayloadEncoding::Json => self.unwrap_with(&JsonSerializer),
            PayloadEncoding::MessagePack => self.unwrap_with(&MessagePackSerializer),
            PayloadEncoding::Raw => Err(BrokerError::Deserialization(
                "raw payloads carry no encoding".into(),
            )),
        }
    }

    /// Decode the payload with an explicit serializer.
    pub fn unwrap_with<S: PayloadSerializer, T: DeserializeOwned>(&self, serializer: &S) -> Result<T> {
        if self.payload.is_empty() {
            return Err(BrokerError::EmptyPayload);
        }
        serializer.deserialize(&self.payload)
    }
}
