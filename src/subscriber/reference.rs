//! References to delivery targets.

use crate::error::Result;
use crate::transport::DeliveryTransport;
use crate::types::MessageEnvelope;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Namespace of main subscriber queues.
const QUEUES_PREFIX: &str = "queues/";

/// Namespace of dead-letter queues.
const DEAD_LETTERS_PREFIX: &str = "dead-letters/";

/// An addressable actor-like entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorTarget {
    /// Service hosting the actor.
    pub service_uri: String,
    /// Logical id of the actor; this is its identity.
    pub actor_id: String,
}

/// A replicated service endpoint, identified by its partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub service_uri: String,
    /// Unique partition identifier; this is its identity.
    pub partition_id: String,
    /// Partition key used to reach the endpoint (None for singleton partitions).
    pub partition_key: Option<i64>,
    pub application_name: Option<String>,
}

/// Where a subscriber receives messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberTarget {
    Actor(ActorTarget),
    Service(ServiceTarget),
}

impl SubscriberTarget {
    /// Stable identity string, independent of any filter.
    pub fn identity_key(&self) -> String {
        match self {
            SubscriberTarget::Actor(actor) => format!("actor:{}", actor.actor_id),
            SubscriberTarget::Service(service) => format!("service:{}", service.partition_id),
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, SubscriberTarget::Service(_))
    }
}

impl fmt::Display for SubscriberTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriberTarget::Actor(actor) => write!(f, "{}\t{}", actor.service_uri, actor.actor_id),
            SubscriberTarget::Service(service) => match service.partition_key {
                Some(key) => write!(f, "{} [{}]", service.service_uri, key),
                None => write!(f, "{} [{}]", service.service_uri, service.partition_id),
            },
        }
    }
}

/// A delivery target plus an optional correlation filter.
///
/// Equality and hashing look at the target identity only, so registering
/// the same target with a different filter updates the existing record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriberReference {
    pub target: SubscriberTarget,
    /// Only messages carrying this correlation id are delivered, if set.
    pub correlation_id: Option<String>,
}

impl SubscriberReference {
    pub fn new(target: SubscriberTarget) -> Self {
        Self {
            target,
            correlation_id: None,
        }
    }

    /// Reference to an actor.
    pub fn actor(service_uri: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self::new(SubscriberTarget::Actor(ActorTarget {
            service_uri: service_uri.into(),
            actor_id: actor_id.into(),
        }))
    }

    /// Reference to a service partition.
    pub fn service(
        service_uri: impl Into<String>,
        partition_id: impl Into<String>,
        partition_key: Option<i64>,
    ) -> Self {
        Self::new(SubscriberTarget::Service(ServiceTarget {
            service_uri: service_uri.into(),
            partition_id: partition_id.into(),
            partition_key,
            application_name: None,
        }))
    }

    /// Set the correlation filter.
    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Human-readable name for diagnostics.
    pub fn name(&self) -> String {
        self.target.to_string()
    }

    pub fn identity_key(&self) -> String {
        self.target.identity_key()
    }

    /// Name of the main queue for `message_type`.
    ///
    /// The hash is fixed-width hex, so the type name that follows it can
    /// never make two names coincide.
    pub fn queue_name(&self, message_type: &str) -> String {
        format!("{}{}/{}", QUEUES_PREFIX, self.identity_hash(), message_type)
    }

    /// Name of the dead-letter queue for `message_type`.
    pub fn dead_letter_queue_name(&self, message_type: &str) -> String {
        format!("{}{}/{}", DEAD_LETTERS_PREFIX, self.identity_hash(), message_type)
    }

    /// Whether `envelope` passes this subscriber's correlation filter.
    pub fn should_publish(&self, envelope: &MessageEnvelope) -> bool {
        match (&self.correlation_id, &envelope.correlation_id) {
            (None, _) => true,
            (Some(filter), Some(id)) => filter.eq_ignore_ascii_case(id),
            (Some(_), None) => false,
        }
    }

    /// Deliver `envelope` to the target. An error means it was not accepted.
    pub fn publish(&self, envelope: &MessageEnvelope, transport: &dyn DeliveryTransport) -> Result<()> {
        transport.invoke(&self.target, envelope)
    }

    fn identity_hash(&self) -> String {
        let digest = Sha256::digest(self.identity_key().as_bytes());
        hex::encode(&digest[..8])
    }
}

impl PartialEq for SubscriberReference {
    fn eq(&self, other: &Self) -> bool {
        self.identity_key() == other.identity_key()
    }
}

impl Eq for SubscriberReference {}

impl Hash for SubscriberReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity_key().hash(state);
    }
}

impl fmt::Display for SubscriberReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.correlation_id {
            Some(id) => write!(f, "{} (correlation {})", self.target, id),
            None => write!(f, "{}", self.target),
        }
    }
}
