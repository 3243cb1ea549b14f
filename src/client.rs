//! Publisher and subscriber helpers.
//!
//! Both find the broker for their application scope (unless given an
//! explicit address), pick the partition owning the message type and call
//! the [`BrokerApi`] of that partition through a [`BrokerConnector`].

use crate::broker::BrokerApi;
use crate::error::{BrokerError, Result};
use crate::locator::{BrokerHandle, PartitionLocator};
use crate::subscriber::{SubscriberReference, SubscriberTarget};
use crate::types::MessageEnvelope;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Opens a connection to a broker partition.
pub trait BrokerConnector: Send + Sync {
    fn connect(&self, handle: &BrokerHandle) -> Result<Arc<dyn BrokerApi>>;
}

/// Connector for brokers running in this process.
#[derive(Default)]
pub struct InProcessConnector {
    brokers: RwLock<HashMap<(String, i64), Arc<dyn BrokerApi>>>,
}

impl InProcessConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the partition `(address, partition_key)` with `broker`.
    pub fn attach(&self, address: &str, partition_key: i64, broker: Arc<dyn BrokerApi>) {
        self.brokers
            .write()
            .insert((address.to_string(), partition_key), broker);
    }

    pub fn detach(&self, address: &str, partition_key: i64) {
        self.brokers
            .write()
            .remove(&(address.to_string(), partition_key));
    }
}

impl BrokerConnector for InProcessConnector {
    fn connect(&self, handle: &BrokerHandle) -> Result<Arc<dyn BrokerApi>> {
        self.brokers
            .read()
            .get(&(handle.address.clone(), handle.partition_key))
            .cloned()
            .ok_or_else(|| BrokerError::BrokerUnavailable(handle.to_string()))
    }
}

/// Broker discovery and routing shared by both clients.
struct Router {
    locator: Arc<PartitionLocator>,
    connector: Arc<dyn BrokerConnector>,
    scope: String,
    broker_address: Option<String>,
}

impl Router {
    fn broker_address(&self) -> Result<String> {
        if let Some(address) = &self.broker_address {
            return Ok(address.clone());
        }
        self.locator
            .locate_broker_address(&self.scope)
            .ok_or_else(|| BrokerError::BrokerNotFound(self.scope.clone()))
    }

    fn broker_for(&self, message_type: &str) -> Result<Arc<dyn BrokerApi>> {
        let address = self.broker_address()?;
        let handle = self
            .locator
            .get_broker_for_message_type(message_type, &address)?;
        tracing::debug!(message_type, broker = %handle, "routing to broker partition");
        self.connector.connect(&handle)
    }
}

/// Publishes messages to the broker partition owning their type.
pub struct PublisherClient {
    router: Router,
}

impl PublisherClient {
    /// Client that discovers the broker registered for `scope`.
    pub fn new(locator: Arc<PartitionLocator>, connector: Arc<dyn BrokerConnector>, scope: impl Into<String>) -> Self {
        Self {
            router: Router {
                locator,
                connector,
                scope: scope.into(),
                broker_address: None,
            },
        }
    }

    /// Skip discovery and always use `address`.
    pub fn with_broker_address(mut self, address: impl Into<String>) -> Self {
        self.router.broker_address = Some(address.into());
        self
    }

    /// Publish `payload` as JSON.
    pub fn publish<T: Serialize>(&self, type_name: &str, payload: &T, correlation_id: Option<&str>) -> Result<()> {
        let envelope = MessageEnvelope::json(type_name, payload)?;
        let envelope = match correlation_id {
            Some(id) => envelope.with_correlation_id(id),
            None => envelope,
        };
        self.publish_envelope(envelope)
    }

    pub fn publish_envelope(&self, envelope: MessageEnvelope) -> Result<()> {
        let broker = self.router.broker_for(envelope.message_type())?;
        broker.publish_message(envelope)
    }
}

/// Subscribes actors and services through the owning broker partition.
pub struct SubscriberClient {
    router: Router,
}

impl SubscriberClient {
    pub fn new(locator: Arc<PartitionLocator>, connector: Arc<dyn BrokerConnector>, scope: impl Into<String>) -> Self {
        Self {
            router: Router {
                locator,
                connector,
                scope: scope.into(),
                broker_address: None,
            },
        }
    }

    pub fn with_broker_address(mut self, address: impl Into<String>) -> Self {
        self.router.broker_address = Some(address.into());
        self
    }

    /// Subscribe `reference` to `message_type`, with its filter if it has one.
    pub fn subscribe(&self, reference: &SubscriberReference, message_type: &str) -> Result<()> {
        let broker = self.router.broker_for(message_type)?;
        match (&reference.target, reference.correlation_id.as_deref()) {
            (SubscriberTarget::Actor(actor), None) => broker.register_subscriber(actor, message_type),
            (SubscriberTarget::Actor(actor), Some(id)) => {
                broker.register_correlated_subscriber(actor, message_type, id)
            }
            (SubscriberTarget::Service(service), None) => {
                broker.register_service_subscriber(service, message_type)
            }
            (SubscriberTarget::Service(service), Some(id)) => {
                broker.register_correlated_service_subscriber(service, message_type, id)
            }
        }
    }

    /// Unsubscribe `reference` from `message_type`.
    pub fn unsubscribe(&self, reference: &SubscriberReference, message_type: &str, flush_queue: bool) -> Result<()> {
        let broker = self.router.broker_for(message_type)?;
        match (&reference.target, reference.correlation_id.as_deref()) {
            (SubscriberTarget::Actor(actor), None) => {
                broker.unregister_subscriber(actor, message_type, flush_queue)
            }
            (SubscriberTarget::Actor(actor), Some(id)) => {
                broker.unregister_correlated_subscriber(actor, message_type, id, flush_queue)
            }
            (SubscriberTarget::Service(service), None) => {
                broker.unregister_service_subscriber(service, message_type, flush_queue)
            }
            (SubscriberTarget::Service(service), Some(id)) => broker
                .unregister_correlated_service_subscriber(service, message_type, id, flush_queue),
        }
    }
}
