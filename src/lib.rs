//! # Switchboard
//!
//! A partitioned publish/subscribe broker. Publishers send envelopes tagged
//! with a message type; every subscriber of that type gets its own durable
//! queue, drained in the background with at-least-once delivery.
//!
//! ## Core Concepts
//!
//! - **Subscribers**: actors or service partitions, optionally filtered by
//!   correlation id
//! - **Registry**: durable per-type subscription sets plus an in-memory
//!   queue mirror
//! - **Fan-out**: one published envelope lands on every matching queue, or
//!   on none
//! - **Delivery loop**: time-boxed background draining, dead-lettering
//!   messages a subscriber keeps rejecting
//! - **Locator**: maps message types to broker partitions
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard::{Broker, BrokerApi, BrokerConfig, ChannelTransport, MessageEnvelope, SubscriberReference};
//!
//! let transport = Arc::new(ChannelTransport::new());
//! let subscriber = SubscriberReference::actor("fabric:/shop/Actors", "billing");
//! let endpoint = transport.connect(&subscriber.target);
//!
//! let broker = Broker::open(BrokerConfig::default(), transport)?;
//! broker.start()?;
//!
//! broker.registry().register_subscriber(&subscriber, "Order")?;
//! broker.publish_message(MessageEnvelope::json("Order", &order)?)?;
//!
//! let delivered = endpoint.recv()?;
//! ```

pub mod broker;
pub mod cancel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod locator;
pub mod storage;
pub mod subscriber;
pub mod transport;
pub mod types;

// Re-exports
pub use broker::{
    Broker, BrokerApi, DeliveryLoop, DeliveryLoopHandle, Dispatcher, IterationStats, KnownQueue,
    QueueDepth, SubscriptionRegistry,
};
pub use cancel::CancellationToken;
pub use client::{BrokerConnector, InProcessConnector, PublisherClient, SubscriberClient};
pub use codec::{JsonSerializer, MessagePackSerializer, PayloadSerializer};
pub use config::{BrokerConfig, DeliveryConfig, RetryPolicy, StoreConfig};
pub use error::{BrokerError, Result};
pub use locator::{
    partition_index, BrokerHandle, MemoryPropertyStore, PartitionInformation, PartitionLocator,
    PropertyStore, StaticTopology, TopologyQuery, LISTENER_NAME, LOCATION_PROPERTY,
};
pub use storage::{StateStore, Transaction};
pub use subscriber::{
    ActorTarget, ServiceTarget, SubscriberRecord, SubscriberReference, SubscriberTarget,
    SubscriptionSet,
};
pub use transport::{ChannelTransport, DeliveryTransport, Endpoint, FnTransport};
pub use types::*;
