//! Broker partition: subscription registry, publish fan-out and delivery.
//!
//! - [`SubscriptionRegistry`] keeps the durable subscription sets and the
//!   in-memory queue mirror.
//! - [`Dispatcher`] enqueues a published envelope onto every matching queue
//!   in one transaction.
//! - [`DeliveryLoop`] drains the queues in the background.
//! - [`Broker`] ties them together and implements [`BrokerApi`].

mod delivery;
mod dispatcher;
mod registry;
mod service;

pub use delivery::{DeliveryLoop, DeliveryLoopHandle, IterationStats};
pub use dispatcher::Dispatcher;
pub use registry::{KnownQueue, SubscriptionRegistry, SUBSCRIPTIONS_KEY, SUBSCRIPTIONS_PREFIX};
pub use service::{Broker, BrokerApi, QueueDepth};
