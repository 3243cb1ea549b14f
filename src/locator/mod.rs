//! Broker discovery and message-type partition routing.

#[allow(clippy::module_inception)]
mod locator;
mod property;
mod topology;

pub use locator::{partition_index, BrokerHandle, PartitionLocator, LISTENER_NAME, LOCATION_PROPERTY};
pub use property::{MemoryPropertyStore, PropertyStore};
pub use topology::{PartitionInformation, StaticTopology, TopologyQuery};
