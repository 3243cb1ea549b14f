//! Locating the broker and the partition that owns a message type.

use super::property::PropertyStore;
use super::topology::{PartitionInformation, TopologyQuery};
use crate::error::{BrokerError, Result};
use crate::types::routing_name;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Property key of the broker location record.
pub const LOCATION_PROPERTY: &str = "BrokerService";

/// Listener every broker partition serves its API on.
pub const LISTENER_NAME: &str = "SwitchboardBrokerListener";

/// Number of broker topologies kept in the cache.
const DEFAULT_TOPOLOGY_CACHE: usize = 64;

/// Routable address of one broker partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BrokerHandle {
    pub address: String,
    /// Low key of the owning Int64 range partition.
    pub partition_key: i64,
    pub listener: String,
}

impl std::fmt::Display for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] ({})", self.address, self.partition_key, self.listener)
    }
}

/// Resolves broker addresses and message-type partitions.
///
/// Topologies are fetched once per broker address and cached for the
/// lifetime of the locator. A broker that is repartitioned afterwards is
/// routed with the stale topology until a new locator is created.
pub struct PartitionLocator {
    properties: Arc<dyn PropertyStore>,
    topology: Arc<dyn TopologyQuery>,
    cache: Mutex<LruCache<String, Arc<Vec<PartitionInformation>>>>,
}

impl PartitionLocator {
    pub fn new(properties: Arc<dyn PropertyStore>, topology: Arc<dyn TopologyQuery>) -> Self {
        Self::with_cache_size(properties, topology, DEFAULT_TOPOLOGY_CACHE)
    }

    pub fn with_cache_size(
        properties: Arc<dyn PropertyStore>,
        topology: Arc<dyn TopologyQuery>,
        cache_size: usize,
    ) -> Self {
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            properties,
            topology,
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Record `broker_address` as the broker for `scope`. Last writer wins.
    pub fn register_broker_location(&self, scope: &str, broker_address: &str) -> Result<()> {
        self.properties
            .put_property(scope, LOCATION_PROPERTY, broker_address)?;
        tracing::info!(scope, broker_address, "registered broker location");
        Ok(())
    }

    /// Broker address registered for `scope`, if it can be read.
    pub fn locate_broker_address(&self, scope: &str) -> Option<String> {
        match self.properties.get_property(scope, LOCATION_PROPERTY) {
            Ok(address) => address,
            Err(e) => {
                tracing::debug!(scope, error = %e, "broker location lookup failed");
                None
            }
        }
    }

    /// Partition key of the partition that owns `message_type`.
    pub fn resolve_partition_for_message_type(&self, message_type: &str, broker_address: &str) -> Result<i64> {
        let partitions = self.partitions(broker_address)?;
        if partitions.is_empty() {
            return Err(BrokerError::NoPartitions(broker_address.to_string()));
        }

        let index = partition_index(routing_name(message_type), partitions.len());
        match &partitions[index] {
            PartitionInformation::Int64Range { low_key, .. } => Ok(*low_key),
            other => Err(BrokerError::UnsupportedPartitioning {
                partition: other.id().to_string(),
                kind: other.kind().to_string(),
            }),
        }
    }

    /// Handle of the broker partition that owns `message_type`.
    pub fn get_broker_for_message_type(&self, message_type: &str, broker_address: &str) -> Result<BrokerHandle> {
        let partition_key = self.resolve_partition_for_message_type(message_type, broker_address)?;
        Ok(BrokerHandle {
            address: broker_address.to_string(),
            partition_key,
            listener: LISTENER_NAME.to_string(),
        })
    }

    /// Number of partitions of `broker_address`.
    pub fn partition_count(&self, broker_address: &str) -> Result<usize> {
        Ok(self.partitions(broker_address)?.len())
    }

    /// Broker addresses with a cached topology, most recently used first.
    pub fn cached_topologies(&self) -> Vec<String> {
        self.cache.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    fn partitions(&self, broker_address: &str) -> Result<Arc<Vec<PartitionInformation>>> {
        if let Some(cached) = self.cache.lock().get(broker_address) {
            return Ok(Arc::clone(cached));
        }

        // Queried without the cache lock; a concurrent miss just fetches twice
        let partitions = Arc::new(self.topology.list_partitions(broker_address)?);
        tracing::debug!(
            broker_address,
            partitions = partitions.len(),
            "cached broker topology"
        );
        self.cache
            .lock()
            .put(broker_address.to_string(), Arc::clone(&partitions));
        Ok(partitions)
    }
}

/// Index of the partition owning `message_type` among `count` partitions.
///
/// Uses CRC-32 of the type name so the mapping is the same in every
/// process and release.
pub fn partition_index(message_type: &str, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    crc32fast::hash(message_type.as_bytes()) as usize % count
}
