//! Partition topology of broker services.

use crate::error::{BrokerError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How one partition of a service is keyed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionInformation {
    /// Contiguous range of 64-bit keys.
    Int64Range { id: String, low_key: i64, high_key: i64 },
    Named { id: String, name: String },
    Singleton { id: String },
}

impl PartitionInformation {
    pub fn id(&self) -> &str {
        match self {
            PartitionInformation::Int64Range { id, .. }
            | PartitionInformation::Named { id, .. }
            | PartitionInformation::Singleton { id } => id,
        }
    }

    /// Kind name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            PartitionInformation::Int64Range { .. } => "Int64Range",
            PartitionInformation::Named { .. } => "Named",
            PartitionInformation::Singleton { .. } => "Singleton",
        }
    }

    /// `count` ranges splitting `[low, high]` as evenly as possible.
    pub fn uniform_int64(count: usize, low: i64, high: i64) -> Vec<PartitionInformation> {
        if count == 0 || low > high {
            return Vec::new();
        }

        let span = (high as i128) - (low as i128) + 1;
        let width = span / count as i128;
        let remainder = span % count as i128;

        let mut partitions = Vec::with_capacity(count);
        let mut next = low as i128;
        for index in 0..count as i128 {
            let size = width + if index < remainder { 1 } else { 0 };
            if size == 0 {
                break;
            }
            let end = next + size - 1;
            partitions.push(PartitionInformation::Int64Range {
                id: format!("partition-{}", index),
                low_key: next as i64,
                high_key: end as i64,
            });
            next = end + 1;
        }
        partitions
    }
}

/// Lists the partitions of a service.
pub trait TopologyQuery: Send + Sync {
    fn list_partitions(&self, service_address: &str) -> Result<Vec<PartitionInformation>>;
}

/// Fixed, in-process topology.
#[derive(Default)]
pub struct StaticTopology {
    services: RwLock<HashMap<String, Vec<PartitionInformation>>>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the partitions of `service_address`.
    pub fn set_partitions(&self, service_address: &str, partitions: Vec<PartitionInformation>) {
        self.services
            .write()
            .insert(service_address.to_string(), partitions);
    }

    /// Builder form of `set_partitions`.
    pub fn with_service(self, service_address: &str, partitions: Vec<PartitionInformation>) -> Self {
        self.set_partitions(service_address, partitions);
        self
    }
}

impl TopologyQuery for StaticTopology {
    fn list_partitions(&self, service_address: &str) -> Result<Vec<PartitionInformation>> {
        self.services
            .read()
            .get(service_address)
            .cloned()
            .ok_or_else(|| BrokerError::Topology(format!("unknown service {}", service_address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_ranges_cover_span() {
        let partitions = PartitionInformation::uniform_int64(3, 0, 9);
        let ranges: Vec<(i64, i64)> = partitions
            .iter()
            .map(|p| match p {
                PartitionInformation::Int64Range { low_key, high_key, .. } => (*low_key, *high_key),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ranges, vec![(0, 3), (4, 6), (7, 9)]);
    }

    #[test]
    fn test_uniform_full_i64_range() {
        let partitions = PartitionInformation::uniform_int64(4, i64::MIN, i64::MAX);
        assert_eq!(partitions.len(), 4);
        match (&partitions[0], &partitions[3]) {
            (
                PartitionInformation::Int64Range { low_key, .. },
                PartitionInformation::Int64Range { high_key, .. },
            ) => {
                assert_eq!(*low_key, i64::MIN);
                assert_eq!(*high_key, i64::MAX);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_static_topology() {
        let topology = StaticTopology::new().with_service(
            "fabric:/shop/Broker",
            vec![PartitionInformation::Singleton { id: "s".into() }],
        );
        assert_eq!(topology.list_partitions("fabric:/shop/Broker").unwrap().len(), 1);
        assert!(matches!(
            topology.list_partitions("fabric:/nope"),
            Err(BrokerError::Topology(_))
        ));
    }
}
