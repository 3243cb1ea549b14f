//! Partition routing and subscriber filtering.

use std::sync::Arc;

use proptest::prelude::*;
use switchboard::{
    partition_index, MemoryPropertyStore, MessageEnvelope, PartitionInformation, PartitionLocator,
    StaticTopology, SubscriberReference,
};

const BROKER: &str = "fabric:/shop/Broker";

fn locator(count: usize) -> PartitionLocator {
    let topology = StaticTopology::new().with_service(
        BROKER,
        PartitionInformation::uniform_int64(count, i64::MIN, i64::MAX),
    );
    PartitionLocator::new(Arc::new(MemoryPropertyStore::new()), Arc::new(topology))
}

#[test]
fn test_partition_spread() {
    let partitions = 4;
    let mut counts = vec![0usize; partitions];
    for n in 0..4000 {
        counts[partition_index(&format!("Message{}", n), partitions)] += 1;
    }

    // Each partition owns roughly a quarter of the types
    for count in counts {
        assert!((500..1500).contains(&count), "uneven spread: {}", count);
    }
}

#[test]
fn test_every_partition_is_reachable() {
    let locator = locator(3);
    let keys: std::collections::HashSet<i64> = (0..300)
        .map(|n| {
            locator
                .resolve_partition_for_message_type(&format!("Event{}", n), BROKER)
                .unwrap()
        })
        .collect();
    assert_eq!(keys.len(), 3);
}

#[test]
fn test_two_locators_agree() {
    let first = locator(7);
    let second = locator(7);
    for name in ["Order", "Invoice", "Shipment", "Refund"] {
        assert_eq!(
            first.get_broker_for_message_type(name, BROKER).unwrap(),
            second.get_broker_for_message_type(name, BROKER).unwrap()
        );
    }
}

proptest! {
    #[test]
    fn test_partition_index_in_range(name in "[A-Za-z.]{1,40}", count in 1usize..64) {
        let index = partition_index(&name, count);
        prop_assert!(index < count);
        prop_assert_eq!(index, partition_index(&name, count));
    }

    #[test]
    fn test_resolved_key_is_a_low_key(name in "[A-Za-z]{1,20}", count in 1usize..16) {
        let partitions = PartitionInformation::uniform_int64(count, i64::MIN, i64::MAX);
        let locator = locator(count);
        let key = locator.resolve_partition_for_message_type(&name, BROKER).unwrap();
        let expected = &partitions[partition_index(&name, count)];
        match expected {
            PartitionInformation::Int64Range { low_key, .. } => prop_assert_eq!(key, *low_key),
            other => prop_assert!(false, "unexpected partition {:?}", other),
        }
    }

    #[test]
    fn test_filter_matches_ignoring_case(id in "[a-zA-Z0-9]{1,12}") {
        let subscriber = SubscriberReference::actor("fabric:/shop/Actors", "a").correlated(id.clone());
        let upper = MessageEnvelope::raw("Order", vec![1]).with_correlation_id(id.to_uppercase());
        let lower = MessageEnvelope::raw("Order", vec![1]).with_correlation_id(id.to_lowercase());
        prop_assert!(subscriber.should_publish(&upper));
        prop_assert!(subscriber.should_publish(&lower));
        prop_assert!(!subscriber.should_publish(&MessageEnvelope::raw("Order", vec![1])));
    }

    #[test]
    fn test_unfiltered_accepts_everything(id in proptest::option::of("[a-z0-9]{1,12}")) {
        let subscriber = SubscriberReference::actor("fabric:/shop/Actors", "a");
        let envelope = match id {
            Some(id) => MessageEnvelope::raw("Order", vec![1]).with_correlation_id(id),
            None => MessageEnvelope::raw("Order", vec![1]),
        };
        prop_assert!(subscriber.should_publish(&envelope));
    }
}
