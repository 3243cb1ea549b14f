//! Registry records and the per-type subscription set.

use super::reference::SubscriberReference;
use crate::types::MessageEnvelope;
use serde::{Deserialize, Serialize};

/// A registered subscriber and its queue pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub reference: SubscriberReference,
    pub queue_name: String,
    pub dead_letter_queue_name: String,
}

impl SubscriberRecord {
    /// Build the record for `reference` subscribing to `message_type`.
    pub fn new(reference: SubscriberReference, message_type: &str) -> Self {
        Self {
            queue_name: reference.queue_name(message_type),
            dead_letter_queue_name: reference.dead_letter_queue_name(message_type),
            reference,
        }
    }

    /// Same target and same correlation filter.
    pub fn is_identical(&self, other: &SubscriberRecord) -> bool {
        self.reference == other.reference
            && self.reference.correlation_id == other.reference.correlation_id
    }
}

/// Subscribers of one message type.
///
/// Never mutated in place: every change returns a new set, so a set that
/// has been read stays valid while a transaction writes its successor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubscriptionSet {
    pub message_type: String,
    records: Vec<SubscriberRecord>,
}

impl SubscriptionSet {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriberRecord> {
        self.records.iter()
    }

    /// Record for the same target as `reference`, whatever its filter.
    pub fn find(&self, reference: &SubscriberReference) -> Option<&SubscriberRecord> {
        self.records.iter().find(|r| &r.reference == reference)
    }

    pub fn contains(&self, reference: &SubscriberReference) -> bool {
        self.find(reference).is_some()
    }

    /// Records whose filter accepts `envelope`.
    pub fn matching<'a>(
        &'a self,
        envelope: &'a MessageEnvelope,
    ) -> impl Iterator<Item = &'a SubscriberRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.reference.should_publish(envelope))
    }

    /// Add `record` unless its target is already present.
    pub fn with_added(&self, record: SubscriberRecord) -> Self {
        let mut next = self.clone();
        if !self.contains(&record.reference) {
            next.records.push(record);
        }
        next
    }

    /// Add `record`, replacing any record for the same target in place.
    pub fn with_replaced(&self, record: SubscriberRecord) -> Self {
        let mut next = self.clone();
        match next.records.iter().position(|r| r.reference == record.reference) {
            Some(index) => next.records[index] = record,
            None => next.records.push(record),
        }
        next
    }

    /// Drop the record for `reference`'s target, if any.
    pub fn with_removed(&self, reference: &SubscriberReference) -> Self {
        Self {
            message_type: self.message_type.clone(),
            records: self
                .records
                .iter()
                .filter(|r| &r.reference != reference)
                .cloned()
                .collect(),
        }
    }
}
