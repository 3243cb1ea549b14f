//! Publish fan-out.

use super::registry::SubscriptionRegistry;
use crate::config::RetryPolicy;
use crate::error::{BrokerError, Result};
use crate::storage::{with_retry, StateStore};
use crate::subscriber::SubscriberRecord;
use crate::types::MessageEnvelope;
use std::sync::Arc;

/// Enqueues published envelopes onto every matching subscriber queue.
pub struct Dispatcher {
    store: Arc<StateStore>,
    registry: Arc<SubscriptionRegistry>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(store: Arc<StateStore>, registry: Arc<SubscriptionRegistry>, retry: RetryPolicy) -> Self {
        Self {
            store,
            registry,
            retry,
        }
    }

    /// Fan `envelope` out to its subscribers in a single transaction.
    ///
    /// Returns how many queues received it. Either all matching queues get
    /// the envelope or none do.
    pub fn publish(&self, envelope: &MessageEnvelope) -> Result<usize> {
        let message_type = envelope.message_type();

        let set = self
            .registry
            .subscription_set(message_type)
            .map_err(|e| BrokerError::publish(message_type, e))?;

        let targets: Vec<&SubscriberRecord> = set.matching(envelope).collect();
        if targets.is_empty() {
            tracing::debug!(message_type, "no subscribers for message");
            return Ok(0);
        }

        let delivered = with_retry(&self.retry, None, || {
            self.store.with_transaction(|tx| {
                let mut enqueued = 0;
                for record in &targets {
                    // Unregistered since the set was read
                    if !tx.contains(&record.queue_name)? {
                        continue;
                    }
                    tx.enqueue(&record.queue_name, envelope.clone())?;
                    enqueued += 1;
                }
                Ok(enqueued)
            })
        })
        .map_err(|e| BrokerError::publish(message_type, e))?;

        tracing::debug!(
            message_type,
            correlation_id = envelope.correlation_id.as_deref(),
            subscribers = delivered,
            "published message"
        );
        Ok(delivered)
    }
}
