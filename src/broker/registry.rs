//! Durable subscription registry with an in-memory queue mirror.

use crate::config::RetryPolicy;
use crate::error::{BrokerError, Result};
use crate::storage::{with_retry, StateStore};
use crate::subscriber::{SubscriberRecord, SubscriberReference, SubscriptionSet};
use crate::types::routing_name;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Prefix of the per-type subscription dictionaries.
pub const SUBSCRIPTIONS_PREFIX: &str = "subscriptions/";

/// Key of the subscription set inside its dictionary.
pub const SUBSCRIPTIONS_KEY: &str = "Queues";

/// A queue the delivery loop knows about.
#[derive(Clone, Debug)]
pub struct KnownQueue {
    pub message_type: String,
    pub record: SubscriberRecord,
}

/// Subscription registry.
///
/// The durable subscription sets are the source of truth. The mirror maps
/// queue names to their subscriber and is rebuilt from the store once per
/// process, before any operation is served.
pub struct SubscriptionRegistry {
    store: Arc<StateStore>,
    retry: RetryPolicy,

    /// Serializes initialization and every registry mutation.
    gate: Mutex<()>,
    ready: AtomicBool,

    mirror: RwLock<HashMap<String, KnownQueue>>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<StateStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            gate: Mutex::new(()),
            ready: AtomicBool::new(false),
            mirror: RwLock::new(HashMap::new()),
        }
    }

    /// Block until the mirror has been rebuilt, rebuilding it if nobody has.
    pub fn wait_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let _gate = self.gate.lock();
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let mirror = self.load_mirror()?;
        let queues = mirror.len();
        *self.mirror.write() = mirror;
        self.ready.store(true, Ordering::Release);

        tracing::info!(queues, "subscription registry initialized");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn load_mirror(&self) -> Result<HashMap<String, KnownQueue>> {
        let mut mirror = HashMap::new();

        for dictionary in self.store.collection_names(SUBSCRIPTIONS_PREFIX) {
            let set = self
                .store
                .with_transaction(|tx| tx.get_value::<SubscriptionSet>(&dictionary, SUBSCRIPTIONS_KEY))?;

            if let Some(set) = set {
                for record in set.iter() {
                    mirror.insert(
                        record.queue_name.clone(),
                        KnownQueue {
                            message_type: set.message_type.clone(),
                            record: record.clone(),
                        },
                    );
                }
            }
        }

        Ok(mirror)
    }

    /// Register `reference` for `message_type`.
    ///
    /// Registering the same target twice is a no-op; registering it with a
    /// different correlation filter replaces the filter. Returns whether the
    /// stored set changed.
    pub fn register_subscriber(&self, reference: &SubscriberReference, message_type: &str) -> Result<bool> {
        let message_type = routing_name(message_type);
        self.wait_ready()
            .map_err(|e| BrokerError::registration(message_type, e))?;

        let record = SubscriberRecord::new(reference.clone(), message_type);
        let dictionary = set_dictionary(message_type);

        let _gate = self.gate.lock();
        let changed = with_retry(&self.retry, None, || {
            self.store.with_transaction(|tx| {
                tx.get_or_create_dictionary(&dictionary)?;
                let set = tx
                    .get_value::<SubscriptionSet>(&dictionary, SUBSCRIPTIONS_KEY)?
                    .unwrap_or_else(|| SubscriptionSet::new(message_type));

                let next = match set.find(&record.reference) {
                    Some(existing) if existing.is_identical(&record) => None,
                    Some(_) => Some(set.with_replaced(record.clone())),
                    None => Some(set.with_added(record.clone())),
                };

                tx.get_or_create_queue(&record.queue_name)?;
                tx.get_or_create_queue(&record.dead_letter_queue_name)?;

                match next {
                    Some(next) => {
                        tx.set_value(&dictionary, SUBSCRIPTIONS_KEY, &next)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
        })
        .map_err(|e| BrokerError::registration(message_type, e))?;

        self.mirror.write().insert(
            record.queue_name.clone(),
            KnownQueue {
                message_type: message_type.to_string(),
                record,
            },
        );

        if changed {
            tracing::info!(
                message_type,
                subscriber = %reference,
                "registered subscriber"
            );
        }
        Ok(changed)
    }

    /// Register with a correlation filter.
    pub fn register_correlated_subscriber(
        &self,
        reference: &SubscriberReference,
        message_type: &str,
        correlation_id: &str,
    ) -> Result<bool> {
        self.register_subscriber(&reference.clone().correlated(correlation_id), message_type)
    }

    /// Remove `reference` and its queue pair. Returns false if it was not registered.
    pub fn unregister_subscriber(&self, reference: &SubscriberReference, message_type: &str) -> Result<bool> {
        let message_type = routing_name(message_type);
        self.wait_ready()
            .map_err(|e| BrokerError::registration(message_type, e))?;

        let queue_name = reference.queue_name(message_type);
        let dead_letter_queue_name = reference.dead_letter_queue_name(message_type);
        let dictionary = set_dictionary(message_type);

        let _gate = self.gate.lock();
        let removed = with_retry(&self.retry, None, || {
            self.store.with_transaction(|tx| {
                let set = match tx.get_value::<SubscriptionSet>(&dictionary, SUBSCRIPTIONS_KEY)? {
                    Some(set) if set.contains(reference) => set,
                    _ => return Ok(false),
                };

                tx.set_value(&dictionary, SUBSCRIPTIONS_KEY, &set.with_removed(reference))?;
                tx.remove_collection(&queue_name)?;
                tx.remove_collection(&dead_letter_queue_name)?;
                Ok(true)
            })
        })
        .map_err(|e| BrokerError::registration(message_type, e))?;

        self.mirror.write().remove(&queue_name);

        if removed {
            tracing::info!(message_type, subscriber = %reference, "unregistered subscriber");
        }
        Ok(removed)
    }

    /// Current subscription set of `message_type` (empty if none).
    pub fn subscription_set(&self, message_type: &str) -> Result<SubscriptionSet> {
        let message_type = routing_name(message_type);
        self.wait_ready()?;

        let dictionary = set_dictionary(message_type);
        let set = with_retry(&self.retry, None, || {
            self.store
                .with_transaction(|tx| tx.get_value::<SubscriptionSet>(&dictionary, SUBSCRIPTIONS_KEY))
        })?;
        Ok(set.unwrap_or_else(|| SubscriptionSet::new(message_type)))
    }

    /// Message types with a stored subscription set.
    pub fn message_types(&self) -> Vec<String> {
        self.store
            .collection_names(SUBSCRIPTIONS_PREFIX)
            .into_iter()
            .map(|name| name[SUBSCRIPTIONS_PREFIX.len()..].to_string())
            .collect()
    }

    /// Snapshot of the mirror, ordered by queue name.
    pub fn known_queues(&self) -> Result<Vec<KnownQueue>> {
        self.wait_ready()?;
        let mut queues: Vec<KnownQueue> = self.mirror.read().values().cloned().collect();
        queues.sort_by(|a, b| a.record.queue_name.cmp(&b.record.queue_name));
        Ok(queues)
    }

    /// Mirror entry for `reference` subscribing to `message_type`.
    pub fn find_queue(&self, reference: &SubscriberReference, message_type: &str) -> Result<Option<KnownQueue>> {
        self.wait_ready()?;
        let queue_name = reference.queue_name(routing_name(message_type));
        Ok(self.mirror.read().get(&queue_name).cloned())
    }

    pub fn mirror_len(&self) -> usize {
        self.mirror.read().len()
    }
}

fn set_dictionary(message_type: &str) -> String {
    format!("{}{}", SUBSCRIPTIONS_PREFIX, message_type)
}
