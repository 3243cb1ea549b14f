//! The broker: registry, dispatcher and delivery loop behind one API.

use super::delivery::{DeliveryLoop, DeliveryLoopHandle, IterationStats};
use super::dispatcher::Dispatcher;
use super::registry::SubscriptionRegistry;
use crate::cancel::CancellationToken;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::locator::PartitionLocator;
use crate::storage::StateStore;
use crate::subscriber::{ActorTarget, ServiceTarget, SubscriberReference, SubscriberTarget};
use crate::transport::DeliveryTransport;
use crate::types::{routing_name, MessageEnvelope};
use parking_lot::Mutex;
use std::sync::Arc;

/// Operations a broker partition serves to publishers and subscribers.
pub trait BrokerApi: Send + Sync {
    /// Subscribe an actor to `message_type`.
    fn register_subscriber(&self, actor: &ActorTarget, message_type: &str) -> Result<()>;

    /// Subscribe an actor to messages of `message_type` carrying `correlation_id`.
    fn register_correlated_subscriber(
        &self,
        actor: &ActorTarget,
        message_type: &str,
        correlation_id: &str,
    ) -> Result<()>;

    /// Unsubscribe an actor, delivering what is left first if `flush_queue`.
    fn unregister_subscriber(&self, actor: &ActorTarget, message_type: &str, flush_queue: bool) -> Result<()>;

    fn unregister_correlated_subscriber(
        &self,
        actor: &ActorTarget,
        message_type: &str,
        correlation_id: &str,
        flush_queue: bool,
    ) -> Result<()>;

    /// Subscribe a service partition to `message_type`.
    fn register_service_subscriber(&self, service: &ServiceTarget, message_type: &str) -> Result<()>;

    fn register_correlated_service_subscriber(
        &self,
        service: &ServiceTarget,
        message_type: &str,
        correlation_id: &str,
    ) -> Result<()>;

    fn unregister_service_subscriber(
        &self,
        service: &ServiceTarget,
        message_type: &str,
        flush_queue: bool,
    ) -> Result<()>;

    fn unregister_correlated_service_subscriber(
        &self,
        service: &ServiceTarget,
        message_type: &str,
        correlation_id: &str,
        flush_queue: bool,
    ) -> Result<()>;

    /// Fan `envelope` out to every matching subscriber queue.
    fn publish_message(&self, envelope: MessageEnvelope) -> Result<()>;
}

/// Messages waiting in a subscriber's queue pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: u64,
    pub dead_lettered: u64,
}

/// A broker partition.
pub struct Broker {
    config: BrokerConfig,
    store: Arc<StateStore>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    delivery: Arc<DeliveryLoop>,
    locator: Option<Arc<PartitionLocator>>,

    /// Cancelled on shutdown; parent of every iteration token.
    lifetime: CancellationToken,
    running: Mutex<Option<DeliveryLoopHandle>>,
}

impl Broker {
    /// Open the broker's store as configured.
    pub fn open(config: BrokerConfig, transport: Arc<dyn DeliveryTransport>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(StateStore::open(config.store.clone())?);
        Self::with_store(config, store, transport)
    }

    /// Build a broker on an already opened store.
    pub fn with_store(
        config: BrokerConfig,
        store: Arc<StateStore>,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&store),
            config.retry.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.retry.clone(),
        );
        let delivery = Arc::new(DeliveryLoop::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            transport,
            config.delivery.clone(),
        ));

        Ok(Self {
            config,
            store,
            registry,
            dispatcher,
            delivery,
            locator: None,
            lifetime: CancellationToken::new(),
            running: Mutex::new(None),
        })
    }

    /// Locator used to advertise this broker on start.
    pub fn with_locator(mut self, locator: Arc<PartitionLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Initialize the registry, advertise the broker and start delivering.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        self.registry.wait_ready()?;

        if self.config.enable_auto_discovery {
            match &self.locator {
                Some(locator) => locator.register_broker_location(
                    &self.config.application_scope,
                    &self.config.broker_address,
                )?,
                None => tracing::debug!("auto discovery enabled but no locator configured"),
            }
        }

        *running = Some(Arc::clone(&self.delivery).spawn(self.lifetime.child())?);
        tracing::info!(
            broker_address = %self.config.broker_address,
            durable = self.store.is_durable(),
            "broker started"
        );
        Ok(())
    }

    /// Stop the delivery loop. Registration and publishing keep working.
    pub fn shutdown(&self) {
        if let Some(handle) = self.running.lock().take() {
            handle.shutdown();
            tracing::info!(broker_address = %self.config.broker_address, "broker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|h| h.is_running())
            .unwrap_or(false)
    }

    /// Run one delivery iteration on the calling thread.
    pub fn drain_once(&self) -> Result<IterationStats> {
        self.registry.wait_ready()?;
        Ok(self.delivery.run_iteration(&self.lifetime))
    }

    /// Sizes of a subscriber's queue pair (zero if not registered).
    pub fn queue_depth(&self, reference: &SubscriberReference, message_type: &str) -> Result<QueueDepth> {
        let message_type = routing_name(message_type);
        Ok(QueueDepth {
            pending: self
                .store
                .queue_len(&reference.queue_name(message_type))?
                .unwrap_or(0),
            dead_lettered: self
                .store
                .queue_len(&reference.dead_letter_queue_name(message_type))?
                .unwrap_or(0),
        })
    }

    /// Contents of a subscriber's dead-letter queue, oldest first.
    pub fn dead_letters(&self, reference: &SubscriberReference, message_type: &str) -> Result<Vec<MessageEnvelope>> {
        let queue = reference.dead_letter_queue_name(routing_name(message_type));
        self.store.with_transaction(|tx| {
            if tx.contains(&queue)? {
                tx.items(&queue)
            } else {
                Ok(Vec::new())
            }
        })
    }

    /// Move every dead letter back to the end of the main queue.
    pub fn requeue_dead_letters(&self, reference: &SubscriberReference, message_type: &str) -> Result<usize> {
        let message_type = routing_name(message_type);
        let queue = reference.queue_name(message_type);
        let dead = reference.dead_letter_queue_name(message_type);

        let moved = self.store.with_transaction(|tx| {
            if !tx.contains(&queue)? || !tx.contains(&dead)? {
                return Ok(0);
            }
            let mut moved = 0;
            while let Some(envelope) = tx.try_dequeue(&dead)? {
                tx.enqueue(&queue, envelope)?;
                moved += 1;
            }
            Ok(moved)
        })?;

        if moved > 0 {
            self.delivery.forget(&queue);
            tracing::info!(queue = %queue, moved, "requeued dead letters");
        }
        Ok(moved)
    }

    /// Snapshot the store and truncate its commit log.
    pub fn checkpoint(&self) -> Result<()> {
        self.store.checkpoint()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn register(&self, reference: SubscriberReference, message_type: &str) -> Result<()> {
        self.registry.register_subscriber(&reference, message_type)?;
        Ok(())
    }

    fn unregister(&self, reference: SubscriberReference, message_type: &str, flush_queue: bool) -> Result<()> {
        if flush_queue {
            if let Some(known) = self.registry.find_queue(&reference, message_type)? {
                match self.delivery.flush_queue(&known) {
                    Ok(delivered) => tracing::debug!(
                        queue = %known.record.queue_name,
                        delivered,
                        "flushed queue before unregistering"
                    ),
                    Err(e) => tracing::warn!(
                        queue = %known.record.queue_name,
                        error = %e,
                        "flush before unregistering failed"
                    ),
                }
            }
        }

        self.registry.unregister_subscriber(&reference, message_type)?;
        self.delivery
            .forget(&reference.queue_name(routing_name(message_type)));
        Ok(())
    }
}

fn actor_reference(actor: &ActorTarget, correlation_id: Option<&str>) -> SubscriberReference {
    let reference = SubscriberReference::new(SubscriberTarget::Actor(actor.clone()));
    match correlation_id {
        Some(id) => reference.correlated(id),
        None => reference,
    }
}

fn service_reference(service: &ServiceTarget, correlation_id: Option<&str>) -> SubscriberReference {
    let reference = SubscriberReference::new(SubscriberTarget::Service(service.clone()));
    match correlation_id {
        Some(id) => reference.correlated(id),
        None => reference,
    }
}

impl BrokerApi for Broker {
    fn register_subscriber(&self, actor: &ActorTarget, message_type: &str) -> Result<()> {
        self.register(actor_reference(actor, None), message_type)
    }

    fn register_correlated_subscriber(
        &self,
        actor: &ActorTarget,
        message_type: &str,
        correlation_id: &str,
    ) -> Result<()> {
        self.register(actor_reference(actor, Some(correlation_id)), message_type)
    }

    fn unregister_subscriber(&self, actor: &ActorTarget, message_type: &str, flush_queue: bool) -> Result<()> {
        self.unregister(actor_reference(actor, None), message_type, flush_queue)
    }

    fn unregister_correlated_subscriber(
        &self,
        actor: &ActorTarget,
        message_type: &str,
        correlation_id: &str,
        flush_queue: bool,
    ) -> Result<()> {
        self.unregister(
            actor_reference(actor, Some(correlation_id)),
            message_type,
            flush_queue,
        )
    }

    fn register_service_subscriber(&self, service: &ServiceTarget, message_type: &str) -> Result<()> {
        self.register(service_reference(service, None), message_type)
    }

    fn register_correlated_service_subscriber(
        &self,
        service: &ServiceTarget,
        message_type: &str,
        correlation_id: &str,
    ) -> Result<()> {
        self.register(service_reference(service, Some(correlation_id)), message_type)
    }

    fn unregister_service_subscriber(
        &self,
        service: &ServiceTarget,
        message_type: &str,
        flush_queue: bool,
    ) -> Result<()> {
        self.unregister(service_reference(service, None), message_type, flush_queue)
    }

    fn unregister_correlated_service_subscriber(
        &self,
        service: &ServiceTarget,
        message_type: &str,
        correlation_id: &str,
        flush_queue: bool,
    ) -> Result<()> {
        self.unregister(
            service_reference(service, Some(correlation_id)),
            message_type,
            flush_queue,
        )
    }

    fn publish_message(&self, envelope: MessageEnvelope) -> Result<()> {
        self.dispatcher.publish(&envelope)?;
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.lifetime.cancel();
        self.shutdown();
    }
}
