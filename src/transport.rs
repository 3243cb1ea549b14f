//! Delivery transports.
//!
//! The broker hands each dequeued envelope to a [`DeliveryTransport`]; an
//! `Ok` means the subscriber accepted it and the dequeue may commit.

use crate::error::{BrokerError, Result};
use crate::subscriber::SubscriberTarget;
use crate::types::MessageEnvelope;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Invokes a subscriber's receive handler.
pub trait DeliveryTransport: Send + Sync {
    /// Deliver `envelope` to `target`. Any error counts as a rejection.
    fn invoke(&self, target: &SubscriberTarget, envelope: &MessageEnvelope) -> Result<()>;
}

/// Default endpoint buffer size.
const DEFAULT_BUFFER_SIZE: usize = 1000;

/// In-process transport with a bounded channel per target.
///
/// Deliveries to a target without an endpoint, or whose buffer is full,
/// are rejected and stay queued in the broker.
pub struct ChannelTransport {
    endpoints: RwLock<HashMap<String, Sender<MessageEnvelope>>>,
    buffer_size: usize,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            buffer_size,
        }
    }

    /// Open an endpoint for `target`, replacing any previous one.
    pub fn connect(&self, target: &SubscriberTarget) -> Endpoint {
        let (sender, receiver) = bounded(self.buffer_size);
        self.endpoints.write().insert(target.identity_key(), sender);
        Endpoint { receiver }
    }

    /// Close the endpoint for `target`.
    pub fn disconnect(&self, target: &SubscriberTarget) {
        self.endpoints.write().remove(&target.identity_key());
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTransport for ChannelTransport {
    fn invoke(&self, target: &SubscriberTarget, envelope: &MessageEnvelope) -> Result<()> {
        let key = target.identity_key();
        let sender = self.endpoints.read().get(&key).cloned();
        let sender = sender.ok_or_else(|| BrokerError::DeliveryRejected {
            subscriber: target.to_string(),
            reason: "no endpoint connected".into(),
        })?;

        match sender.try_send(envelope.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BrokerError::DeliveryRejected {
                subscriber: target.to_string(),
                reason: "endpoint buffer full".into(),
            }),
            Err(TrySendError::Disconnected(_)) => {
                self.endpoints.write().remove(&key);
                Err(BrokerError::DeliveryRejected {
                    subscriber: target.to_string(),
                    reason: "endpoint disconnected".into(),
                })
            }
        }
    }
}

/// Receiving side of a [`ChannelTransport`] endpoint.
pub struct Endpoint {
    pub receiver: Receiver<MessageEnvelope>,
}

impl Endpoint {
    /// Receive the next envelope (blocking).
    pub fn recv(&self) -> std::result::Result<MessageEnvelope, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an envelope (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<MessageEnvelope, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<MessageEnvelope, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything received so far.
    pub fn drain(&self) -> Vec<MessageEnvelope> {
        self.receiver.try_iter().collect()
    }
}

/// Transport backed by a closure.
pub struct FnTransport<F> {
    handler: F,
}

impl<F> FnTransport<F>
where
    F: Fn(&SubscriberTarget, &MessageEnvelope) -> Result<()> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> DeliveryTransport for FnTransport<F>
where
    F: Fn(&SubscriberTarget, &MessageEnvelope) -> Result<()> + Send + Sync,
{
    fn invoke(&self, target: &SubscriberTarget, envelope: &MessageEnvelope) -> Result<()> {
        (self.handler)(target, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::SubscriberReference;

    fn target(id: &str) -> SubscriberTarget {
        SubscriberReference::actor("fabric:/shop/Actors", id).target
    }

    #[test]
    fn test_channel_delivery() {
        let transport = ChannelTransport::new();
        let endpoint = transport.connect(&target("a"));

        let envelope = MessageEnvelope::raw("Order", vec![1]);
        transport.invoke(&target("a"), &envelope).unwrap();
        assert_eq!(endpoint.try_recv().unwrap(), envelope);
    }

    #[test]
    fn test_missing_endpoint_rejects() {
        let transport = ChannelTransport::new();
        let result = transport.invoke(&target("a"), &MessageEnvelope::raw("Order", vec![1]));
        assert!(matches!(result, Err(BrokerError::DeliveryRejected { .. })));
    }

    #[test]
    fn test_full_buffer_rejects() {
        let transport = ChannelTransport::with_buffer_size(1);
        let endpoint = transport.connect(&target("a"));
        let envelope = MessageEnvelope::raw("Order", vec![1]);

        transport.invoke(&target("a"), &envelope).unwrap();
        assert!(transport.invoke(&target("a"), &envelope).is_err());

        endpoint.recv().unwrap();
        transport.invoke(&target("a"), &envelope).unwrap();
    }

    #[test]
    fn test_dropped_endpoint_is_forgotten() {
        let transport = ChannelTransport::new();
        drop(transport.connect(&target("a")));
        assert_eq!(transport.endpoint_count(), 1);

        assert!(transport
            .invoke(&target("a"), &MessageEnvelope::raw("Order", vec![1]))
            .is_err());
        assert_eq!(transport.endpoint_count(), 0);
    }

    #[test]
    fn test_fn_transport() {
        let transport = FnTransport::new(|target: &SubscriberTarget, _: &MessageEnvelope| {
            if target.identity_key() == "actor:ok" {
                Ok(())
            } else {
                Err(BrokerError::DeliveryRejected {
                    subscriber: target.to_string(),
                    reason: "nope".into(),
                })
            }
        });
        let envelope = MessageEnvelope::raw("Order", vec![1]);
        assert!(transport.invoke(&target("ok"), &envelope).is_ok());
        assert!(transport.invoke(&target("bad"), &envelope).is_err());
    }
}
