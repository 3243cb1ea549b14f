//! Background delivery loop.
//!
//! Each iteration snapshots the known queues and hands them to a pool of
//! worker threads. A queue is drained by exactly one worker, head first,
//! one message per transaction: the dequeue only commits when the
//! subscriber accepts the message.
//!
//! Iterations are time-boxed by a child cancellation token. Cancelling it
//! cuts the iteration short; the loop itself only stops on shutdown.

use super::registry::{KnownQueue, SubscriptionRegistry};
use crate::cancel::CancellationToken;
use crate::config::DeliveryConfig;
use crate::error::{BrokerError, Result};
use crate::storage::StateStore;
use crate::transport::DeliveryTransport;
use crossbeam_channel::{after, bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Counters for one iteration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IterationStats {
    pub queues: usize,
    pub delivered: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub errors: u64,
}

impl IterationStats {
    fn merge(&mut self, other: &IterationStats) {
        self.delivered += other.delivered;
        self.rejected += other.rejected;
        self.dead_lettered += other.dead_lettered;
        self.errors += other.errors;
    }
}

/// What happened to the head of a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeadOutcome {
    Delivered,
    Rejected,
    DeadLettered,
    Empty,
}

/// Drains subscriber queues through a transport.
pub struct DeliveryLoop {
    store: Arc<StateStore>,
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<dyn DeliveryTransport>,
    config: DeliveryConfig,

    /// Consecutive rejections of each queue's head.
    rejections: Mutex<HashMap<String, u32>>,
}

impl DeliveryLoop {
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<SubscriptionRegistry>,
        transport: Arc<dyn DeliveryTransport>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
            config,
            rejections: Mutex::new(HashMap::new()),
        }
    }

    /// Start the loop on its own thread.
    pub fn spawn(self: Arc<Self>, lifetime: CancellationToken) -> Result<DeliveryLoopHandle> {
        let (stop, stopped) = bounded::<()>(0);
        let token = lifetime.clone();

        let thread = thread::Builder::new()
            .name("switchboard-delivery".into())
            .spawn(move || self.run(&token, &stopped))?;

        Ok(DeliveryLoopHandle {
            lifetime,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    fn run(&self, lifetime: &CancellationToken, stopped: &Receiver<()>) {
        // The registry must be initialized before the mirror can be trusted
        while let Err(e) = self.registry.wait_ready() {
            tracing::warn!(error = %e, "registry initialization failed, retrying");
            if !pause(stopped, self.config.period) {
                return;
            }
        }

        tracing::info!(
            due_time_ms = self.config.due_time.as_millis() as u64,
            period_ms = self.config.period.as_millis() as u64,
            "delivery loop started"
        );

        if !pause(stopped, self.config.due_time) {
            return;
        }

        loop {
            if lifetime.is_cancelled() {
                break;
            }

            let started = Instant::now();
            let stats = self.run_iteration(lifetime);
            if stats.delivered > 0 || stats.errors > 0 || stats.dead_lettered > 0 {
                tracing::debug!(
                    queues = stats.queues,
                    delivered = stats.delivered,
                    rejected = stats.rejected,
                    dead_lettered = stats.dead_lettered,
                    errors = stats.errors,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "delivery iteration finished"
                );
            }

            if !pause(stopped, self.config.period) {
                break;
            }
        }

        tracing::info!("delivery loop stopped");
    }

    /// Run one time-boxed pass over every known queue.
    pub fn run_iteration(&self, lifetime: &CancellationToken) -> IterationStats {
        let token = lifetime.child_with_timeout(self.config.max_processing_period);
        let queues = match self.registry.known_queues() {
            Ok(queues) => queues,
            Err(e) => {
                tracing::warn!(error = %e, "delivery iteration skipped, registry not ready");
                return IterationStats {
                    errors: 1,
                    ..Default::default()
                };
            }
        };

        let mut stats = IterationStats {
            queues: queues.len(),
            ..Default::default()
        };
        if queues.is_empty() {
            return stats;
        }

        let (jobs, job_queue): (Sender<KnownQueue>, Receiver<KnownQueue>) = unbounded();
        for queue in queues {
            // Receiver is alive until the end of this function
            let _ = jobs.send(queue);
        }
        drop(jobs);

        let workers = self.config.workers.min(stats.queues);
        let totals = Mutex::new(IterationStats::default());

        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    let mut local = IterationStats::default();
                    while let Ok(queue) = job_queue.recv() {
                        if token.is_cancelled() {
                            break;
                        }
                        if let Err(e) = self.drain_queue(&queue, &token, &mut local) {
                            local.errors += 1;
                            log_iteration_error(&queue, &e);
                        }
                    }
                    totals.lock().merge(&local);
                });
            }
        });

        stats.merge(&totals.into_inner());
        stats
    }

    /// Deliver up to the batch limit from one queue, in order.
    fn drain_queue(&self, queue: &KnownQueue, token: &CancellationToken, stats: &mut IterationStats) -> Result<()> {
        let available = match self.store.queue_len(&queue.record.queue_name)? {
            Some(count) => count,
            None => return Ok(()),
        };

        let limit = available.min(self.config.max_dequeues_per_iteration);
        for _ in 0..limit {
            token.check()?;
            match self.deliver_head(queue, token)? {
                HeadOutcome::Delivered => stats.delivered += 1,
                HeadOutcome::DeadLettered => stats.dead_lettered += 1,
                HeadOutcome::Rejected => {
                    // Later messages wait for the head
                    stats.rejected += 1;
                    break;
                }
                HeadOutcome::Empty => break,
            }
        }

        Ok(())
    }

    /// Dequeue and deliver the head of `queue` in one transaction.
    ///
    /// The queue stays locked until the outcome is committed, so a rejected
    /// head is moved to dead letters before anyone else can dequeue.
    fn deliver_head(&self, queue: &KnownQueue, token: &CancellationToken) -> Result<HeadOutcome> {
        let record = &queue.record;
        let queue_name = &record.queue_name;
        let reference = &record.reference;

        let mut tx = self.store.transaction_with_token(token.clone());
        if !tx.contains(queue_name)? {
            return Ok(HeadOutcome::Empty);
        }
        let envelope = match tx.try_dequeue(queue_name)? {
            Some(envelope) => envelope,
            None => return Ok(HeadOutcome::Empty),
        };

        let error = match reference.publish(&envelope, self.transport.as_ref()) {
            Ok(()) => {
                tx.commit()?;
                self.rejections.lock().remove(queue_name);
                tracing::debug!(
                    queue = %queue_name,
                    subscriber = %reference,
                    "delivered message"
                );
                return Ok(HeadOutcome::Delivered);
            }
            Err(e) => e,
        };

        let attempts = {
            let mut rejections = self.rejections.lock();
            let attempts = rejections.entry(queue_name.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };
        tracing::debug!(
            queue = %queue_name,
            subscriber = %reference,
            attempts,
            error = %error,
            "delivery rejected"
        );

        let exhausted = matches!(self.config.max_delivery_attempts, Some(max) if attempts >= max);
        if !exhausted || !tx.contains(&record.dead_letter_queue_name)? {
            tx.abort();
            return Ok(HeadOutcome::Rejected);
        }

        tx.enqueue(&record.dead_letter_queue_name, envelope)?;
        tx.commit()?;
        self.rejections.lock().remove(queue_name);
        tracing::warn!(
            queue = %queue_name,
            dead_letter_queue = %record.dead_letter_queue_name,
            subscriber = %reference,
            "moved undeliverable message to dead letters"
        );
        Ok(HeadOutcome::DeadLettered)
    }

    /// Deliver everything left in `queue` until it is empty or a delivery
    /// is rejected. Returns the number of messages delivered.
    pub fn flush_queue(&self, queue: &KnownQueue) -> Result<u64> {
        let token = CancellationToken::new();
        let mut delivered = 0;
        loop {
            match self.deliver_head(queue, &token)? {
                HeadOutcome::Delivered => delivered += 1,
                HeadOutcome::DeadLettered => {}
                HeadOutcome::Rejected | HeadOutcome::Empty => break,
            }
        }
        Ok(delivered)
    }

    /// Consecutive rejections recorded for `queue_name`.
    pub fn rejection_count(&self, queue_name: &str) -> u32 {
        self.rejections.lock().get(queue_name).copied().unwrap_or(0)
    }

    /// Forget rejection counters of queues that no longer exist.
    pub(crate) fn forget(&self, queue_name: &str) {
        self.rejections.lock().remove(queue_name);
    }
}

fn log_iteration_error(queue: &KnownQueue, error: &BrokerError) {
    match error {
        BrokerError::Cancelled => {
            tracing::debug!(queue = %queue.record.queue_name, "delivery cut short by iteration budget")
        }
        _ => tracing::warn!(
            queue = %queue.record.queue_name,
            error = %error,
            "delivery iteration failed for queue"
        ),
    }
}

/// Sleep for `duration` unless stopped first. Returns false when stopped.
fn pause(stopped: &Receiver<()>, duration: std::time::Duration) -> bool {
    select! {
        recv(stopped) -> _ => false,
        recv(after(duration)) -> _ => true,
    }
}

/// Handle to a running delivery loop. Dropping it stops the loop.
pub struct DeliveryLoopHandle {
    lifetime: CancellationToken,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeliveryLoopHandle {
    /// Stop the loop and wait for the current iteration to wind down.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    fn stop_and_join(&mut self) {
        self.lifetime.cancel();
        // Disconnecting the channel wakes the loop from any pause
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("delivery loop thread panicked");
            }
        }
    }
}

impl Drop for DeliveryLoopHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::subscriber::{SubscriberReference, SubscriberTarget};
    use crate::transport::{ChannelTransport, FnTransport};
    use crate::types::MessageEnvelope;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn actor(id: &str) -> SubscriberReference {
        SubscriberReference::actor("fabric:/shop/Actors", id)
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            due_time: Duration::from_millis(0),
            period: Duration::from_millis(10),
            max_processing_period: Duration::from_secs(5),
            max_dequeues_per_iteration: 100,
            max_delivery_attempts: None,
            workers: 2,
        }
    }

    struct Fixture {
        store: Arc<StateStore>,
        registry: Arc<SubscriptionRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(StateStore::in_memory());
            let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&store), RetryPolicy::default()));
            Self { store, registry }
        }

        fn delivery(&self, transport: Arc<dyn DeliveryTransport>, config: DeliveryConfig) -> DeliveryLoop {
            DeliveryLoop::new(Arc::clone(&self.store), Arc::clone(&self.registry), transport, config)
        }

        fn enqueue(&self, reference: &SubscriberReference, payloads: &[u8]) {
            let queue = reference.queue_name("Order");
            self.store
                .with_transaction(|tx| {
                    for &p in payloads {
                        tx.enqueue(&queue, MessageEnvelope::raw("Order", vec![p]))?;
                    }
                    Ok(())
                })
                .unwrap();
        }

        fn depth(&self, reference: &SubscriberReference) -> u64 {
            self.store
                .queue_len(&reference.queue_name("Order"))
                .unwrap()
                .unwrap_or(0)
        }

        fn dead_depth(&self, reference: &SubscriberReference) -> u64 {
            self.store
                .queue_len(&reference.dead_letter_queue_name("Order"))
                .unwrap()
                .unwrap_or(0)
        }
    }

    #[test]
    fn test_fifo_per_subscriber() {
        let fixture = Fixture::new();
        let transport = Arc::new(ChannelTransport::new());
        let a = transport.connect(&actor("a").target);
        let b = transport.connect(&actor("b").target);

        fixture.registry.register_subscriber(&actor("a"), "Order").unwrap();
        fixture.registry.register_subscriber(&actor("b"), "Order").unwrap();
        fixture.enqueue(&actor("a"), &[1, 2, 3]);
        fixture.enqueue(&actor("b"), &[4, 5, 6]);

        let delivery = fixture.delivery(transport, config());
        let stats = delivery.run_iteration(&CancellationToken::new());
        assert_eq!(stats.delivered, 6);

        let got_a: Vec<u8> = a.drain().into_iter().map(|e| e.payload[0]).collect();
        let got_b: Vec<u8> = b.drain().into_iter().map(|e| e.payload[0]).collect();
        assert_eq!(got_a, vec![1, 2, 3]);
        assert_eq!(got_b, vec![4, 5, 6]);
        assert_eq!(fixture.depth(&actor("a")), 0);
    }

    #[test]
    fn test_rejection_keeps_message_queued() {
        let fixture = Fixture::new();
        let failures = Arc::new(AtomicU32::new(3));
        let remaining = Arc::clone(&failures);
        let transport = Arc::new(FnTransport::new(move |target: &SubscriberTarget, _: &MessageEnvelope| {
            if remaining.load(Ordering::SeqCst) > 0 {
                remaining.fetch_sub(1, Ordering::SeqCst);
                Err(BrokerError::DeliveryRejected {
                    subscriber: target.to_string(),
                    reason: "busy".into(),
                })
            } else {
                Ok(())
            }
        }));

        fixture.registry.register_subscriber(&actor("a"), "Order").unwrap();
        fixture.enqueue(&actor("a"), &[1, 2]);
        let delivery = fixture.delivery(transport, config());
        let lifetime = CancellationToken::new();

        for expected_failures in 1..=3 {
            let stats = delivery.run_iteration(&lifetime);
            assert_eq!(stats.rejected, 1);
            assert_eq!(stats.delivered, 0);
            assert_eq!(fixture.depth(&actor("a")), 2);
            assert_eq!(
                delivery.rejection_count(&actor("a").queue_name("Order")),
                expected_failures
            );
        }

        let stats = delivery.run_iteration(&lifetime);
        assert_eq!(stats.delivered, 2);
        assert_eq!(fixture.depth(&actor("a")), 0);
        assert_eq!(delivery.rejection_count(&actor("a").queue_name("Order")), 0);
    }

    #[test]
    fn test_dead_letter_after_max_attempts() {
        let fixture = Fixture::new();
        let transport = Arc::new(FnTransport::new(|target: &SubscriberTarget, envelope: &MessageEnvelope| {
            if envelope.payload[0] == 1 {
                Err(BrokerError::DeliveryRejected {
                    subscriber: target.to_string(),
                    reason: "poison".into(),
                })
            } else {
                Ok(())
            }
        }));

        fixture.registry.register_subscriber(&actor("a"), "Order").unwrap();
        fixture.enqueue(&actor("a"), &[1, 2]);

        let delivery = fixture.delivery(
            transport,
            DeliveryConfig {
                max_delivery_attempts: Some(2),
                ..config()
            },
        );
        let lifetime = CancellationToken::new();

        let first = delivery.run_iteration(&lifetime);
        assert_eq!(first.rejected, 1);
        assert_eq!(fixture.depth(&actor("a")), 2);

        let second = delivery.run_iteration(&lifetime);
        assert_eq!(second.dead_lettered, 1);
        assert_eq!(second.delivered, 1);
        assert_eq!(fixture.depth(&actor("a")), 0);
        assert_eq!(fixture.dead_depth(&actor("a")), 1);
    }

    #[test]
    fn test_concurrent_flushes_only_dead_letter_rejected_messages() {
        let fixture = Fixture::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let transport = Arc::new(FnTransport::new(move |target: &SubscriberTarget, envelope: &MessageEnvelope| {
            let payload = envelope.payload[0];
            if payload % 3 == 0 {
                return Err(BrokerError::DeliveryRejected {
                    subscriber: target.to_string(),
                    reason: "poison".into(),
                });
            }
            sink.lock().push(payload);
            Ok(())
        }));

        fixture.registry.register_subscriber(&actor("a"), "Order").unwrap();
        let payloads: Vec<u8> = (1..=120).collect();
        fixture.enqueue(&actor("a"), &payloads);

        let delivery = fixture.delivery(
            transport,
            DeliveryConfig {
                max_delivery_attempts: Some(1),
                ..config()
            },
        );
        let queue = fixture
            .registry
            .find_queue(&actor("a"), "Order")
            .unwrap()
            .unwrap();

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while fixture.depth(&actor("a")) > 0 {
                        delivery.flush_queue(&queue).unwrap();
                    }
                });
            }
        });

        let mut got = delivered.lock().clone();
        got.sort_unstable();
        let expected: Vec<u8> = payloads.iter().copied().filter(|p| p % 3 != 0).collect();
        assert_eq!(got, expected);

        let mut dead: Vec<u8> = fixture
            .store
            .with_transaction(|tx| tx.items(&actor("a").dead_letter_queue_name("Order")))
            .unwrap()
            .into_iter()
            .map(|e| e.payload[0])
            .collect();
        dead.sort_unstable();
        let poison: Vec<u8> = payloads.iter().copied().filter(|p| p % 3 == 0).collect();
        assert_eq!(dead, poison);
    }

    #[test]
    fn test_batch_limit() {
        let fixture = Fixture::new();
        let transport = Arc::new(ChannelTransport::new());
        let endpoint = transport.connect(&actor("a").target);

        fixture.registry.register_subscriber(&actor("a"), "Order").unwrap();
        fixture.enqueue(&actor("a"), &[1, 2, 3, 4, 5]);

        let delivery = fixture.delivery(
            transport,
            DeliveryConfig {
                max_dequeues_per_iteration: 2,
                ..config()
            },
        );
        let stats = delivery.run_iteration(&CancellationToken::new());
        assert_eq!(stats.delivered, 2);
        assert_eq!(fixture.depth(&actor("a")), 3);
        assert_eq!(endpoint.drain().len(), 2);
    }

    #[test]
    fn test_cancelled_iteration_delivers_nothing() {
        let fixture = Fixture::new();
        let transport = Arc::new(ChannelTransport::new());
        let _endpoint = transport.connect(&actor("a").target);

        fixture.registry.register_subscriber(&actor("a"), "Order").unwrap();
        fixture.enqueue(&actor("a"), &[1]);

        let delivery = fixture.delivery(transport, config());
        let lifetime = CancellationToken::new();
        lifetime.cancel();

        let stats = delivery.run_iteration(&lifetime);
        assert_eq!(stats.delivered, 0);
        assert_eq!(fixture.depth(&actor("a")), 1);
    }

    #[test]
    fn test_spawned_loop_delivers_and_stops() {
        let fixture = Fixture::new();
        let transport = Arc::new(ChannelTransport::new());
        let endpoint = transport.connect(&actor("a").target);

        fixture.registry.register_subscriber(&actor("a"), "Order").unwrap();
        fixture.enqueue(&actor("a"), &[9]);

        let delivery = Arc::new(fixture.delivery(transport, config()));
        let handle = delivery.spawn(CancellationToken::new()).unwrap();

        let envelope = endpoint.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(envelope.payload, vec![9]);
        assert!(handle.is_running());

        handle.shutdown();
        assert_eq!(fixture.depth(&actor("a")), 0);
    }
}
