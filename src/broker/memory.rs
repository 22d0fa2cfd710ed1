// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-process broker with topic routing, FIFO queues and manual acks.
//!
//! Behaves like a single RabbitMQ node for the parts the backbone relies on:
//! re-declaring identical topology is a no-op and differing parameters
//! conflict, publishing to a key no binding matches is rejected the way a
//! mandatory publish would be, nacked messages requeue at the front flagged
//! as redelivered, and a simulated restart drops transient queues and
//! messages.

use super::{Acknowledger, Broker, ConnectionState, Delivery, DeliveryStream, PublishOptions};
use crate::{
    errors::BrokerError,
    topology::{ExchangeDefinition, QueueDefinition, QueueSettings, TopicBinding, Topology},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    persistent: bool,
    redelivered: bool,
}

struct MemQueue {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    notify: Arc<Notify>,
}

impl MemQueue {
    fn new(def: QueueDefinition) -> MemQueue {
        MemQueue {
            def,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, msg: StoredMessage) {
        if let Some(max) = self.def.max_length {
            while self.ready.len() >= max.max(0) as usize {
                if self.ready.pop_front().is_none() {
                    break;
                }
                warn!(queue = %self.def.name, "queue at max length, dropping head message");
            }
        }
        self.ready.push_back(msg);
        self.notify.notify_waiters();
    }
}

struct ConsumerEntry {
    queue: String,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    exchange: Option<ExchangeDefinition>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<TopicBinding>,
    consumers: HashMap<String, ConsumerEntry>,
    next_tag: u64,
    unreachable: bool,
    closed: bool,
}

/// In-memory implementation of [`Broker`].
pub struct InMemoryBroker {
    exchange: String,
    settings: QueueSettings,
    inner: Arc<Mutex<State>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl InMemoryBroker {
    /// Creates a broker whose topic exchange is named `exchange` and whose
    /// queues use the default TTL and length bound.
    pub fn new(exchange: &str) -> InMemoryBroker {
        InMemoryBroker::with_settings(exchange, QueueSettings::default())
    }

    pub fn with_settings(exchange: &str, settings: QueueSettings) -> InMemoryBroker {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        InMemoryBroker {
            exchange: exchange.to_owned(),
            settings,
            inner: Arc::new(Mutex::new(State::default())),
            state_tx,
        }
    }

    /// Declares a single queue outside of any binding.
    pub fn declare_queue(&self, def: QueueDefinition) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        ensure_open(&state)?;
        declare_queue(&mut state, def)
    }

    /// Number of messages ready for delivery in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.inner)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Simulates losing (or regaining) the connection.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.inner).unreachable = !reachable;
        let next = if reachable {
            ConnectionState::Connected
        } else {
            ConnectionState::Failed("connection lost".to_owned())
        };
        self.state_tx.send_replace(next);
    }

    /// Simulates a broker restart: unacked messages return to their queues,
    /// then transient queues and non-persistent messages are discarded.
    pub fn simulate_restart(&self) {
        let mut state = lock(&self.inner);

        for queue in state.queues.values_mut() {
            let mut unacked: Vec<(u64, StoredMessage)> = queue.unacked.drain().collect();
            unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, mut msg) in unacked {
                msg.redelivered = true;
                queue.ready.push_front(msg);
            }
            queue.ready.retain(|msg| msg.persistent);
        }

        let transient: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| !q.def.durable)
            .map(|(name, _)| name.clone())
            .collect();
        for name in transient {
            state.queues.remove(&name);
            state.bindings.retain(|b| b.queue_name != name);
        }

        if state.exchange.as_ref().is_some_and(|e| !e.durable) {
            state.exchange = None;
            state.bindings.clear();
        }

        for consumer in state.consumers.values() {
            consumer.cancelled.store(true, Ordering::SeqCst);
        }
        state.consumers.clear();
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
    }
}

fn lock(inner: &Mutex<State>) -> MutexGuard<'_, State> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn ensure_open(state: &State) -> Result<(), BrokerError> {
    if state.closed {
        return Err(BrokerError::Unreachable("connection closed".to_owned()));
    }
    if state.unreachable {
        return Err(BrokerError::Unreachable("connection lost".to_owned()));
    }
    Ok(())
}

fn declare_queue(state: &mut State, def: QueueDefinition) -> Result<(), BrokerError> {
    match state.queues.get(&def.name) {
        Some(existing) if existing.def != def => {
            Err(BrokerError::TopologyConflict(format!(
                "queue `{}` exists with different parameters",
                def.name
            )))
        }
        Some(_) => Ok(()),
        None => {
            debug!("queue: {} was created", def.name);
            state.queues.insert(def.name.clone(), MemQueue::new(def));
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_topology(&self, bindings: &[TopicBinding]) -> Result<(), BrokerError> {
        let topology = Topology::build(&self.exchange, self.settings, bindings);
        let mut state = lock(&self.inner);
        ensure_open(&state)?;

        let conflicting = state
            .exchange
            .as_ref()
            .is_some_and(|existing| existing != topology.exchange());
        if conflicting {
            return Err(BrokerError::TopologyConflict(format!(
                "exchange `{}` exists with different parameters",
                self.exchange
            )));
        }
        if state.exchange.is_none() {
            state.exchange = Some(topology.exchange().clone());
        }

        for queue in topology.queues() {
            declare_queue(&mut state, queue.clone())?;
        }

        for binding in topology.bindings() {
            if !state.bindings.contains(binding) {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    binding.queue_name, self.exchange, binding.routing_key_pattern
                );
                state.bindings.push(binding.clone());
            }
        }

        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        opts: PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        ensure_open(&state)?;

        let mut targets: Vec<String> = vec![];
        for binding in state.bindings.iter().filter(|b| b.matches(routing_key)) {
            if !targets.contains(&binding.queue_name) {
                targets.push(binding.queue_name.clone());
            }
        }

        if targets.is_empty() {
            warn!(routing_key, "message returned, no queue bound for the key");
            return Err(BrokerError::Unroutable(routing_key.to_owned()));
        }

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.push(StoredMessage {
                    routing_key: routing_key.to_owned(),
                    payload: payload.to_vec(),
                    persistent: opts.persistent,
                    redelivered: false,
                });
            }
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let (notify, cancelled) = {
            let mut state = lock(&self.inner);
            ensure_open(&state)?;

            let Some(q) = state.queues.get(queue) else {
                return Err(BrokerError::ProtocolError(format!("no queue `{}`", queue)));
            };
            let notify = q.notify.clone();

            if state.consumers.contains_key(consumer_tag) {
                return Err(BrokerError::ProtocolError(format!(
                    "consumer tag `{}` already in use",
                    consumer_tag
                )));
            }

            let cancelled = Arc::new(AtomicBool::new(false));
            state.consumers.insert(
                consumer_tag.to_owned(),
                ConsumerEntry {
                    queue: queue.to_owned(),
                    cancelled: cancelled.clone(),
                },
            );
            (notify, cancelled)
        };

        let inner = self.inner.clone();
        let queue = queue.to_owned();

        let deliveries = stream::unfold((), move |_| {
            let inner = inner.clone();
            let queue = queue.clone();
            let notify = notify.clone();
            let cancelled = cancelled.clone();

            async move {
                loop {
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if let Some(next) = next_delivery(&inner, &queue, &cancelled) {
                        return next.map(|delivery| (Ok(delivery), ()));
                    }

                    notified.await;
                }
            }
        });

        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        if let Some(consumer) = state.consumers.remove(consumer_tag) {
            consumer.cancelled.store(true, Ordering::SeqCst);
            if let Some(queue) = state.queues.get(&consumer.queue) {
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }

    async fn release(&self, _consumer_tag: &str) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        for consumer in state.consumers.values() {
            consumer.cancelled.store(true, Ordering::SeqCst);
        }
        state.consumers.clear();

        for queue in state.queues.values_mut() {
            let mut unacked: Vec<(u64, StoredMessage)> = queue.unacked.drain().collect();
            unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, mut msg) in unacked {
                msg.redelivered = true;
                queue.ready.push_front(msg);
            }
            queue.notify.notify_waiters();
        }

        self.state_tx.send_replace(ConnectionState::Closed);
        debug!("in-memory broker closed");
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

/// Pops the next ready message of `queue`.
///
/// Returns `Some(None)` when the consumer is finished (cancelled or the
/// queue is gone) and `None` when it should wait for a notification.
fn next_delivery(
    inner: &Arc<Mutex<State>>,
    queue: &str,
    cancelled: &AtomicBool,
) -> Option<Option<Delivery>> {
    if cancelled.load(Ordering::SeqCst) {
        return Some(None);
    }

    let mut state = lock(inner);
    state.next_tag += 1;
    let tag = state.next_tag;

    let Some(q) = state.queues.get_mut(queue) else {
        return Some(None);
    };
    let msg = q.ready.pop_front()?;
    q.unacked.insert(tag, msg.clone());

    let acker = Arc::new(MemoryAcker {
        inner: inner.clone(),
        queue: queue.to_owned(),
        tag,
    });

    Some(Some(Delivery::new(
        tag,
        &msg.routing_key,
        msg.redelivered,
        msg.payload,
        acker,
    )))
}

struct MemoryAcker {
    inner: Arc<Mutex<State>>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        ensure_open(&state)?;

        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::ProtocolError(format!("no queue `{}`", self.queue)))?;

        let mut msg = queue.unacked.remove(&self.tag).ok_or_else(|| {
            BrokerError::ProtocolError(format!("unknown delivery tag {}", self.tag))
        })?;

        if requeue {
            msg.redelivered = true;
            queue.ready.push_front(msg);
            queue.notify.notify_waiters();
        }

        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(requeue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery within a second")
            .expect("stream open")
            .expect("delivery ok")
    }

    fn bindings() -> Vec<TopicBinding> {
        vec![
            TopicBinding::new("submitted", "pa.request.submitted"),
            TopicBinding::new("audit", "pa.#"),
        ]
    }

    #[tokio::test]
    async fn should_declare_topology_idempotently() {
        let broker = InMemoryBroker::new("events");

        broker.declare_topology(&bindings()).await.unwrap();
        broker.declare_topology(&bindings()).await.unwrap();

        assert_eq!(lock(&broker.inner).bindings.len(), 2);
    }

    #[tokio::test]
    async fn should_fail_with_conflict_on_incompatible_queue() {
        let broker = InMemoryBroker::new("events");
        broker.declare_queue(QueueDefinition::new("submitted")).unwrap();

        let err = broker.declare_topology(&bindings()).await.unwrap_err();

        assert!(matches!(err, BrokerError::TopologyConflict(_)));
    }

    #[tokio::test]
    async fn should_copy_message_to_every_bound_queue() {
        let broker = InMemoryBroker::new("events");
        broker.declare_topology(&bindings()).await.unwrap();

        broker
            .publish("pa.request.submitted", b"{}", PublishOptions::persistent())
            .await
            .unwrap();
        broker
            .publish("pa.audit.event", b"{}", PublishOptions::persistent())
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("submitted"), 1);
        assert_eq!(broker.queue_depth("audit"), 2);
    }

    #[tokio::test]
    async fn should_reject_unroutable_key() {
        let broker = InMemoryBroker::new("events");
        broker.declare_topology(&bindings()).await.unwrap();

        let err = broker
            .publish("billing.invoice", b"{}", PublishOptions::persistent())
            .await
            .unwrap_err();

        assert_eq!(err, BrokerError::Unroutable("billing.invoice".to_owned()));
    }

    #[tokio::test]
    async fn should_requeue_nacked_message_at_front_as_redelivered() {
        let broker = InMemoryBroker::new("events");
        broker.declare_topology(&bindings()).await.unwrap();
        for body in [b"1", b"2"] {
            broker
                .publish("pa.request.submitted", body, PublishOptions::persistent())
                .await
                .unwrap();
        }

        let mut stream = broker.consume("submitted", "c1").await.unwrap();
        let first = next(&mut stream).await;
        assert_eq!(first.payload, b"1");
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let again = next(&mut stream).await;
        assert_eq!(again.payload, b"1");
        assert!(again.redelivered);
        again.ack().await.unwrap();

        let second = next(&mut stream).await;
        assert_eq!(second.payload, b"2");
        second.nack(false).await.unwrap();

        assert_eq!(broker.queue_depth("submitted"), 0);
    }

    #[tokio::test]
    async fn should_end_stream_on_cancel() {
        let broker = InMemoryBroker::new("events");
        broker.declare_topology(&bindings()).await.unwrap();
        let mut stream = broker.consume("submitted", "c1").await.unwrap();

        let waiter = tokio::spawn(async move { stream.next().await.is_none() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.cancel("c1").await.unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn should_keep_only_persistent_messages_on_durable_queues_after_restart() {
        let broker = InMemoryBroker::new("events");
        broker.declare_topology(&bindings()).await.unwrap();
        broker.declare_queue(QueueDefinition::new("scratch")).unwrap();

        broker
            .publish("pa.request.submitted", b"kept", PublishOptions::persistent())
            .await
            .unwrap();
        broker
            .publish("pa.request.submitted", b"lost", PublishOptions::default())
            .await
            .unwrap();

        broker.simulate_restart();

        assert_eq!(broker.queue_depth("submitted"), 1);
        assert!(!lock(&broker.inner).queues.contains_key("scratch"));
    }

    #[tokio::test]
    async fn should_report_connection_loss_and_close() {
        let broker = InMemoryBroker::new("events");
        let mut state = broker.connection_state();

        broker.set_reachable(false);
        state.changed().await.unwrap();
        assert!(matches!(*state.borrow(), ConnectionState::Failed(_)));

        let err = broker
            .publish("pa.request.submitted", b"{}", PublishOptions::persistent())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unreachable(_)));

        broker.set_reachable(true);
        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert_eq!(*broker.connection_state().borrow(), ConnectionState::Closed);
    }
}
