//! Embedded Broker - In-process implementation of the transport seam
//!
//! Used for local runs and tests. Provides:
//! - Per-topic ledgers with increasing entry ids
//! - Bounded retention replayed to newly created subscriptions
//! - Durable exclusive and failover subscriptions
//! - Delayed redelivery of negatively acknowledged messages

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::BrokerError;
use crate::message::{BrokerMessage, ConsumerId, MessageId, OutgoingMessage, SubscriptionMode};
use crate::transport::{Broker, Connection};
use crate::Result;

/// Configuration for the embedded broker
#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    pub service_url: String,
    /// Delay before a negatively acknowledged message is delivered again
    pub nack_redelivery_delay: Duration,
    /// Messages kept per topic for subscriptions created later (0 disables)
    pub retention_limit: usize,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            service_url: "memory://localhost:6650".to_string(),
            nack_redelivery_delay: Duration::from_secs(60),
            retention_limit: 10_000,
        }
    }
}

pub struct InMemoryBroker {
    service_url: String,
    state: Arc<BrokerState>,
}

struct BrokerState {
    topics: DashMap<String, Arc<Topic>>,
    connections: DashMap<u64, Weak<InMemoryConnection>>,
    next_ledger_id: AtomicU64,
    next_connection_id: AtomicU64,
    next_consumer_id: AtomicU64,
    shut_down: AtomicBool,
    nack_redelivery_delay: Duration,
    retention_limit: usize,
}

impl BrokerState {
    fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.get(name) {
            return topic.value().clone();
        }
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let ledger_id = self.next_ledger_id.fetch_add(1, Ordering::SeqCst);
                debug!(topic = %name, ledger_id = ledger_id, "Created topic");
                Arc::new(Topic::new(name.to_string(), ledger_id))
            })
            .value()
            .clone()
    }
}

struct Topic {
    name: String,
    ledger_id: u64,
    inner: Mutex<TopicInner>,
    /// Wakes receivers blocked on any subscription of this topic
    notify: Notify,
}

#[derive(Default)]
struct TopicInner {
    next_entry_id: u64,
    retained: VecDeque<BrokerMessage>,
    subscriptions: HashMap<String, Subscription>,
}

impl Topic {
    fn new(name: String, ledger_id: u64) -> Self {
        Self {
            name,
            ledger_id,
            inner: Mutex::new(TopicInner::default()),
            notify: Notify::new(),
        }
    }

    fn append(&self, outgoing: OutgoingMessage, retention_limit: usize) -> MessageId {
        let message_id = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let message_id = MessageId {
                ledger_id: self.ledger_id,
                entry_id: inner.next_entry_id,
            };
            inner.next_entry_id += 1;

            let message = BrokerMessage {
                topic: self.name.clone(),
                key: outgoing.key,
                sequence_id: outgoing.sequence_id,
                message_id,
                publish_time: Utc::now(),
                payload: outgoing.payload,
                redelivery_count: 0,
            };

            for subscription in inner.subscriptions.values_mut() {
                subscription.backlog.push_back(message.clone());
            }

            if retention_limit > 0 {
                inner.retained.push_back(message);
                while inner.retained.len() > retention_limit {
                    inner.retained.pop_front();
                }
            }
            message_id
        };
        self.notify.notify_waiters();
        message_id
    }

    fn redeliver(&self, subscription: &str, message: BrokerMessage) {
        {
            let mut inner = self.inner.lock();
            if let Some(sub) = inner.subscriptions.get_mut(subscription) {
                sub.backlog.push_front(message);
            }
        }
        self.notify.notify_waiters();
    }

    fn detach(&self, subscription: &str, consumer: ConsumerId) {
        let returned = {
            let mut inner = self.inner.lock();
            inner
                .subscriptions
                .get_mut(subscription)
                .map(|sub| sub.detach(consumer))
                .unwrap_or(0)
        };
        if returned > 0 {
            debug!(
                topic = %self.name,
                subscription = %subscription,
                consumer = %consumer,
                returned = returned,
                "Returned unacknowledged messages to backlog"
            );
        }
        self.notify.notify_waiters();
    }
}

struct Subscription {
    mode: SubscriptionMode,
    /// Attached consumers in attach order; the first one is active
    consumers: Vec<ConsumerId>,
    backlog: VecDeque<BrokerMessage>,
    unacked: HashMap<MessageId, (ConsumerId, BrokerMessage)>,
}

impl Subscription {
    fn new(mode: SubscriptionMode, consumer: ConsumerId, backlog: VecDeque<BrokerMessage>) -> Self {
        Self {
            mode,
            consumers: vec![consumer],
            backlog,
            unacked: HashMap::new(),
        }
    }

    fn active_consumer(&self) -> Option<ConsumerId> {
        self.consumers.first().copied()
    }

    fn detach(&mut self, consumer: ConsumerId) -> usize {
        self.consumers.retain(|c| *c != consumer);

        let owned: Vec<MessageId> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == consumer)
            .map(|(id, _)| *id)
            .collect();

        let mut returned: Vec<BrokerMessage> = owned
            .into_iter()
            .filter_map(|id| self.unacked.remove(&id).map(|(_, message)| message))
            .collect();
        returned.sort_by_key(|m| m.message_id);

        let count = returned.len();
        for message in returned.into_iter().rev() {
            self.backlog.push_front(message);
        }
        count
    }
}

impl InMemoryBroker {
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            service_url: config.service_url,
            state: Arc::new(BrokerState {
                topics: DashMap::new(),
                connections: DashMap::new(),
                next_ledger_id: AtomicU64::new(1),
                next_connection_id: AtomicU64::new(1),
                next_consumer_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
                nack_redelivery_delay: config.nack_redelivery_delay,
                retention_limit: config.retention_limit,
            }),
        }
    }

    /// Close every open connection and refuse new ones
    pub fn shutdown(&self) {
        if self.state.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let open: Vec<Arc<InMemoryConnection>> = self
            .state
            .connections
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        info!(connections = open.len(), "Embedded broker shutting down");
        for connection in open {
            connection.close();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .connections
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Messages currently retained on `topic`, oldest first
    pub fn retained(&self, topic: &str) -> Vec<BrokerMessage> {
        self.state
            .topics
            .get(topic)
            .map(|t| t.inner.lock().retained.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages waiting for delivery on a subscription
    pub fn backlog(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |sub| sub.backlog.len())
    }

    /// Delivered messages not yet acknowledged on a subscription
    pub fn unacked(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |sub| sub.unacked.len())
    }

    fn with_subscription<F>(&self, topic: &str, subscription: &str, f: F) -> usize
    where
        F: FnOnce(&Subscription) -> usize,
    {
        self.state
            .topics
            .get(topic)
            .and_then(|t| t.inner.lock().subscriptions.get(subscription).map(f))
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn service_url(&self) -> &str {
        &self.service_url
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        if self.is_shut_down() {
            return Err(BrokerError::ConnectionFailed(format!(
                "broker at {} is shut down",
                self.service_url
            )));
        }

        let id = self.state.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(InMemoryConnection {
            id,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            bindings: Mutex::new(HashMap::new()),
            producer_count: AtomicU64::new(0),
        });
        self.state.connections.insert(id, Arc::downgrade(&connection));
        debug!(connection_id = id, service_url = %self.service_url, "Connection opened");

        let connection: Arc<dyn Connection> = connection;
        Ok(connection)
    }
}

#[derive(Clone)]
struct Binding {
    topic: Arc<Topic>,
    subscription: String,
}

pub struct InMemoryConnection {
    id: u64,
    state: Arc<BrokerState>,
    closed: AtomicBool,
    bindings: Mutex<HashMap<ConsumerId, Binding>>,
    producer_count: AtomicU64,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn binding(&self, consumer: ConsumerId) -> Result<Binding> {
        self.bindings
            .lock()
            .get(&consumer)
            .cloned()
            .ok_or(BrokerError::ConsumerClosed)
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn create_producer(&self, topic: &str) -> Result<String> {
        self.ensure_open()?;
        self.state.topic(topic);
        let n = self.producer_count.fetch_add(1, Ordering::SeqCst);
        Ok(format!("producer-{}-{}", self.id, n))
    }

    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<MessageId> {
        self.ensure_open()?;
        let topic = self.state.topic(topic);
        Ok(topic.append(message, self.state.retention_limit))
    }

    async fn subscribe(
        &self,
        topic_name: &str,
        subscription: &str,
        mode: SubscriptionMode,
    ) -> Result<ConsumerId> {
        self.ensure_open()?;
        let topic = self.state.topic(topic_name);
        let consumer = ConsumerId(self.state.next_consumer_id.fetch_add(1, Ordering::SeqCst));

        {
            let mut guard = topic.inner.lock();
            let inner = &mut *guard;
            match inner.subscriptions.entry(subscription.to_string()) {
                Entry::Occupied(mut existing) => {
                    let existing = existing.get_mut();
                    if existing.mode != mode {
                        return Err(BrokerError::SubscriptionModeMismatch {
                            topic: topic_name.to_string(),
                            subscription: subscription.to_string(),
                            existing: existing.mode,
                        });
                    }
                    if mode == SubscriptionMode::Exclusive && !existing.consumers.is_empty() {
                        return Err(BrokerError::ConsumerBusy {
                            topic: topic_name.to_string(),
                            subscription: subscription.to_string(),
                        });
                    }
                    existing.consumers.push(consumer);
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Subscription::new(mode, consumer, inner.retained.clone()));
                }
            }
        }

        self.bindings.lock().insert(
            consumer,
            Binding {
                topic,
                subscription: subscription.to_string(),
            },
        );
        debug!(
            connection_id = self.id,
            topic = %topic_name,
            subscription = %subscription,
            mode = %mode,
            consumer = %consumer,
            "Consumer subscribed"
        );
        Ok(consumer)
    }

    async fn receive(&self, consumer: ConsumerId) -> Result<BrokerMessage> {
        loop {
            self.ensure_open()?;
            let binding = self.binding(consumer)?;

            let notified = binding.topic.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check after registering so a concurrent close is not missed
            self.ensure_open()?;
            {
                let mut inner = binding.topic.inner.lock();
                let subscription = inner
                    .subscriptions
                    .get_mut(&binding.subscription)
                    .ok_or(BrokerError::ConsumerClosed)?;
                if !subscription.consumers.contains(&consumer) {
                    return Err(BrokerError::ConsumerClosed);
                }
                if subscription.active_consumer() == Some(consumer) {
                    if let Some(message) = subscription.backlog.pop_front() {
                        subscription
                            .unacked
                            .insert(message.message_id, (consumer, message.clone()));
                        return Ok(message);
                    }
                }
            }

            notified.await;
        }
    }

    fn acknowledge(&self, consumer: ConsumerId, message_id: MessageId) -> Result<()> {
        let binding = self.binding(consumer)?;
        let mut inner = binding.topic.inner.lock();
        inner
            .subscriptions
            .get_mut(&binding.subscription)
            .and_then(|sub| sub.unacked.remove(&message_id))
            .map(|_| ())
            .ok_or(BrokerError::UnknownMessage(message_id))
    }

    fn negative_acknowledge(&self, consumer: ConsumerId, message_id: MessageId) -> Result<()> {
        let binding = self.binding(consumer)?;
        let mut message = {
            let mut inner = binding.topic.inner.lock();
            inner
                .subscriptions
                .get_mut(&binding.subscription)
                .and_then(|sub| sub.unacked.remove(&message_id))
                .map(|(_, message)| message)
                .ok_or(BrokerError::UnknownMessage(message_id))?
        };
        message.redelivery_count += 1;

        let delay = self.state.nack_redelivery_delay;
        let topic = binding.topic;
        let subscription = binding.subscription;
        if delay.is_zero() {
            topic.redeliver(&subscription, message);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                topic.redeliver(&subscription, message);
            });
        }
        Ok(())
    }

    fn close_consumer(&self, consumer: ConsumerId) {
        let binding = self.bindings.lock().remove(&consumer);
        if let Some(binding) = binding {
            binding.topic.detach(&binding.subscription, consumer);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let bindings: Vec<(ConsumerId, Binding)> = self.bindings.lock().drain().collect();
        for (consumer, binding) in bindings {
            binding.topic.detach(&binding.subscription, consumer);
        }
        self.state.connections.remove(&self.id);
        debug!(connection_id = self.id, "Connection closed");
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn outgoing(sequence_id: u64, body: &'static str) -> OutgoingMessage {
        OutgoingMessage {
            key: "k".to_string(),
            sequence_id,
            payload: Bytes::from_static(body.as_bytes()),
        }
    }

    fn broker_with_delay(delay: Duration) -> InMemoryBroker {
        InMemoryBroker::new(InMemoryBrokerConfig {
            nack_redelivery_delay: delay,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_entries() {
        let broker = InMemoryBroker::default();
        let conn = broker.connect().await.unwrap();

        let first = conn.publish("t", outgoing(0, "a")).await.unwrap();
        let second = conn.publish("t", outgoing(1, "b")).await.unwrap();

        assert_eq!(first.ledger_id, second.ledger_id);
        assert_eq!(second.entry_id, first.entry_id + 1);
        assert_eq!(broker.retained("t").len(), 2);
    }

    #[tokio::test]
    async fn test_new_subscription_replays_retained() {
        let broker = InMemoryBroker::default();
        let conn = broker.connect().await.unwrap();
        conn.publish("t", outgoing(0, "early")).await.unwrap();

        let consumer = conn.subscribe("t", "sub", SubscriptionMode::Exclusive).await.unwrap();
        let message = conn.receive(consumer).await.unwrap();
        assert_eq!(message.payload, Bytes::from_static(b"early"));
        assert_eq!(message.sequence_id, 0);
    }

    #[tokio::test]
    async fn test_exclusive_rejects_second_consumer() {
        let broker = InMemoryBroker::default();
        let conn = broker.connect().await.unwrap();
        conn.subscribe("t", "sub", SubscriptionMode::Exclusive).await.unwrap();

        let err = conn.subscribe("t", "sub", SubscriptionMode::Exclusive).await.unwrap_err();
        assert!(matches!(err, BrokerError::ConsumerBusy { .. }));

        let err = conn.subscribe("t", "sub", SubscriptionMode::Failover).await.unwrap_err();
        assert!(matches!(err, BrokerError::SubscriptionModeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_ack_removes_and_unknown_ack_fails() {
        let broker = InMemoryBroker::default();
        let conn = broker.connect().await.unwrap();
        let consumer = conn.subscribe("t", "sub", SubscriptionMode::Exclusive).await.unwrap();
        conn.publish("t", outgoing(0, "a")).await.unwrap();

        let message = conn.receive(consumer).await.unwrap();
        assert_eq!(broker.unacked("t", "sub"), 1);
        conn.acknowledge(consumer, message.message_id).unwrap();
        assert_eq!(broker.unacked("t", "sub"), 0);

        let err = conn.acknowledge(consumer, message.message_id).unwrap_err();
        assert!(matches!(err, BrokerError::UnknownMessage(_)));
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_count() {
        let broker = broker_with_delay(Duration::ZERO);
        let conn = broker.connect().await.unwrap();
        let consumer = conn.subscribe("t", "sub", SubscriptionMode::Exclusive).await.unwrap();
        conn.publish("t", outgoing(0, "a")).await.unwrap();
        conn.publish("t", outgoing(1, "b")).await.unwrap();

        let first = conn.receive(consumer).await.unwrap();
        conn.negative_acknowledge(consumer, first.message_id).unwrap();

        let again = conn.receive(consumer).await.unwrap();
        assert_eq!(again.message_id, first.message_id);
        assert_eq!(again.redelivery_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_waits_for_delay() {
        let broker = broker_with_delay(Duration::from_secs(60));
        let conn = broker.connect().await.unwrap();
        let consumer = conn.subscribe("t", "sub", SubscriptionMode::Exclusive).await.unwrap();
        conn.publish("t", outgoing(0, "a")).await.unwrap();

        let first = conn.receive(consumer).await.unwrap();
        conn.negative_acknowledge(consumer, first.message_id).unwrap();
        assert_eq!(broker.backlog("t", "sub"), 0);

        let redelivered = conn.receive(consumer).await.unwrap();
        assert_eq!(redelivered.message_id, first.message_id);
        assert_eq!(redelivered.redelivery_count, 1);
    }

    #[tokio::test]
    async fn test_failover_standby_takes_over() {
        let broker = InMemoryBroker::default();
        let active = broker.connect().await.unwrap();
        let standby = broker.connect().await.unwrap();

        let a = active.subscribe("t", "sel", SubscriptionMode::Failover).await.unwrap();
        let b = standby.subscribe("t", "sel", SubscriptionMode::Failover).await.unwrap();
        active.publish("t", outgoing(0, "one")).await.unwrap();

        // Delivered to the active consumer, left unacknowledged
        let message = active.receive(a).await.unwrap();

        let standby_recv = {
            let standby = standby.clone();
            tokio::spawn(async move { standby.receive(b).await })
        };
        tokio::task::yield_now().await;
        assert!(!standby_recv.is_finished());

        active.close();
        let taken_over = standby_recv.await.unwrap().unwrap();
        assert_eq!(taken_over.message_id, message.message_id);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receive() {
        let broker = InMemoryBroker::default();
        let conn = broker.connect().await.unwrap();
        let consumer = conn.subscribe("t", "sub", SubscriptionMode::Exclusive).await.unwrap();

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.receive(consumer).await })
        };
        tokio::task::yield_now().await;

        broker.shutdown();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert!(broker.connect().await.is_err());
        assert_eq!(broker.open_connections(), 0);
    }
}
