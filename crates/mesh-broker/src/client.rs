//! Broker Client Helper
//!
//! Wraps one broker connection and creates topic-bound producers and
//! consumers. Every handle releases its broker resources when dropped, so a
//! role that keeps its handles in scope gets release on every exit path.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::message::{ConsumerId, Message, MessageId, OutgoingMessage, SubscriptionMode};
use crate::transport::{Broker, Connection};
use crate::Result;

/// Completion callback for an asynchronous send
pub type SendCallback = Box<dyn FnOnce(Result<MessageId>) + Send>;

/// An open broker connection plus the subscription name its consumers use
pub struct BrokerClient {
    connection: Arc<dyn Connection>,
    service_url: String,
    subscription: String,
    close_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerClient {
    /// Open a connection. Consumers created from this client attach to
    /// `subscription` on their topic.
    pub async fn open(broker: &dyn Broker, subscription: impl Into<String>) -> Result<Self> {
        let connection = broker.connect().await?;
        let client = Self {
            connection,
            service_url: broker.service_url().to_string(),
            subscription: subscription.into(),
            close_watcher: Mutex::new(None),
        };
        info!(
            service_url = %client.service_url,
            connection_id = client.connection.id(),
            subscription = %client.subscription,
            "Broker client opened"
        );
        Ok(client)
    }

    pub fn service_url(&self) -> &str {
        &self.service_url
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Close the connection once `signal` resolves. Wakes any consumer
    /// blocked in `receive` on this connection.
    pub fn close_when<F>(&self, signal: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let connection = self.connection.clone();
        let handle = tokio::spawn(async move {
            signal.await;
            connection.close();
        });
        if let Some(previous) = self.close_watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    pub async fn create_producer<T>(&self, topic: &str) -> Result<Producer<T>>
    where
        T: Serialize,
    {
        let name = self.connection.create_producer(topic).await?;
        debug!(topic = %topic, producer = %name, "Producer created");
        Ok(Producer::start(self.connection.clone(), topic.to_string(), name))
    }

    /// Exclusive subscription with synchronous `receive`
    pub async fn create_consumer<T>(&self, topic: &str) -> Result<Consumer<T>>
    where
        T: DeserializeOwned,
    {
        let handle = self.subscribe(topic, SubscriptionMode::Exclusive).await?;
        Ok(Consumer::new(handle, None))
    }

    /// Exclusive subscription whose messages are pushed to `listener`
    pub async fn create_consumer_with_listener<T, F>(&self, topic: &str, listener: F) -> Result<Consumer<T>>
    where
        T: DeserializeOwned + 'static,
        F: Fn(&ConsumerHandle, Message<T>) + Send + Sync + 'static,
    {
        let handle = self.subscribe(topic, SubscriptionMode::Exclusive).await?;
        let task = spawn_listener(handle.clone(), listener);
        Ok(Consumer::new(handle, Some(task)))
    }

    /// Failover subscription: standby processes take over without loss
    pub async fn create_consumer_with_failover<T>(&self, topic: &str) -> Result<Consumer<T>>
    where
        T: DeserializeOwned,
    {
        let handle = self.subscribe(topic, SubscriptionMode::Failover).await?;
        Ok(Consumer::new(handle, None))
    }

    async fn subscribe(&self, topic: &str, mode: SubscriptionMode) -> Result<ConsumerHandle> {
        let id = self.connection.subscribe(topic, &self.subscription, mode).await?;
        Ok(ConsumerHandle {
            connection: self.connection.clone(),
            id,
            topic: Arc::from(topic),
            subscription: Arc::from(self.subscription.as_str()),
        })
    }

    pub fn close(&self) {
        if let Some(watcher) = self.close_watcher.lock().take() {
            watcher.abort();
        }
        if !self.connection.is_closed() {
            self.connection.close();
            debug!(service_url = %self.service_url, "Broker client closed");
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_listener<T, F>(handle: ConsumerHandle, listener: F) -> JoinHandle<()>
where
    T: DeserializeOwned + 'static,
    F: Fn(&ConsumerHandle, Message<T>) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            match handle.connection.receive(handle.id).await {
                Ok(raw) => listener(&handle, Message::new(raw)),
                Err(e) if e.is_closed() => {
                    debug!(topic = %handle.topic, consumer = %handle.id, "Listener stopped");
                    break;
                }
                Err(e) => {
                    warn!(topic = %handle.topic, consumer = %handle.id, error = %e, "Listener receive failed");
                    break;
                }
            }
        }
    })
}

// ============================================================================
// Consumer
// ============================================================================

/// Cloneable view of a consumer used to acknowledge messages
#[derive(Clone)]
pub struct ConsumerHandle {
    connection: Arc<dyn Connection>,
    id: ConsumerId,
    topic: Arc<str>,
    subscription: Arc<str>,
}

impl ConsumerHandle {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn acknowledge<T>(&self, message: &Message<T>) -> Result<()> {
        self.connection.acknowledge(self.id, message.message_id())
    }

    pub fn negative_acknowledge<T>(&self, message: &Message<T>) -> Result<()> {
        self.connection.negative_acknowledge(self.id, message.message_id())
    }
}

/// A topic-bound consumer. Detaches from its subscription when dropped.
pub struct Consumer<T> {
    handle: ConsumerHandle,
    listener: Option<JoinHandle<()>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Consumer<T> {
    fn new(handle: ConsumerHandle, listener: Option<JoinHandle<()>>) -> Self {
        Self {
            handle,
            listener,
            _marker: PhantomData,
        }
    }

    pub fn handle(&self) -> &ConsumerHandle {
        &self.handle
    }

    pub fn topic(&self) -> &str {
        self.handle.topic()
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.handle.subscription, self.handle.id)
    }

    /// Wait for the next message
    pub async fn receive(&self) -> Result<Message<T>> {
        if self.listener.is_some() {
            return Err(BrokerError::ListenerConsumer);
        }
        let raw = self.handle.connection.receive(self.handle.id).await?;
        Ok(Message::new(raw))
    }

    pub fn acknowledge(&self, message: &Message<T>) -> Result<()> {
        self.handle.acknowledge(message)
    }

    pub fn negative_acknowledge(&self, message: &Message<T>) -> Result<()> {
        self.handle.negative_acknowledge(message)
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.handle.connection.close_consumer(self.handle.id);
        debug!(topic = %self.handle.topic, consumer = %self.handle.id, "Consumer closed");
    }
}

// ============================================================================
// Producer
// ============================================================================

struct PendingSend {
    message: OutgoingMessage,
    on_complete: SendCallback,
}

/// A topic-bound producer with fire-and-forget sends.
///
/// Sends are handed to a per-producer task that publishes them in call order
/// and then runs each completion callback.
pub struct Producer<T> {
    topic: String,
    name: String,
    sequence: AtomicU64,
    tx: mpsc::UnboundedSender<PendingSend>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Producer<T> {
    fn start(connection: Arc<dyn Connection>, topic: String, name: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PendingSend>();

        let worker_topic = topic.clone();
        tokio::spawn(async move {
            while let Some(pending) = rx.recv().await {
                let result = connection.publish(&worker_topic, pending.message).await;
                (pending.on_complete)(result);
            }
        });

        Self {
            topic,
            name,
            sequence: AtomicU64::new(0),
            tx,
            _marker: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: Serialize> Producer<T> {
    /// Queue `value` for publishing and return immediately. Failures,
    /// including serialization, are reported only through `on_complete`.
    pub fn send_async<F>(&self, key: &str, value: &T, on_complete: F)
    where
        F: FnOnce(Result<MessageId>) + Send + 'static,
    {
        let payload = match serde_json::to_vec(value) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                on_complete(Err(e.into()));
                return;
            }
        };

        let pending = PendingSend {
            message: OutgoingMessage {
                key: key.to_string(),
                sequence_id: self.sequence.fetch_add(1, Ordering::SeqCst),
                payload,
            },
            on_complete: Box::new(on_complete),
        };

        if let Err(mpsc::error::SendError(pending)) = self.tx.send(pending) {
            (pending.on_complete)(Err(BrokerError::ProducerClosed(self.topic.clone())));
        }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        debug!(topic = %self.topic, producer = %self.name, "Producer closed");
    }
}
