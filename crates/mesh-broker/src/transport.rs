//! Transport seam between the client helper and a concrete broker.

use async_trait::async_trait;
use std::sync::Arc;

use crate::message::{BrokerMessage, ConsumerId, MessageId, OutgoingMessage, SubscriptionMode};
use crate::Result;

/// Something that can hand out broker connections
#[async_trait]
pub trait Broker: Send + Sync {
    fn service_url(&self) -> &str;

    async fn connect(&self) -> Result<Arc<dyn Connection>>;
}

/// One open broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> u64;

    fn is_closed(&self) -> bool;

    /// Validate that `topic` accepts a producer; returns the producer name
    async fn create_producer(&self, topic: &str) -> Result<String>;

    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<MessageId>;

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
    ) -> Result<ConsumerId>;

    /// Wait for the next message for `consumer`. Returns `Closed` once the
    /// connection is closed.
    async fn receive(&self, consumer: ConsumerId) -> Result<BrokerMessage>;

    fn acknowledge(&self, consumer: ConsumerId, message_id: MessageId) -> Result<()>;

    /// Hand the message back for redelivery after the broker's delay
    fn negative_acknowledge(&self, consumer: ConsumerId, message_id: MessageId) -> Result<()>;

    fn close_consumer(&self, consumer: ConsumerId);

    fn close(&self);
}
