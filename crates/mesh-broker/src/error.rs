use crate::message::{MessageId, SubscriptionMode};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Consumer closed")]
    ConsumerClosed,

    #[error("Producer closed for topic {0}")]
    ProducerClosed(String),

    #[error("Exclusive subscription {subscription} on {topic} already has a consumer")]
    ConsumerBusy { topic: String, subscription: String },

    #[error("Subscription {subscription} on {topic} already exists with mode {existing}")]
    SubscriptionModeMismatch {
        topic: String,
        subscription: String,
        existing: SubscriptionMode,
    },

    #[error("Message {0} is not pending acknowledgment")]
    UnknownMessage(MessageId),

    #[error("receive() cannot be used on a consumer with a message listener")]
    ListenerConsumer,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// True when the failure means the handle can no longer be used
    pub fn is_closed(&self) -> bool {
        matches!(self, BrokerError::Closed | BrokerError::ConsumerClosed | BrokerError::ProducerClosed(_))
    }
}
