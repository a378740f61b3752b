use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

use crate::Result;

/// Broker-assigned position of a message: ledger of the topic plus entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ledger_id, self.entry_id)
    }
}

/// Identifies one attached consumer on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    /// Exactly one consumer may be attached
    Exclusive,
    /// One active consumer, others stand by and take over on disconnect
    Failover,
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionMode::Exclusive => f.write_str("Exclusive"),
            SubscriptionMode::Failover => f.write_str("Failover"),
        }
    }
}

/// A message handed to the broker by a producer
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub key: String,
    pub sequence_id: u64,
    pub payload: Bytes,
}

/// A message as stored and delivered by the broker
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub key: String,
    pub sequence_id: u64,
    pub message_id: MessageId,
    pub publish_time: DateTime<Utc>,
    pub payload: Bytes,
    pub redelivery_count: u32,
}

/// A delivered message whose payload decodes to `T`
#[derive(Debug)]
pub struct Message<T> {
    raw: BrokerMessage,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Message<T> {
    pub fn new(raw: BrokerMessage) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.raw.topic
    }

    pub fn key(&self) -> &str {
        &self.raw.key
    }

    pub fn sequence_id(&self) -> u64 {
        self.raw.sequence_id
    }

    pub fn message_id(&self) -> MessageId {
        self.raw.message_id
    }

    pub fn publish_time(&self) -> DateTime<Utc> {
        self.raw.publish_time
    }

    pub fn redelivery_count(&self) -> u32 {
        self.raw.redelivery_count
    }

    pub fn payload(&self) -> &Bytes {
        &self.raw.payload
    }

    pub fn raw(&self) -> &BrokerMessage {
        &self.raw
    }
}

impl<T: DeserializeOwned> Message<T> {
    /// Decode the payload. Every call yields a fresh copy.
    pub fn value(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.raw.payload)?)
    }
}
