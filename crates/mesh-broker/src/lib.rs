//! Parity Mesh Broker Access
//!
//! This crate provides broker connectivity for the mesh roles with:
//! - Transport: the `Broker` / `Connection` seam a concrete broker implements
//! - InMemoryBroker: embedded broker with durable exclusive and failover subscriptions
//! - BrokerClient: scoped connection helper creating typed producers and consumers
//! - Message: delivered message with metadata and on-demand payload decoding

pub mod error;
pub mod message;
pub mod transport;
pub mod memory;
pub mod client;

pub use error::BrokerError;
pub use message::{BrokerMessage, ConsumerId, Message, MessageId, OutgoingMessage, SubscriptionMode};
pub use transport::{Broker, Connection};
pub use memory::{InMemoryBroker, InMemoryBrokerConfig};
pub use client::{BrokerClient, Consumer, ConsumerHandle, Producer, SendCallback};

pub type Result<T> = std::result::Result<T, BrokerError>;
