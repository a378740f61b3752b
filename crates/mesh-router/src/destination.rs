//! Destination - alternates the approval status of each request and replies
//!
//! The first successfully decoded record is `REJECTED`, the next `APPROVED`,
//! and so on. A record that fails to decode is negatively acknowledged and
//! does not advance the alternation.

use std::sync::Arc;

use mesh_broker::{Broker, BrokerClient, Consumer, Message, Producer};
use mesh_common::{ApprovalStatus, Record};
use tracing::{error, info, warn};

use crate::config::MeshConfig;
use crate::error::RouterError;
use crate::publish::publish_record;
use crate::router_metrics;
use crate::throttle::Throttle;
use crate::Result;

const ROLE: &str = "destination";

/// Strict `REJECTED, APPROVED, ...` alternation owned by one destination
#[derive(Debug, Clone, Default)]
pub struct ApprovalAlternator {
    approve_next: bool,
}

impl ApprovalAlternator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status for the next record, then flip
    pub fn next_status(&mut self) -> ApprovalStatus {
        let status = if self.approve_next {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        self.approve_next = !self.approve_next;
        status
    }
}

// Release order follows field order: connection, producer, consumer
struct DestinationSession {
    client: BrokerClient,
    producer: Producer<Record>,
    consumer: Consumer<Record>,
}

pub struct Destination {
    alternator: ApprovalAlternator,
    broker: Arc<dyn Broker>,
    config: Arc<MeshConfig>,
    throttle: Throttle,
}

impl Destination {
    pub fn new(broker: Arc<dyn Broker>, config: Arc<MeshConfig>, throttle: Throttle) -> Self {
        Self {
            alternator: ApprovalAlternator::new(),
            broker,
            config,
            throttle,
        }
    }

    /// Answer requests from `consumer_topic` until shutdown or connection loss
    pub async fn process(&mut self, consumer_topic: &str) -> Result<()> {
        let session = match self.open_session(consumer_topic).await {
            Ok(session) => session,
            Err(e) => {
                error!(consumer_topic = %consumer_topic, error = %e, "process(): setup failed");
                return Err(e);
            }
        };

        info!(consumer_topic = %consumer_topic, "process(): destination started");

        while self.throttle.sleep().await && !session.client.is_closed() {
            match session.consumer.receive().await {
                Ok(message) => self.receive_and_respond(&session, &message),
                Err(e) if e.is_closed() => {
                    info!(consumer_topic = %consumer_topic, "process(): connection closed");
                    break;
                }
                Err(e) => {
                    warn!(consumer_topic = %consumer_topic, error = %e, "process(): receive failed");
                }
            }
        }
        Ok(())
    }

    async fn open_session(&self, consumer_topic: &str) -> Result<DestinationSession> {
        let select_origin = self.config.topics.select_origin.as_str();

        let client = BrokerClient::open(self.broker.as_ref(), self.config.subscription_name(ROLE))
            .await
            .map_err(|e| RouterError::setup(ROLE, consumer_topic, e))?;
        let shutdown = self.throttle.shutdown().clone();
        client.close_when(async move { shutdown.wait().await });

        let consumer = client
            .create_consumer::<Record>(consumer_topic)
            .await
            .map_err(|e| RouterError::setup(ROLE, consumer_topic, e))?;
        let producer = client
            .create_producer::<Record>(select_origin)
            .await
            .map_err(|e| RouterError::setup(ROLE, select_origin, e))?;

        Ok(DestinationSession {
            client,
            producer,
            consumer,
        })
    }

    fn receive_and_respond(&mut self, session: &DestinationSession, message: &Message<Record>) {
        if let Err(e) = self.respond(session, message) {
            error!(
                topic = %message.topic(),
                key = %message.key(),
                sequence_id = message.sequence_id(),
                message_id = %message.message_id(),
                error = %e,
                "receive_and_respond(): processing failed, negative acknowledgment"
            );
            router_metrics::message_nacked(ROLE);
            if let Err(e) = session.consumer.negative_acknowledge(message) {
                warn!(message_id = %message.message_id(), error = %e, "receive_and_respond(): negative acknowledge failed");
            }
        }
    }

    fn respond(&mut self, session: &DestinationSession, message: &Message<Record>) -> Result<ApprovalStatus> {
        let mut record = message.value()?;
        info!(
            topic = %message.topic(),
            key = %message.key(),
            sequence_id = message.sequence_id(),
            message_id = %message.message_id(),
            id = record.id,
            "receive_and_respond(): request received"
        );

        let status = self.alternator.next_status();
        record.approval_status = status;
        publish_record(&session.producer, &self.config.routing_key, &record, ROLE);
        session.consumer.acknowledge(message)?;
        router_metrics::destination_processed(status.as_str());
        Ok(status)
    }
}
