//! Originator - emits parity-partitioned requests and consumes their replies
//!
//! - Each instance is bound to one `Marker` and one random label for life
//! - Ids are strictly increasing and never leave the marker's parity class
//! - Replies arrive on the instance's own origin topic through a listener

use std::sync::Arc;

use mesh_broker::{Broker, BrokerClient, Consumer, ConsumerHandle, Message, Producer};
use mesh_common::{create_label, fixture_departments, Marker, Record};
use tracing::{error, info, trace, warn};

use crate::config::MeshConfig;
use crate::error::RouterError;
use crate::publish::publish_record;
use crate::router_metrics;
use crate::throttle::Throttle;
use crate::Result;

pub(crate) const THIN_LINE: &str = "- - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - -";

const ROLE: &str = "originator";

/// Id generator bound to one parity class
#[derive(Debug, Clone)]
pub struct IdSequence {
    marker: Marker,
    counter: i64,
}

impl IdSequence {
    pub fn new(marker: Marker) -> Self {
        Self { marker, counter: 0 }
    }

    pub fn marker(&self) -> Marker {
        self.marker
    }

    /// Advance to the next id of the bound parity class
    pub fn next_id(&mut self) -> i64 {
        let on_own_parity = match self.marker {
            Marker::Odd => self.counter % 2 == 1,
            Marker::Even => self.counter % 2 == 0,
        };
        if on_own_parity {
            self.counter += 1;
        }
        self.counter += 1;
        self.counter
    }
}

// Release order follows field order: connection, producer, consumer
struct OriginatorSession {
    client: BrokerClient,
    producer: Producer<Record>,
    consumer: Consumer<Record>,
}

pub struct Originator {
    label: String,
    ids: IdSequence,
    broker: Arc<dyn Broker>,
    config: Arc<MeshConfig>,
    throttle: Throttle,
}

impl Originator {
    pub fn new(marker: Marker, broker: Arc<dyn Broker>, config: Arc<MeshConfig>, throttle: Throttle) -> Self {
        Self {
            label: create_label(),
            ids: IdSequence::new(marker),
            broker,
            config,
            throttle,
        }
    }

    pub fn marker(&self) -> Marker {
        self.ids.marker()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Send requests until shutdown while consuming replies from `response_topic`.
    ///
    /// Setup failures are logged and returned; they are not retried.
    pub async fn process(&mut self, response_topic: &str) -> Result<()> {
        let session = match self.open_session(response_topic).await {
            Ok(session) => session,
            Err(e) => {
                error!(
                    response_topic = %response_topic,
                    marker = %self.marker(),
                    error = %e,
                    "process(): setup failed"
                );
                return Err(e);
            }
        };

        info!(
            response_topic = %response_topic,
            marker = %self.marker(),
            label = %self.label,
            "process(): originator started"
        );

        loop {
            if session.client.is_closed() {
                info!(marker = %self.marker(), "process(): connection closed");
                break;
            }
            self.send_message(&session.producer);
            if !self.throttle.sleep().await {
                break;
            }
        }

        trace!(consumer = %session.consumer.name(), "process(): releasing session");
        Ok(())
    }

    async fn open_session(&self, response_topic: &str) -> Result<OriginatorSession> {
        let select_destination = self.config.topics.select_destination.as_str();

        let client = BrokerClient::open(self.broker.as_ref(), self.config.subscription_name(ROLE))
            .await
            .map_err(|e| RouterError::setup(ROLE, response_topic, e))?;
        let shutdown = self.throttle.shutdown().clone();
        client.close_when(async move { shutdown.wait().await });

        let producer = client
            .create_producer::<Record>(select_destination)
            .await
            .map_err(|e| RouterError::setup(ROLE, select_destination, e))?;
        let consumer = client
            .create_consumer_with_listener(response_topic, reply_listener(self.config.local_mode))
            .await
            .map_err(|e| RouterError::setup(ROLE, response_topic, e))?;

        Ok(OriginatorSession {
            client,
            producer,
            consumer,
        })
    }

    /// Publish the next request; returns its id
    pub(crate) fn send_message(&mut self, producer: &Producer<Record>) -> i64 {
        let id = self.ids.next_id();
        let record = Record::new(id, self.label.clone(), fixture_departments());
        publish_record(producer, &self.config.routing_key, &record, ROLE);
        router_metrics::originator_sent();
        info!(marker = %self.marker(), id = id, label = %self.label, "send_message(): sent");
        id
    }
}

fn reply_listener(local_mode: bool) -> impl Fn(&ConsumerHandle, Message<Record>) + Send + Sync + 'static {
    move |consumer: &ConsumerHandle, message: Message<Record>| {
        receive(consumer, &message);
        if local_mode {
            info!("\n{}", THIN_LINE);
        }
    }
}

fn receive(consumer: &ConsumerHandle, message: &Message<Record>) {
    match message.value() {
        Ok(record) => {
            info!(
                topic = %message.topic(),
                key = %message.key(),
                sequence_id = message.sequence_id(),
                message_id = %message.message_id(),
                id = record.id,
                status = %record.approval_status,
                "receive(): reply received"
            );
            router_metrics::originator_received();
            if let Err(e) = consumer.acknowledge(message) {
                warn!(message_id = %message.message_id(), error = %e, "receive(): acknowledge failed");
            }
        }
        Err(e) => {
            error!(
                topic = %message.topic(),
                key = %message.key(),
                sequence_id = message.sequence_id(),
                message_id = %message.message_id(),
                error = %e,
                "receive(): processing failed, negative acknowledgment"
            );
            router_metrics::message_nacked(ROLE);
            if let Err(e) = consumer.negative_acknowledge(message) {
                warn!(message_id = %message.message_id(), error = %e, "receive(): negative acknowledge failed");
            }
        }
    }
}
