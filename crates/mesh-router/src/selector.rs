//! Selector - stateless parity router
//!
//! Consumes one topic through a failover subscription and republishes each
//! record unchanged to one of two targets. The choice depends on the record
//! id alone, so a redelivered record always takes the same route.

use std::fmt;
use std::sync::Arc;

use mesh_broker::{Broker, BrokerClient, Consumer, Message, Producer};
use mesh_common::Record;
use tracing::{error, info, warn};

use crate::config::MeshConfig;
use crate::error::RouterError;
use crate::publish::publish_record;
use crate::router_metrics;
use crate::throttle::Throttle;
use crate::Result;

const ROLE: &str = "selector";

/// Which of the two targets a record is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    One,
    Two,
}

impl Target {
    /// Odd ids go to the first target, everything else to the second
    pub fn for_id(id: i64) -> Self {
        if id % 2 == 1 {
            Target::One
        } else {
            Target::Two
        }
    }

    pub fn pick<'a>(&self, target_1: &'a str, target_2: &'a str) -> &'a str {
        match self {
            Target::One => target_1,
            Target::Two => target_2,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::One => f.write_str("one"),
            Target::Two => f.write_str("two"),
        }
    }
}

/// Topic a record with `id` is routed to
pub fn route_target<'a>(id: i64, target_1: &'a str, target_2: &'a str) -> &'a str {
    Target::for_id(id).pick(target_1, target_2)
}

// Release order follows field order: connection, producers, consumer
struct SelectorSession {
    client: BrokerClient,
    producer_1: Producer<Record>,
    producer_2: Producer<Record>,
    consumer: Consumer<Record>,
}

pub struct Selector {
    broker: Arc<dyn Broker>,
    config: Arc<MeshConfig>,
    throttle: Throttle,
}

impl Selector {
    pub fn new(broker: Arc<dyn Broker>, config: Arc<MeshConfig>, throttle: Throttle) -> Self {
        Self {
            broker,
            config,
            throttle,
        }
    }

    /// Route records from `source_topic` until shutdown or connection loss
    pub async fn process(&self, source_topic: &str, target_topic_1: &str, target_topic_2: &str) -> Result<()> {
        let session = match self.open_session(source_topic, target_topic_1, target_topic_2).await {
            Ok(session) => session,
            Err(e) => {
                error!(
                    source_topic = %source_topic,
                    target_topic_1 = %target_topic_1,
                    target_topic_2 = %target_topic_2,
                    error = %e,
                    "process(): setup failed"
                );
                return Err(e);
            }
        };

        info!(
            source_topic = %source_topic,
            target_topic_1 = %target_topic_1,
            target_topic_2 = %target_topic_2,
            "process(): selector started"
        );

        while self.throttle.sleep().await && !session.client.is_closed() {
            match session.consumer.receive().await {
                Ok(message) => self.select(&session, &message),
                Err(e) if e.is_closed() => {
                    info!(source_topic = %source_topic, "process(): connection closed");
                    break;
                }
                Err(e) => {
                    warn!(source_topic = %source_topic, error = %e, "process(): receive failed");
                }
            }
        }
        Ok(())
    }

    async fn open_session(&self, source_topic: &str, target_topic_1: &str, target_topic_2: &str) -> Result<SelectorSession> {
        let client = BrokerClient::open(self.broker.as_ref(), self.config.subscription_name(ROLE))
            .await
            .map_err(|e| RouterError::setup(ROLE, source_topic, e))?;
        let shutdown = self.throttle.shutdown().clone();
        client.close_when(async move { shutdown.wait().await });

        let consumer = client
            .create_consumer_with_failover::<Record>(source_topic)
            .await
            .map_err(|e| RouterError::setup(ROLE, source_topic, e))?;
        let producer_1 = client
            .create_producer::<Record>(target_topic_1)
            .await
            .map_err(|e| RouterError::setup(ROLE, target_topic_1, e))?;
        let producer_2 = client
            .create_producer::<Record>(target_topic_2)
            .await
            .map_err(|e| RouterError::setup(ROLE, target_topic_2, e))?;

        Ok(SelectorSession {
            client,
            producer_1,
            producer_2,
            consumer,
        })
    }

    fn select(&self, session: &SelectorSession, message: &Message<Record>) {
        if let Err(e) = self.route(session, message) {
            error!(
                topic = %message.topic(),
                key = %message.key(),
                sequence_id = message.sequence_id(),
                message_id = %message.message_id(),
                error = %e,
                "select(): routing failed, negative acknowledgment"
            );
            router_metrics::message_nacked(ROLE);
            if let Err(e) = session.consumer.negative_acknowledge(message) {
                warn!(message_id = %message.message_id(), error = %e, "select(): negative acknowledge failed");
            }
        }
    }

    fn route(&self, session: &SelectorSession, message: &Message<Record>) -> Result<Target> {
        let record = message.value()?;
        let target = Target::for_id(record.id);
        info!(
            topic = %message.topic(),
            key = %message.key(),
            sequence_id = message.sequence_id(),
            message_id = %message.message_id(),
            id = record.id,
            target = %target,
            "select(): routing"
        );

        let producer = match target {
            Target::One => &session.producer_1,
            Target::Two => &session.producer_2,
        };
        publish_record(producer, &self.config.routing_key, &record, ROLE);
        session.consumer.acknowledge(message)?;
        router_metrics::selector_routed(producer.topic());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_by_parity() {
        assert_eq!(Target::for_id(1), Target::One);
        assert_eq!(Target::for_id(3), Target::One);
        assert_eq!(Target::for_id(2), Target::Two);
        assert_eq!(Target::for_id(0), Target::Two);
        assert_eq!(Target::One.to_string(), "one");
    }

    #[test]
    fn test_route_target_is_pure() {
        for id in 1..50 {
            let first = route_target(id, "dest-1", "dest-2");
            let again = route_target(id, "dest-1", "dest-2");
            assert_eq!(first, again);
            assert_eq!(first == "dest-1", id % 2 == 1);
        }
    }
}
