//! Reporter - read-only observer of the mesh topics
//!
//! Renders every record it sees through a `DisplaySink`. It never publishes
//! and acknowledges only to advance its own subscription.

use std::sync::Arc;

use mesh_broker::{Broker, BrokerClient, Consumer, ConsumerHandle, Message};
use mesh_common::Record;
use tracing::{error, info, warn};

use crate::config::MeshConfig;
use crate::error::RouterError;
use crate::originator::THIN_LINE;
use crate::router_metrics;
use crate::throttle::Throttle;
use crate::Result;

const ROLE: &str = "reporter";

/// Where rendered messages go
pub trait DisplaySink: Send + Sync {
    fn display(&self, rendered: &str);
}

/// Logs each rendered message at info level
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl DisplaySink for TracingSink {
    fn display(&self, rendered: &str) {
        info!("\n{}", rendered);
    }
}

/// Render a delivered record with its broker metadata
pub fn render_message(message: &Message<Record>, record: &Record) -> String {
    let mut lines = vec![
        THIN_LINE.to_string(),
        "message:".to_string(),
        format!("topic[{}],", message.topic()),
        format!(
            "key[{}], sequenceId[{}], messageId[{}],",
            message.key(),
            message.sequence_id(),
            message.message_id()
        ),
        format!("publishTime[{}] 'UTC'", message.publish_time().format("%H:%M:%S%.3f")),
        "information:".to_string(),
        format!(
            "- id[{}], label[{}], approvalStatus[{}],",
            record.id, record.label, record.approval_status
        ),
    ];

    for department in &record.departments {
        lines.push("- department:".to_string());
        lines.push(format!("- - id[{}], name[{}],", department.id, department.name));
        lines.push(format!(
            "- - budget[{}], createdAt[{}]",
            department.budget,
            department.created_at.format("%H:%M:%S%.3f")
        ));
        for employee in &department.employees {
            lines.push("- - employee:".to_string());
            lines.push(format!(
                "- - - id[{}], firstName[{}], lastName[{}], title[{}]",
                employee.id, employee.first_name, employee.last_name, employee.title
            ));
        }
    }

    lines.push(THIN_LINE.to_string());
    lines.join("\n")
}

struct ReporterSession {
    client: BrokerClient,
    consumers: Vec<Consumer<Record>>,
}

pub struct Reporter {
    broker: Arc<dyn Broker>,
    config: Arc<MeshConfig>,
    throttle: Throttle,
    sink: Arc<dyn DisplaySink>,
}

impl Reporter {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: Arc<MeshConfig>,
        throttle: Throttle,
        sink: Arc<dyn DisplaySink>,
    ) -> Self {
        Self {
            broker,
            config,
            throttle,
            sink,
        }
    }

    /// Observe `topics` until shutdown or connection loss
    pub async fn process(&self, topics: &[String]) -> Result<()> {
        let session = match self.open_session(topics).await {
            Ok(session) => session,
            Err(e) => {
                error!(topics = ?topics, error = %e, "process(): setup failed");
                return Err(e);
            }
        };

        info!(topics = ?topics, consumers = session.consumers.len(), "process(): reporter started");

        while self.throttle.sleep().await && !session.client.is_closed() {}
        Ok(())
    }

    async fn open_session(&self, topics: &[String]) -> Result<ReporterSession> {
        let first_topic = topics.first().map(String::as_str).unwrap_or_default();
        let client = BrokerClient::open(self.broker.as_ref(), self.config.subscription_name(ROLE))
            .await
            .map_err(|e| RouterError::setup(ROLE, first_topic, e))?;
        let shutdown = self.throttle.shutdown().clone();
        client.close_when(async move { shutdown.wait().await });

        let mut consumers = Vec::with_capacity(topics.len());
        for topic in topics {
            let consumer = client
                .create_consumer_with_listener(topic, report_listener(self.sink.clone()))
                .await
                .map_err(|e| RouterError::setup(ROLE, topic.as_str(), e))?;
            consumers.push(consumer);
        }

        Ok(ReporterSession { client, consumers })
    }
}

fn report_listener(sink: Arc<dyn DisplaySink>) -> impl Fn(&ConsumerHandle, Message<Record>) + Send + Sync + 'static {
    move |consumer: &ConsumerHandle, message: Message<Record>| match message.value() {
        Ok(record) => {
            sink.display(&render_message(&message, &record));
            router_metrics::reporter_rendered();
            if let Err(e) = consumer.acknowledge(&message) {
                warn!(message_id = %message.message_id(), error = %e, "report(): acknowledge failed");
            }
        }
        Err(e) => {
            error!(
                topic = %message.topic(),
                key = %message.key(),
                sequence_id = message.sequence_id(),
                message_id = %message.message_id(),
                error = %e,
                "report(): decoding failed, negative acknowledgment"
            );
            router_metrics::message_nacked(ROLE);
            if let Err(e) = consumer.negative_acknowledge(&message) {
                warn!(message_id = %message.message_id(), error = %e, "report(): negative acknowledge failed");
            }
        }
    }
}
