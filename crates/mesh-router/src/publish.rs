use mesh_broker::Producer;
use mesh_common::Record;
use tracing::{debug, error};

use crate::router_metrics;

/// Fire-and-forget publish. A failure is logged and counted, never retried.
pub(crate) fn publish_record(producer: &Producer<Record>, key: &str, record: &Record, role: &'static str) {
    let topic = producer.topic().to_string();
    let routing_key = key.to_string();
    let record_id = record.id;
    producer.send_async(key, record, move |result| match result {
        Ok(message_id) => {
            debug!(role = role, topic = %topic, message_id = %message_id, "send_completed(): published");
        }
        Err(e) => {
            error!(
                role = role,
                topic = %topic,
                key = %routing_key,
                record_id = record_id,
                error = %e,
                "send_completed(): publish failed"
            );
            router_metrics::publish_failed(role);
        }
    });
}
