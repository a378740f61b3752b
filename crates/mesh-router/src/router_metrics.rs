//! Counters emitted by the mesh roles

use metrics::counter;

pub fn originator_sent() {
    counter!("mesh_originator_sent_total").increment(1);
}

pub fn originator_received() {
    counter!("mesh_originator_received_total").increment(1);
}

pub fn selector_routed(target: &str) {
    counter!("mesh_selector_routed_total", "target" => target.to_string()).increment(1);
}

pub fn destination_processed(status: &'static str) {
    counter!("mesh_destination_processed_total", "status" => status).increment(1);
}

pub fn message_nacked(role: &'static str) {
    counter!("mesh_messages_nacked_total", "role" => role).increment(1);
}

pub fn publish_failed(role: &'static str) {
    counter!("mesh_publish_failed_total", "role" => role).increment(1);
}

pub fn reporter_rendered() {
    counter!("mesh_reporter_rendered_total").increment(1);
}
