use std::time::Duration;

use mesh_common::{TopicNames, ROUTING_KEY};
use serde::{Deserialize, Serialize};

/// Settings shared by every role of the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub topics: TopicNames,
    /// Key stamped on every published message
    pub routing_key: String,
    pub service_url: String,
    /// Subscription names are `<prefix>-<role>`
    pub subscription_prefix: String,
    /// Pause between two originator sends
    pub originator_interval: Duration,
    /// Pause between two selector/destination receives
    pub relay_interval: Duration,
    /// Broker delay before a negatively acknowledged message comes back
    pub nack_redelivery_delay: Duration,
    /// Print a separator after each originator reply (local runs)
    pub local_mode: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            topics: TopicNames::default(),
            routing_key: ROUTING_KEY.to_string(),
            service_url: "memory://localhost:6650".to_string(),
            subscription_prefix: "mesh".to_string(),
            originator_interval: Duration::from_secs(1),
            relay_interval: Duration::from_millis(1),
            nack_redelivery_delay: Duration::from_secs(60),
            local_mode: false,
        }
    }
}

impl MeshConfig {
    pub fn subscription_name(&self, role: &str) -> String {
        format!("{}-{}", self.subscription_prefix, role)
    }
}
