use mesh_broker::BrokerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("{role} setup failed on {topic}: {source}")]
    Setup {
        role: &'static str,
        topic: String,
        #[source]
        source: BrokerError,
    },
}

impl RouterError {
    pub fn setup(role: &'static str, topic: impl Into<String>, source: BrokerError) -> Self {
        RouterError::Setup {
            role,
            topic: topic.into(),
            source,
        }
    }
}
