//! Mesh Runtime - spawns the roles of the fixed topology and stops them
//!
//! - `Mesh`: two destinations, two selectors, an ODD and an EVEN originator
//! - `Reporter`: the reporter alone
//! - `All`: both in one process

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use mesh_broker::Broker;
use mesh_common::Marker;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::MeshConfig;
use crate::destination::Destination;
use crate::originator::Originator;
use crate::reporter::{DisplaySink, Reporter};
use crate::selector::Selector;
use crate::throttle::{Shutdown, Throttle};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Mesh,
    Reporter,
    All,
}

impl RunMode {
    fn runs_mesh(&self) -> bool {
        matches!(self, RunMode::Mesh | RunMode::All)
    }

    fn runs_reporter(&self) -> bool {
        matches!(self, RunMode::Reporter | RunMode::All)
    }
}

#[derive(Debug, Error)]
#[error("Unknown run mode '{0}', expected one of: mesh, reporter, all")]
pub struct ParseRunModeError(String);

impl FromStr for RunMode {
    type Err = ParseRunModeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mesh" => Ok(RunMode::Mesh),
            "reporter" => Ok(RunMode::Reporter),
            "all" => Ok(RunMode::All),
            _ => Err(ParseRunModeError(s.to_string())),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Mesh => f.write_str("mesh"),
            RunMode::Reporter => f.write_str("reporter"),
            RunMode::All => f.write_str("all"),
        }
    }
}

/// Handles of the running role tasks
pub struct MeshRuntime {
    shutdown: Shutdown,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl MeshRuntime {
    pub fn start(
        broker: Arc<dyn Broker>,
        config: Arc<MeshConfig>,
        mode: RunMode,
        sink: Arc<dyn DisplaySink>,
    ) -> Self {
        let mut runtime = Self {
            shutdown: Shutdown::new(),
            tasks: Vec::new(),
        };

        if mode.runs_reporter() {
            runtime.spawn_reporter(&broker, &config, sink);
        }
        if mode.runs_mesh() {
            runtime.spawn_mesh(&broker, &config);
        }

        info!(mode = %mode, roles = runtime.tasks.len(), "Mesh runtime started");
        runtime
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn role_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn relay_throttle(&self, config: &MeshConfig) -> Throttle {
        Throttle::new(config.relay_interval, self.shutdown.clone())
    }

    fn originator_throttle(&self, config: &MeshConfig) -> Throttle {
        Throttle::new(config.originator_interval, self.shutdown.clone())
    }

    fn spawn_reporter(&mut self, broker: &Arc<dyn Broker>, config: &Arc<MeshConfig>, sink: Arc<dyn DisplaySink>) {
        let reporter = Reporter::new(broker.clone(), config.clone(), self.originator_throttle(config), sink);
        let topics: Vec<String> = config.topics.all().iter().map(|t| t.to_string()).collect();
        self.tasks.push((
            "reporter".to_string(),
            tokio::spawn(async move { reporter.process(&topics).await }),
        ));
    }

    fn spawn_mesh(&mut self, broker: &Arc<dyn Broker>, config: &Arc<MeshConfig>) {
        let topics = &config.topics;

        for (n, consumer_topic) in [&topics.destination_1, &topics.destination_2].into_iter().enumerate() {
            let mut destination = Destination::new(broker.clone(), config.clone(), self.relay_throttle(config));
            let consumer_topic = consumer_topic.clone();
            self.tasks.push((
                format!("destination-{}", n + 1),
                tokio::spawn(async move { destination.process(&consumer_topic).await }),
            ));
        }

        let routes = [
            ("selector-origin", &topics.select_origin, &topics.origin_1, &topics.origin_2),
            (
                "selector-destination",
                &topics.select_destination,
                &topics.destination_1,
                &topics.destination_2,
            ),
        ];
        for (name, source, target_1, target_2) in routes {
            let selector = Selector::new(broker.clone(), config.clone(), self.relay_throttle(config));
            let (source, target_1, target_2) = (source.clone(), target_1.clone(), target_2.clone());
            self.tasks.push((
                name.to_string(),
                tokio::spawn(async move { selector.process(&source, &target_1, &target_2).await }),
            ));
        }

        for (marker, response_topic) in [(Marker::Odd, &topics.origin_1), (Marker::Even, &topics.origin_2)] {
            let mut originator = Originator::new(marker, broker.clone(), config.clone(), self.originator_throttle(config));
            let response_topic = response_topic.clone();
            self.tasks.push((
                format!("originator-{}", marker.to_string().to_lowercase()),
                tokio::spawn(async move { originator.process(&response_topic).await }),
            ));
        }
    }

    /// Signal every role to stop and wait for all of them
    pub async fn shutdown(self) {
        info!("Mesh runtime shutting down");
        self.shutdown.trigger();

        for (name, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => info!(role = %name, "Role stopped"),
                Ok(Err(e)) => error!(role = %name, error = %e, "Role stopped with setup failure"),
                Err(e) => error!(role = %name, error = %e, "Role task panicked"),
            }
        }
        info!("Mesh runtime stopped");
    }
}
