//! Parity Mesh Local Launcher
//!
//! Runs the routing mesh against the embedded broker:
//! - `mesh`: destinations, selectors, and the ODD and EVEN originators
//! - `all`: mesh and reporter in one process
//!
//! `reporter` alone is refused: the embedded broker is private to this
//! process, so a lone reporter would have no traffic to observe.
//! - Optional Prometheus metrics endpoint

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mesh_broker::{Broker, InMemoryBroker, InMemoryBrokerConfig};
use mesh_common::{TopicNames, ROUTING_KEY};
use mesh_router::{MeshConfig, MeshRuntime, RunMode, TracingSink};

/// Parity Mesh local runner
#[derive(Parser, Debug)]
#[command(name = "mesh-local")]
#[command(about = "Parity routing mesh - runs the roles against the embedded broker")]
struct Args {
    /// Roles to run: mesh, all
    #[arg(long, env = "MESH_MODE", default_value = "all")]
    mode: RunMode,

    /// Broker service URL
    #[arg(long, env = "MESH_SERVICE_URL", default_value = "memory://localhost:6650")]
    service_url: String,

    /// Subscription name prefix
    #[arg(long, env = "MESH_SUBSCRIPTION_PREFIX", default_value = "mesh")]
    subscription_prefix: String,

    /// Pause between originator sends in milliseconds
    #[arg(long, env = "MESH_ORIGINATOR_INTERVAL_MS", default_value = "1000")]
    originator_interval_ms: u64,

    /// Pause between selector/destination receives in milliseconds
    #[arg(long, env = "MESH_RELAY_INTERVAL_MS", default_value = "1")]
    relay_interval_ms: u64,

    /// Delay before a negatively acknowledged message is redelivered, in seconds
    #[arg(long, env = "MESH_NACK_REDELIVERY_DELAY_SECS", default_value = "60")]
    nack_redelivery_delay_secs: u64,

    /// Messages retained per topic for late subscriptions
    #[arg(long, env = "MESH_RETENTION_LIMIT", default_value = "10000")]
    retention_limit: usize,

    /// Expose Prometheus metrics on this port
    #[arg(long, env = "MESH_METRICS_PORT")]
    metrics_port: Option<u16>,
}

impl Args {
    fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            topics: TopicNames::default(),
            routing_key: ROUTING_KEY.to_string(),
            service_url: self.service_url.clone(),
            subscription_prefix: self.subscription_prefix.clone(),
            originator_interval: Duration::from_millis(self.originator_interval_ms),
            relay_interval: Duration::from_millis(self.relay_interval_ms),
            nack_redelivery_delay: Duration::from_secs(self.nack_redelivery_delay_secs),
            local_mode: true,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    check_mode(args.mode)?;
    let config = Arc::new(args.mesh_config());

    info!(mode = %args.mode, service_url = %config.service_url, "Starting Parity Mesh");

    if let Some(port) = args.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(port = port, "Metrics endpoint listening");
    }

    let broker = Arc::new(InMemoryBroker::new(InMemoryBrokerConfig {
        service_url: config.service_url.clone(),
        nack_redelivery_delay: config.nack_redelivery_delay,
        retention_limit: args.retention_limit,
    }));
    let broker_handle: Arc<dyn Broker> = broker.clone();

    let runtime = MeshRuntime::start(broker_handle, config.clone(), args.mode, Arc::new(TracingSink));

    shutdown_signal().await;
    info!("Shutdown signal received");

    runtime.shutdown().await;
    broker.shutdown();

    info!("Parity Mesh shutdown complete");
    Ok(())
}

/// Reject modes that cannot do anything against a process-private broker
fn check_mode(mode: RunMode) -> Result<()> {
    if mode == RunMode::Reporter {
        anyhow::bail!(
            "reporter-only mode needs a broker shared with a running mesh; \
             the embedded broker is private to this process, use --mode all"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
