//! Parity Mesh Router
//!
//! This crate provides the roles of the parity routing mesh with:
//! - Originator: parity-partitioned id sequence, publishes requests, consumes replies
//! - Selector: stateless router from one topic to one of two targets by id parity
//! - Destination: alternates approval status and republishes as a reply
//! - Reporter: read-only observer rendering records through a display sink
//! - MeshRuntime: spawns the fixed topology and coordinates shutdown

pub mod error;
pub mod config;
pub mod throttle;
pub mod originator;
pub mod selector;
pub mod destination;
pub mod reporter;
pub mod mesh;
pub mod router_metrics;
mod publish;

pub use error::RouterError;
pub use config::MeshConfig;
pub use throttle::{Shutdown, Throttle};
pub use originator::{IdSequence, Originator};
pub use selector::{route_target, Selector, Target};
pub use destination::{ApprovalAlternator, Destination};
pub use reporter::{render_message, DisplaySink, Reporter, TracingSink};
pub use mesh::{MeshRuntime, ParseRunModeError, RunMode};

pub type Result<T> = std::result::Result<T, RouterError>;
