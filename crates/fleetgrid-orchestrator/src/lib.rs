//! fleetgrid-orchestrator — the top-level FleetGrid coordinator.
//!
//! [`ClusterOrchestrator`] wires the budget ledger, the placement
//! scheduler, the remote executor, the watchdogs and one lifecycle
//! supervisor per instance into a single context, and runs the cluster
//! health loop.
//!
//! # Tasks
//!
//! - one supervisor per instance (`fleetgrid-lifecycle`)
//! - one watchdog loop per (target, metric) (`fleetgrid-watchdog`)
//! - one cluster health loop: node heartbeats and instance liveness
//! - one event router forwarding watchdog kills to supervisors

mod context;
pub mod error;
mod events;
pub mod health;
mod hooks;
pub mod orchestrator;
pub mod settings;
pub mod view;

pub use error::{OrchestratorError, OrchestratorResult};
pub use health::NodeHealthTracker;
pub use orchestrator::ClusterOrchestrator;
pub use settings::OrchestratorSettings;
pub use view::{InstanceStatus, NodeCheck, NodeStatus, SubmitOptions, SubmitReport};
