//! fleetgrid-executor — runs things on cluster nodes.
//!
//! [`RemoteExecutor`] is the only way the rest of FleetGrid touches a node:
//! bundle deployment, worker start and stop, liveness checks, resource
//! sampling and log streaming. [`LocalExecutor`] drives processes on this
//! host, [`SshExecutor`] drives them through the system `ssh` binary and
//! [`RoutingExecutor`] picks between the two per node.

pub mod deploy;
pub mod error;
pub mod executor;
pub mod local;
pub mod logs;
pub mod router;
pub mod ssh;

pub use deploy::sync_tree;
pub use error::{ExecutorError, ExecutorResult};
pub use executor::{
    DeployReport, LogStream, NodeHealthReport, RemoteExecutor, Signal, StopOutcome, unit_name,
    wait_until_dead, worker_env,
};
pub use local::LocalExecutor;
pub use logs::follow_command;
pub use router::RoutingExecutor;
pub use ssh::{SshExecutor, shell_quote};
