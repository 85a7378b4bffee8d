//! Orchestrator error types.

use fleet_core::{ConfigError, InstanceId, NodeId};
use fleetgrid_budget::{BudgetError, BudgetReport};
use fleetgrid_executor::ExecutorError;
use fleetgrid_lifecycle::LifecycleError;
use fleetgrid_placement::PlacementFailure;
use fleetgrid_state::StateError;
use thiserror::Error;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Pre-flight budget validation failed. Nothing was started.
    #[error("resource exhaustion:\n{0}")]
    ResourceExhaustion(Box<BudgetReport>),

    /// At least one instance has no feasible node. Nothing was started.
    #[error("placement infeasible:\n{}", format_failures(.0))]
    PlacementInfeasible(Vec<PlacementFailure>),

    #[error("instance {0} submitted twice")]
    DuplicateInstance(InstanceId),

    #[error("instance {0} is already managed")]
    AlreadyManaged(InstanceId),

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_failures(failures: &[PlacementFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
