//! Error types for budget operations.

use fleet_core::{InstanceId, NodeId};
use thiserror::Error;

use crate::report::BudgetReport;

pub type BudgetResult<T> = Result<T, BudgetError>;

#[derive(Debug, Error)]
pub enum BudgetError {
    /// Pre-flight validation failed. Never retried automatically.
    #[error("resource exhaustion:\n{0}")]
    ResourceExhaustion(Box<BudgetReport>),

    #[error("instance {instance_id} already holds a reservation on node {node_id}")]
    AlreadyAllocated { instance_id: InstanceId, node_id: NodeId },

    #[error(
        "node {node_id} cannot hold {requested_gb:.1}GB for {instance_id}: {free_gb:.1}GB free"
    )]
    InsufficientCapacity {
        node_id: NodeId,
        instance_id: InstanceId,
        requested_gb: f64,
        free_gb: f64,
    },

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("invalid reservation of {0}GB")]
    InvalidAmount(f64),
}
