//! Error types for executor operations.

use std::time::Duration;

use fleet_core::NodeId;
use thiserror::Error;

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The node could not be reached. Retried with backoff by callers.
    #[error("node {node_id} unreachable: {message}")]
    Connection { node_id: NodeId, message: String },

    #[error("{operation} on node {node_id} timed out after {after:?}")]
    Timeout {
        node_id: NodeId,
        operation: &'static str,
        after: Duration,
    },

    #[error("command on node {node_id} failed ({status}): {stderr}")]
    CommandFailed {
        node_id: NodeId,
        status: String,
        stderr: String,
    },

    #[error("failed to spawn worker {instance_id}: {message}")]
    Spawn { instance_id: String, message: String },

    /// SIGKILL was sent but the process never disappeared.
    #[error("pid {pid} on node {node_id} still alive after SIGKILL")]
    StillAlive { node_id: NodeId, pid: u32 },

    #[error("deploy to node {node_id} failed: {message}")]
    Deploy { node_id: NodeId, message: String },

    #[error("unexpected output from node {node_id}: {output}")]
    Parse { node_id: NodeId, output: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Whether the failure says something about node reachability.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ExecutorError::Connection { .. } | ExecutorError::Timeout { .. })
    }
}
