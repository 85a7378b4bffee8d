use fleet_core::{InstanceId, LifecycleState};
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// No budget or no feasible node right now. Retried later.
    #[error("no capacity for {instance_id}: {message}")]
    Unavailable { instance_id: InstanceId, message: String },

    #[error("launch of {instance_id} failed: {message}")]
    Launch { instance_id: InstanceId, message: String },

    #[error("{operation} for {instance_id} failed: {message}")]
    Executor {
        instance_id: InstanceId,
        operation: &'static str,
        message: String,
    },

    #[error("instance {instance_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        instance_id: InstanceId,
        from: LifecycleState,
        to: LifecycleState,
    },

    /// The stop was requested but the process could not be confirmed gone.
    /// Its budget stays held until the process is reaped.
    #[error("stop of {instance_id} not confirmed: {message}")]
    StopUnconfirmed { instance_id: InstanceId, message: String },

    #[error("supervisor for {0} is gone")]
    SupervisorGone(InstanceId),
}
