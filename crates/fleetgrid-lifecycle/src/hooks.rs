//! Side effects a supervisor needs from the rest of the cluster.

use async_trait::async_trait;
use fleet_core::{CrashReason, ExitOutcome, InstanceRuntimeState, NodeId, ProcessHandle};

use crate::error::LifecycleResult;

/// Budget held for one launch.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub node_id: NodeId,
    pub ram_gb: f64,
}

#[async_trait]
pub trait InstanceHooks: Send + Sync {
    /// Re-validate budget and reserve it, preferring `previous_node`.
    ///
    /// `Unavailable` means "try again later"; the instance stays RESURRECTING.
    async fn reserve(
        &self,
        instance_id: &str,
        previous_node: Option<&str>,
    ) -> LifecycleResult<Reservation>;

    async fn launch(
        &self,
        instance_id: &str,
        reservation: &Reservation,
        generation: u64,
    ) -> LifecycleResult<ProcessHandle>;

    /// Whether the launched process survived its startup grace period.
    async fn confirm_alive(&self, handle: &ProcessHandle) -> LifecycleResult<bool>;

    /// Resolve once the process exits. An error means the outcome can no
    /// longer be observed.
    async fn wait_exit(&self, handle: &ProcessHandle) -> LifecycleResult<ExitOutcome>;

    /// Attach watchdogs to a confirmed process.
    async fn attach(&self, handle: &ProcessHandle, ram_gb: f64);

    async fn detach(&self, instance_id: &str);

    /// Graceful stop for an explicit stop request.
    async fn terminate(&self, handle: &ProcessHandle) -> LifecycleResult<()>;

    /// Make sure a crashed process is really gone.
    async fn reap(&self, handle: &ProcessHandle) -> LifecycleResult<()>;

    async fn release(&self, instance_id: &str);

    /// Keep the budget of a process whose termination could not be
    /// confirmed, apart from the instance, until that process is reaped.
    /// Replaces `release` for that process.
    async fn hold(&self, handle: &ProcessHandle);

    async fn record_crash(
        &self,
        instance_id: &str,
        node_id: Option<&str>,
        reason: &CrashReason,
        crash_count: u32,
    );

    async fn persist(&self, state: &InstanceRuntimeState);
}
