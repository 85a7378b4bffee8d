//! Lifecycle side effects, wired to the real components.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{CrashReason, ExitOutcome, InstanceRuntimeState, Node, ProcessHandle};
use fleetgrid_budget::BudgetRequest;
use fleetgrid_executor::{ExecutorError, StopOutcome, worker_env};
use fleetgrid_lifecycle::{InstanceHooks, LifecycleError, LifecycleResult, Reservation};
use fleetgrid_placement::{PlacementRequest, check_feasible, compute_placement};
use fleetgrid_watchdog::{InstanceTarget, WatchdogMonitor};
use tracing::{debug, error, info, warn};

use crate::context::{Cluster, hold_key};

pub(crate) struct ClusterHooks {
    cluster: Arc<Cluster>,
    watchdogs: Arc<WatchdogMonitor>,
}

impl ClusterHooks {
    pub fn new(cluster: Arc<Cluster>, watchdogs: Arc<WatchdogMonitor>) -> Self {
        Self { cluster, watchdogs }
    }

    async fn node_of(&self, instance_id: &str, node_id: &str) -> LifecycleResult<Node> {
        self.cluster
            .node(node_id)
            .await
            .ok_or_else(|| LifecycleError::Executor {
                instance_id: instance_id.to_string(),
                operation: "node lookup",
                message: format!("unknown node {node_id}"),
            })
    }
}

fn executor_error(instance_id: &str, operation: &'static str, e: ExecutorError) -> LifecycleError {
    LifecycleError::Executor {
        instance_id: instance_id.to_string(),
        operation,
        message: e.to_string(),
    }
}

fn unavailable(instance_id: &str, message: impl Into<String>) -> LifecycleError {
    LifecycleError::Unavailable {
        instance_id: instance_id.to_string(),
        message: message.into(),
    }
}

#[async_trait]
impl InstanceHooks for ClusterHooks {
    /// Same node if it still fits, otherwise a fresh placement.
    async fn reserve(
        &self,
        instance_id: &str,
        previous_node: Option<&str>,
    ) -> LifecycleResult<Reservation> {
        let spec = self
            .cluster
            .spec(instance_id)
            .await
            .ok_or_else(|| unavailable(instance_id, "spec no longer known"))?;
        let overhead = self.cluster.settings.budget.overhead_factor;
        let required_gb = BudgetRequest::from_spec(&spec).required_gb(overhead);

        let _guard = self.cluster.placement_lock.lock().await;
        let candidates = self.cluster.candidates().await;

        let same_node = previous_node.and_then(|prev| {
            let candidate = candidates.iter().find(|c| c.node_id == prev)?;
            match check_feasible(&spec, required_gb, candidate) {
                Ok(()) => Some(prev.to_string()),
                Err(reason) => {
                    debug!(%instance_id, node = %prev, %reason, "previous node no longer fits");
                    None
                }
            }
        });

        let node_id = match same_node {
            Some(node_id) => node_id,
            None => {
                let request = PlacementRequest {
                    spec: spec.clone(),
                    required_gb,
                };
                let plan = compute_placement(
                    &[request],
                    &candidates,
                    &BTreeMap::new(),
                    &self.cluster.settings.weights,
                );
                match plan.node_for(instance_id) {
                    Some(node_id) => node_id.to_string(),
                    None => {
                        let message = plan
                            .failures
                            .first()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "no feasible node".to_string());
                        return Err(unavailable(instance_id, message));
                    }
                }
            }
        };

        self.cluster
            .budget
            .allocate(instance_id, &node_id, required_gb)
            .map_err(|e| unavailable(instance_id, e.to_string()))?;
        if previous_node.is_some_and(|prev| prev != node_id) {
            info!(%instance_id, from = previous_node.unwrap_or("-"), to = %node_id, "instance relocated");
        }
        Ok(Reservation {
            node_id,
            ram_gb: required_gb,
        })
    }

    async fn launch(
        &self,
        instance_id: &str,
        reservation: &Reservation,
        generation: u64,
    ) -> LifecycleResult<ProcessHandle> {
        let spec = self
            .cluster
            .spec(instance_id)
            .await
            .ok_or_else(|| LifecycleError::Launch {
                instance_id: instance_id.to_string(),
                message: "spec no longer known".to_string(),
            })?;
        let node = self.node_of(instance_id, &reservation.node_id).await?;
        let env = worker_env(&spec, &node, reservation.ram_gb);
        self.cluster
            .executor
            .start(&node, &spec, &env, generation)
            .await
            .map_err(|e| LifecycleError::Launch {
                instance_id: instance_id.to_string(),
                message: e.to_string(),
            })
    }

    async fn confirm_alive(&self, handle: &ProcessHandle) -> LifecycleResult<bool> {
        let node = self.node_of(&handle.instance_id, &handle.node_id).await?;
        self.cluster
            .executor
            .is_alive(&node, handle.pid)
            .await
            .map_err(|e| executor_error(&handle.instance_id, "liveness check", e))
    }

    async fn wait_exit(&self, handle: &ProcessHandle) -> LifecycleResult<ExitOutcome> {
        let node = self.node_of(&handle.instance_id, &handle.node_id).await?;
        self.cluster
            .executor
            .wait_exit(&node, handle)
            .await
            .map_err(|e| executor_error(&handle.instance_id, "wait for exit", e))
    }

    async fn attach(&self, handle: &ProcessHandle, ram_gb: f64) {
        let Some(node) = self.cluster.node(&handle.node_id).await else {
            return;
        };
        let gpu = self
            .cluster
            .spec(&handle.instance_id)
            .await
            .is_some_and(|spec| spec.gpu_required)
            && node.gpu_available;
        self.watchdogs
            .watch_instance(InstanceTarget {
                instance_id: handle.instance_id.clone(),
                generation: handle.generation,
                node,
                pid: handle.pid,
                ram_allocated_gb: ram_gb,
                gpu,
            })
            .await;
    }

    async fn detach(&self, instance_id: &str) {
        self.watchdogs.unwatch_instance(instance_id).await;
    }

    async fn terminate(&self, handle: &ProcessHandle) -> LifecycleResult<()> {
        let node = self.node_of(&handle.instance_id, &handle.node_id).await?;
        let timeout = self.cluster.settings.executor.stop_timeout;
        let outcome = self
            .cluster
            .executor
            .stop(&node, handle, timeout)
            .await
            .map_err(|e| executor_error(&handle.instance_id, "stop", e))?;
        if outcome == StopOutcome::Forced {
            warn!(instance_id = %handle.instance_id, pid = handle.pid, "worker needed SIGKILL");
        }
        Ok(())
    }

    async fn reap(&self, handle: &ProcessHandle) -> LifecycleResult<()> {
        let node = self.node_of(&handle.instance_id, &handle.node_id).await?;
        let alive = self
            .cluster
            .executor
            .is_alive(&node, handle.pid)
            .await
            .map_err(|e| executor_error(&handle.instance_id, "liveness check", e))?;
        if alive {
            info!(instance_id = %handle.instance_id, pid = handle.pid, "stopping orphaned worker");
            self.terminate(handle).await?;
        }
        Ok(())
    }

    async fn release(&self, instance_id: &str) {
        self.cluster.budget.deallocate(instance_id);
    }

    async fn hold(&self, handle: &ProcessHandle) {
        let key = hold_key(handle);
        match self.cluster.budget.hold(&handle.instance_id, &key) {
            Some((node, gb)) => warn!(
                instance_id = %handle.instance_id,
                %node,
                pid = handle.pid,
                generation = handle.generation,
                ram_gb = gb,
                "budget held until the process is reaped"
            ),
            None => debug!(instance_id = %handle.instance_id, "no reservation to hold"),
        }
        self.cluster.held.lock().await.insert(key, handle.clone());
    }

    async fn record_crash(
        &self,
        instance_id: &str,
        node_id: Option<&str>,
        reason: &CrashReason,
        crash_count: u32,
    ) {
        if let Err(e) = self
            .cluster
            .state
            .append_crash(instance_id, node_id, reason.clone(), crash_count)
        {
            error!(%instance_id, error = %e, "failed to record crash event");
        }
    }

    async fn persist(&self, state: &InstanceRuntimeState) {
        if let Err(e) = self.cluster.state.put_instance(state) {
            error!(instance_id = %state.instance_id, error = %e, "failed to persist instance state");
        }
    }
}
