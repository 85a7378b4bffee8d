//! Cluster health loop: node heartbeats and instance liveness.
//!
//! Runs independently of the watchdog loops. A node that fails a check is
//! DEGRADED; after `unhealthy_threshold` consecutive failures it becomes
//! UNREACHABLE and checks back off exponentially up to a minute.
//!
//! Processes whose termination could not be confirmed keep their budget
//! held; once their node answers again they are killed and the budget is
//! released.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{
    HealthSettings, InstanceId, LifecycleState, Node, NodeHealth, NodeId, ProcessHandle,
    epoch_secs,
};
use fleetgrid_executor::{ExecutorResult, Signal, wait_until_dead};
use fleetgrid_lifecycle::LifecycleEvent;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::Cluster;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Tracks consecutive check results for one node.
#[derive(Debug)]
pub struct NodeHealthTracker {
    status: NodeHealth,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
    base_interval: Duration,
    current_backoff: Duration,
    next_check: Option<Instant>,
}

impl NodeHealthTracker {
    pub fn new(settings: &HealthSettings) -> Self {
        Self {
            status: NodeHealth::Healthy,
            consecutive_failures: 0,
            unhealthy_threshold: settings.unhealthy_threshold.max(1),
            base_interval: settings.interval,
            current_backoff: settings.interval,
            next_check: None,
        }
    }

    /// Record a check result taken at `now` and return the new status.
    pub fn record(&mut self, ok: bool, now: Instant) -> NodeHealth {
        if ok {
            self.consecutive_failures = 0;
            self.current_backoff = self.base_interval;
            self.status = NodeHealth::Healthy;
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.unhealthy_threshold {
                self.status = NodeHealth::Unreachable;
                self.current_backoff = (self.current_backoff * 2).min(MAX_BACKOFF);
            } else {
                self.status = NodeHealth::Degraded;
            }
        }
        self.next_check = Some(now + self.current_backoff);
        self.status
    }

    pub fn status(&self) -> NodeHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_check.is_none_or(|at| at <= now)
    }

    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// Health loop state kept across rounds.
#[derive(Default)]
struct LoopState {
    trackers: BTreeMap<NodeId, NodeHealthTracker>,
    /// Running instances whose pid was missing on the previous round.
    suspects: HashSet<(InstanceId, u64)>,
}

pub(crate) async fn run_health_loop(cluster: Arc<Cluster>, mut shutdown: watch::Receiver<bool>) {
    let interval = cluster.settings.health.interval;
    let mut state = LoopState::default();
    debug!(interval = ?interval, "health loop starting");

    loop {
        check_nodes(&cluster, &mut state).await;
        reap_held(&cluster).await;
        check_instances(&cluster, &mut state).await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                debug!("health loop shutting down");
                break;
            }
        }
    }
}

async fn check_nodes(cluster: &Cluster, state: &mut LoopState) {
    for node in cluster.node_list().await {
        let tracker = state
            .trackers
            .entry(node.node_id.clone())
            .or_insert_with(|| NodeHealthTracker::new(&cluster.settings.health));
        if !tracker.is_due(Instant::now()) {
            continue;
        }

        let (ok, available) = match cluster.executor.health_check(&node).await {
            Ok(report) => (report.healthy, Some(report.ram_available_gb)),
            Err(e) => {
                debug!(node = %node.node_id, error = %e, "health check failed");
                (false, None)
            }
        };
        let previous = tracker.status();
        let status = tracker.record(ok, Instant::now());

        cluster
            .set_node_health(&node.node_id, status, ok.then(epoch_secs))
            .await;
        cluster.budget.observe_node(&node.node_id, status, available);

        if status == previous {
            continue;
        }
        match status {
            NodeHealth::Healthy => info!(node = %node.node_id, "node healthy again"),
            NodeHealth::Degraded => warn!(
                node = %node.node_id,
                failures = tracker.consecutive_failures(),
                "node degraded"
            ),
            NodeHealth::Unreachable => {
                warn!(
                    node = %node.node_id,
                    failures = tracker.consecutive_failures(),
                    retry_in = ?tracker.next_interval(),
                    "node unreachable"
                );
                lose_instances_on(cluster, &node.node_id).await;
            }
        }
    }
}

/// Declare every live process on an unreachable node lost.
async fn lose_instances_on(cluster: &Cluster, node_id: &str) {
    for supervisor in cluster.supervisor_list().await {
        let runtime = supervisor.state();
        let Some(handle) = runtime.process_handle else {
            continue;
        };
        if handle.node_id != node_id || runtime.state.is_terminal() {
            continue;
        }
        info!(instance_id = %runtime.instance_id, node = %node_id, "instance lost with its node");
        let _ = supervisor
            .notify(LifecycleEvent::Lost {
                generation: handle.generation,
                message: format!("node {node_id} unreachable"),
            })
            .await;
    }
}

/// SIGKILL every held process on a healthy node and release its budget
/// once it is confirmed dead. Unconfirmed ones are retried next round.
pub(crate) async fn reap_held(cluster: &Cluster) {
    let held: Vec<(String, ProcessHandle)> = cluster
        .held
        .lock()
        .await
        .iter()
        .map(|(key, handle)| (key.clone(), handle.clone()))
        .collect();

    for (key, handle) in held {
        let Some(node) = cluster.node(&handle.node_id).await else {
            continue;
        };
        if node.health != NodeHealth::Healthy {
            continue;
        }
        if is_current(cluster, &handle).await {
            debug!(
                instance_id = %handle.instance_id,
                pid = handle.pid,
                "held process is current, skipping"
            );
            continue;
        }

        match kill_confirmed(cluster, &node, handle.pid).await {
            Ok(true) => {
                cluster.held.lock().await.remove(&key);
                let released = cluster.budget.deallocate(&key).map_or(0.0, |(_, gb)| gb);
                info!(
                    instance_id = %handle.instance_id,
                    node = %node.node_id,
                    pid = handle.pid,
                    generation = handle.generation,
                    ram_gb = released,
                    "stale process reaped, budget released"
                );
            }
            Ok(false) => warn!(
                instance_id = %handle.instance_id,
                pid = handle.pid,
                "stale process survived SIGKILL, retrying next round"
            ),
            Err(e) => debug!(
                instance_id = %handle.instance_id,
                pid = handle.pid,
                error = %e,
                "cannot reap stale process yet"
            ),
        }
    }
}

/// Whether `handle` is still the process its supervisor is running.
async fn is_current(cluster: &Cluster, handle: &ProcessHandle) -> bool {
    cluster
        .supervisor(&handle.instance_id)
        .await
        .and_then(|s| s.state().process_handle)
        .is_some_and(|current| {
            current.node_id == handle.node_id
                && current.pid == handle.pid
                && current.generation == handle.generation
        })
}

/// `Ok(true)` once `pid` is gone, sending SIGKILL if it is still alive.
async fn kill_confirmed(cluster: &Cluster, node: &Node, pid: u32) -> ExecutorResult<bool> {
    let executor = cluster.executor.as_ref();
    if !executor.is_alive(node, pid).await? {
        return Ok(true);
    }
    executor.signal(node, pid, Signal::Kill).await?;
    wait_until_dead(executor, node, pid, cluster.settings.executor.stop_timeout).await
}

/// A running instance whose pid is missing on two consecutive rounds is
/// reported lost; normally its exit waiter reports it first.
async fn check_instances(cluster: &Cluster, state: &mut LoopState) {
    let mut seen = HashSet::new();
    for supervisor in cluster.supervisor_list().await {
        let runtime = supervisor.state();
        if runtime.state != LifecycleState::Running {
            continue;
        }
        let Some(handle) = runtime.process_handle else {
            continue;
        };
        let Some(node) = cluster.node(&handle.node_id).await else {
            continue;
        };
        if node.health != NodeHealth::Healthy {
            continue;
        }

        let key = (runtime.instance_id.clone(), handle.generation);
        match cluster.executor.is_alive(&node, handle.pid).await {
            Ok(true) => {}
            Ok(false) if state.suspects.contains(&key) => {
                warn!(
                    instance_id = %runtime.instance_id,
                    pid = handle.pid,
                    "process vanished without an exit status"
                );
                let _ = supervisor
                    .notify(LifecycleEvent::Lost {
                        generation: handle.generation,
                        message: "process vanished".to_string(),
                    })
                    .await;
            }
            Ok(false) => {
                seen.insert(key);
            }
            Err(e) => debug!(instance_id = %runtime.instance_id, error = %e, "liveness check failed"),
        }
    }
    state.suspects = seen;
}
