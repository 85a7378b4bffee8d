//! Watchdog → supervisor plumbing.
//!
//! Watchdog loops never touch lifecycle state. They talk to a
//! [`WatchdogBridge`], which hands kill notices to a router task; the router
//! forwards them to the owning supervisor before the signal is sent.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{LifecycleState, Node};
use fleetgrid_executor::{ExecutorResult, Signal};
use fleetgrid_lifecycle::LifecycleEvent;
use fleetgrid_watchdog::{KillSwitch, Victim, WatchdogEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::Cluster;

const ROUTER_QUEUE_DEPTH: usize = 64;

pub(crate) struct RoutedEvent {
    event: WatchdogEvent,
    delivered: oneshot::Sender<()>,
}

/// Start the router. It runs until every bridge is dropped.
pub(crate) fn spawn_router(cluster: Arc<Cluster>) -> (mpsc::Sender<RoutedEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<RoutedEvent>(ROUTER_QUEUE_DEPTH);
    let task = tokio::spawn(async move {
        while let Some(RoutedEvent { event, delivered }) = rx.recv().await {
            route(&cluster, event).await;
            let _ = delivered.send(());
        }
        debug!("watchdog event router finished");
    });
    (tx, task)
}

async fn route(cluster: &Cluster, event: WatchdogEvent) {
    match event {
        WatchdogEvent::Warning {
            instance_id,
            node_id,
            metric,
            value,
            ..
        } => {
            warn!(
                instance_id = instance_id.as_deref().unwrap_or("-"),
                node = %node_id,
                %metric,
                value,
                "watchdog warning"
            );
        }
        WatchdogEvent::Spike {
            instance_id,
            node_id,
            metric,
            from,
            to,
            ..
        } => {
            warn!(
                instance_id = instance_id.as_deref().unwrap_or("-"),
                node = %node_id,
                %metric,
                from,
                to,
                "watchdog spike"
            );
        }
        WatchdogEvent::Kill(decision) => {
            let Some(supervisor) = cluster.supervisor(&decision.instance_id).await else {
                debug!(instance_id = %decision.instance_id, "kill for unmanaged instance");
                return;
            };
            info!(
                instance_id = %decision.instance_id,
                node = %decision.node_id,
                metric = %decision.metric,
                value = decision.value,
                critical = decision.critical,
                "forwarding watchdog kill"
            );
            let event = LifecycleEvent::WatchdogKill {
                generation: decision.generation,
                metric: decision.metric,
                value: decision.value,
            };
            if let Err(e) = supervisor.notify(event).await {
                debug!(instance_id = %decision.instance_id, error = %e, "supervisor already gone");
            }
        }
    }
}

/// [`KillSwitch`] backed by the cluster's executor and ledger.
pub(crate) struct WatchdogBridge {
    cluster: Arc<Cluster>,
    router: mpsc::Sender<RoutedEvent>,
}

impl WatchdogBridge {
    pub fn new(cluster: Arc<Cluster>, router: mpsc::Sender<RoutedEvent>) -> Self {
        Self { cluster, router }
    }
}

#[async_trait]
impl KillSwitch for WatchdogBridge {
    /// Largest reservation on the node with a live process; ties go to the
    /// lowest instance id.
    async fn victim_on(&self, node: &Node) -> Option<Victim> {
        let snapshot = self
            .cluster
            .budget
            .snapshot()
            .into_iter()
            .find(|s| s.node_id == node.node_id)?;

        let mut best: Option<(f64, Victim)> = None;
        for (instance_id, gb) in &snapshot.reservations {
            let Some(supervisor) = self.cluster.supervisor(instance_id).await else {
                continue;
            };
            let runtime = supervisor.state();
            if runtime.state != LifecycleState::Running {
                continue;
            }
            let Some(handle) = runtime.process_handle else {
                continue;
            };
            if handle.node_id != node.node_id {
                continue;
            }
            if best.as_ref().is_none_or(|(max, _)| *gb > *max) {
                best = Some((
                    *gb,
                    Victim {
                        instance_id: instance_id.clone(),
                        generation: handle.generation,
                        node: node.clone(),
                        pid: handle.pid,
                    },
                ));
            }
        }
        best.map(|(_, victim)| victim)
    }

    async fn notify(&self, event: WatchdogEvent) {
        let (delivered, done) = oneshot::channel();
        if self.router.send(RoutedEvent { event, delivered }).await.is_err() {
            return;
        }
        let _ = done.await;
    }

    async fn signal(&self, victim: &Victim, signal: Signal) -> ExecutorResult<()> {
        self.cluster
            .executor
            .signal(&victim.node, victim.pid, signal)
            .await
    }

    async fn is_alive(&self, victim: &Victim) -> ExecutorResult<bool> {
        self.cluster.executor.is_alive(&victim.node, victim.pid).await
    }
}
