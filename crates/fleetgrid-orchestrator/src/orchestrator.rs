//! ClusterOrchestrator — owns every component and background task.
//!
//! ```text
//! submit ─► health_check_all ─► budget.validate ─► compute_placement
//!        ─► allocate ─► spawn_supervisor ◄──────────────────────────┐
//!                                                                   │
//!   health loop ──(Lost)──────────────────────────────────────────► │
//!   watchdogs ──► WatchdogBridge ──► router ──(WatchdogKill)──────► │
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use fleet_core::{ClusterConfig, CrashEvent, InstanceSpec, Metric, Node, NodeId};
use fleetgrid_budget::BudgetRequest;
use fleetgrid_executor::{
    DeployReport, ExecutorResult, LogStream, RemoteExecutor, RoutingExecutor,
};
use fleetgrid_lifecycle::{InstanceHooks, Reservation, spawn_supervisor};
use fleetgrid_placement::{PlacementRequest, compute_placement};
use fleetgrid_state::StateStore;
use fleetgrid_watchdog::WatchdogMonitor;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::Cluster;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{WatchdogBridge, spawn_router};
use crate::health::{reap_held, run_health_loop};
use crate::hooks::ClusterHooks;
use crate::settings::OrchestratorSettings;
use crate::view::{InstanceStatus, NodeCheck, NodeStatus, SubmitOptions, SubmitReport};

const STATE_FILE: &str = "fleetgrid.redb";

struct HealthTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct ClusterOrchestrator {
    cluster: Arc<Cluster>,
    watchdogs: Arc<WatchdogMonitor>,
    hooks: Arc<dyn InstanceHooks>,
    router: Mutex<Option<JoinHandle<()>>>,
    health: Mutex<Option<HealthTask>>,
    shutting_down: AtomicBool,
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

impl ClusterOrchestrator {
    /// Wire the components together. Must be called inside a tokio runtime.
    pub fn new(
        nodes: Vec<Node>,
        settings: OrchestratorSettings,
        executor: Arc<dyn RemoteExecutor>,
        state: StateStore,
    ) -> Self {
        let thresholds = settings.thresholds.clone();
        let cluster = Arc::new(Cluster::new(nodes, settings, executor.clone(), state));

        let (router_tx, router) = spawn_router(cluster.clone());
        let bridge = Arc::new(WatchdogBridge::new(cluster.clone(), router_tx));
        let watchdogs =
            Arc::new(WatchdogMonitor::new(thresholds, bridge).with_executor_samplers(executor));
        let hooks: Arc<dyn InstanceHooks> =
            Arc::new(ClusterHooks::new(cluster.clone(), watchdogs.clone()));

        Self {
            cluster,
            watchdogs,
            hooks,
            router: Mutex::new(Some(router)),
            health: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Build from a validated cluster file with the SSH/local executor.
    pub fn from_config(config: &ClusterConfig) -> OrchestratorResult<Self> {
        config.validate()?;
        let state = match &config.state_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                StateStore::open(&dir.join(STATE_FILE))?
            }
            None => StateStore::open_in_memory()?,
        };
        let settings = OrchestratorSettings::from_config(config);
        let executor = Arc::new(RoutingExecutor::new(settings.executor.clone()));
        Ok(Self::new(config.nodes(), settings, executor, state))
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.cluster.settings
    }

    /// Start the health loop and the node-scoped watchdogs.
    pub async fn start(&self) {
        {
            let mut slot = self.health.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(run_health_loop(self.cluster.clone(), shutdown_rx));
            *slot = Some(HealthTask {
                handle,
                shutdown_tx,
            });
        }

        for node in self.cluster.node_list().await {
            if let Err(e) = self.cluster.state.put_node(&node) {
                error!(node = %node.node_id, error = %e, "failed to persist node record");
            }
            self.watchdogs.watch_node(node).await;
        }
        info!(nodes = self.cluster.nodes.read().await.len(), "orchestrator started");
    }

    /// Validate, place and start a batch of instances.
    ///
    /// Budget violations reject the whole batch. Placement failures reject
    /// it too unless `allow_partial` is set, in which case the feasible
    /// instances start and the failures are reported in the plan.
    pub async fn submit(
        &self,
        specs: Vec<InstanceSpec>,
        options: SubmitOptions,
    ) -> OrchestratorResult<SubmitReport> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.instance_id.as_str()) {
                return Err(OrchestratorError::DuplicateInstance(spec.instance_id.clone()));
            }
        }
        for id in options.overrides.keys() {
            if !seen.contains(id.as_str()) {
                warn!(instance_id = %id, "placement override for an instance not in this batch");
            }
        }

        let _guard = self.cluster.placement_lock.lock().await;
        {
            let supervisors = self.cluster.supervisors.read().await;
            for spec in &specs {
                if let Some(existing) = supervisors.get(&spec.instance_id) {
                    if !existing.state().state.is_terminal() {
                        return Err(OrchestratorError::AlreadyManaged(spec.instance_id.clone()));
                    }
                }
            }
        }

        self.refresh_live_memory().await;
        let requests: Vec<BudgetRequest> = specs
            .iter()
            .map(|spec| {
                let request = BudgetRequest::from_spec(spec);
                match options.overrides.get(&spec.instance_id) {
                    Some(node) => request.on_node(node.clone()),
                    None => request,
                }
            })
            .collect();
        let budget = self.cluster.budget.validate(&requests);
        if !budget.is_ok() {
            return Err(OrchestratorError::ResourceExhaustion(Box::new(budget)));
        }

        let overhead = self.cluster.settings.budget.overhead_factor;
        let placement_requests: Vec<PlacementRequest> = specs
            .iter()
            .zip(&requests)
            .map(|(spec, request)| PlacementRequest {
                spec: spec.clone(),
                required_gb: budget
                    .required_for(&spec.instance_id)
                    .unwrap_or_else(|| request.required_gb(overhead)),
            })
            .collect();

        let candidates = self.cluster.candidates().await;
        let plan = compute_placement(
            &placement_requests,
            &candidates,
            &options.overrides,
            &self.cluster.settings.weights,
        );
        if !plan.is_complete() && (!options.allow_partial || plan.assignments.is_empty()) {
            return Err(OrchestratorError::PlacementInfeasible(plan.failures));
        }

        let mut reserved: Vec<&str> = Vec::new();
        for (id, assignment) in &plan.assignments {
            if let Err(e) = self
                .cluster
                .budget
                .allocate(id, &assignment.node_id, assignment.ram_gb)
            {
                for done in reserved {
                    self.cluster.budget.deallocate(done);
                }
                return Err(e.into());
            }
            reserved.push(id.as_str());
        }

        {
            let mut stored = self.cluster.specs.write().await;
            for spec in specs.iter().filter(|s| plan.assignments.contains_key(&s.instance_id)) {
                if let Err(e) = self.cluster.state.put_spec(spec) {
                    error!(instance_id = %spec.instance_id, error = %e, "failed to persist spec");
                }
                stored.insert(spec.instance_id.clone(), spec.clone());
            }
        }

        let mut started = Vec::new();
        {
            let mut supervisors = self.cluster.supervisors.write().await;
            for (id, assignment) in &plan.assignments {
                let reservation = Reservation {
                    node_id: assignment.node_id.clone(),
                    ram_gb: assignment.ram_gb,
                };
                let handle = spawn_supervisor(
                    id,
                    reservation,
                    self.cluster.settings.lifecycle.clone(),
                    self.hooks.clone(),
                );
                supervisors.insert(id.clone(), Arc::new(handle));
                started.push(id.clone());
            }
        }

        for failure in &plan.failures {
            warn!(instance_id = %failure.instance_id, "instance left unplaced");
        }
        info!(
            started = started.len(),
            unplaced = plan.failures.len(),
            "batch submitted"
        );
        Ok(SubmitReport {
            budget,
            plan,
            started,
        })
    }

    /// Record each reachable node's current system memory in the ledger.
    ///
    /// Node health stays with the health loop; only the live figure changes.
    async fn refresh_live_memory(&self) {
        for check in self.health_check_all().await {
            let Some(available) = check.ram_available_gb else {
                debug!(node = %check.node_id, "no live memory reading before validation");
                continue;
            };
            let Some(node) = self.cluster.node(&check.node_id).await else {
                continue;
            };
            self.cluster
                .budget
                .observe_node(&check.node_id, node.health, Some(available));
        }
    }

    /// Gracefully stop one instance and release its budget.
    ///
    /// When the process cannot be confirmed gone the instance still ends
    /// STOPPED, its budget stays held until the health loop reaps the
    /// process, and the error is returned.
    pub async fn stop(&self, instance_id: &str) -> OrchestratorResult<InstanceStatus> {
        let supervisor = self
            .cluster
            .supervisor(instance_id)
            .await
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.to_string()))?;
        let state = supervisor.stop().await?;
        Ok(InstanceStatus::from(&state))
    }

    pub async fn status(&self) -> Vec<InstanceStatus> {
        let mut rows: Vec<InstanceStatus> = self
            .cluster
            .supervisor_list()
            .await
            .iter()
            .map(|s| InstanceStatus::from(&s.state()))
            .collect();
        rows.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        rows
    }

    pub async fn instance(&self, instance_id: &str) -> Option<InstanceStatus> {
        self.cluster
            .supervisor(instance_id)
            .await
            .map(|s| InstanceStatus::from(&s.state()))
    }

    pub async fn nodes(&self) -> Vec<NodeStatus> {
        let ledger = self.cluster.budget.snapshot();
        self.cluster
            .node_list()
            .await
            .iter()
            .map(|node| NodeStatus::new(node, ledger.iter().find(|l| l.node_id == node.node_id)))
            .collect()
    }

    /// Crash history, oldest first, for one instance or the whole cluster.
    pub fn crash_events(&self, instance_id: Option<&str>) -> OrchestratorResult<Vec<CrashEvent>> {
        let events = match instance_id {
            Some(id) => self.cluster.state.crash_events(id)?,
            None => self.cluster.state.all_crash_events()?,
        };
        Ok(events)
    }

    /// Sync `bundle` to every node concurrently.
    pub async fn deploy_all(&self, bundle: &Path) -> Vec<(NodeId, ExecutorResult<DeployReport>)> {
        let nodes = self.cluster.node_list().await;
        let executor = &self.cluster.executor;
        let results = join_all(nodes.iter().map(|node| executor.deploy(node, bundle))).await;
        nodes
            .into_iter()
            .map(|n| n.node_id)
            .zip(results)
            .inspect(|(node, result)| match result {
                Ok(report) => info!(
                    %node,
                    copied = report.copied,
                    unchanged = report.unchanged,
                    "bundle deployed"
                ),
                Err(e) => warn!(%node, error = %e, "deploy failed"),
            })
            .collect()
    }

    /// One-shot health check of every node, bypassing the health loop.
    pub async fn health_check_all(&self) -> Vec<NodeCheck> {
        let nodes = self.cluster.node_list().await;
        let executor = &self.cluster.executor;
        let results = join_all(nodes.iter().map(|node| executor.health_check(node))).await;
        nodes
            .into_iter()
            .zip(results)
            .map(|(node, result)| match result {
                Ok(report) => NodeCheck {
                    node_id: node.node_id,
                    healthy: report.healthy,
                    ram_available_gb: Some(report.ram_available_gb),
                    load: Some(report.load),
                    error: None,
                },
                Err(e) => NodeCheck {
                    node_id: node.node_id,
                    healthy: false,
                    ram_available_gb: None,
                    load: None,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }

    /// Follow an instance's log on the node it was last placed on.
    pub async fn stream_logs(&self, instance_id: &str) -> OrchestratorResult<LogStream> {
        let status = self
            .instance(instance_id)
            .await
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.to_string()))?;
        let node_id = status
            .node_id
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.to_string()))?;
        let node = self
            .cluster
            .node(&node_id)
            .await
            .ok_or(OrchestratorError::NodeNotFound(node_id))?;
        Ok(self.cluster.executor.stream_logs(&node, instance_id))
    }

    /// Human-readable ledger summary.
    pub fn budget_report(&self) -> String {
        self.cluster.budget.report()
    }

    /// Currently running watchdog loops as (target key, metric).
    pub async fn active_watchdogs(&self) -> Vec<(String, Metric)> {
        self.watchdogs.active_monitors().await
    }

    /// Stop every instance, cancel every timer and watchdog, release all budget.
    ///
    /// Returns the final state of each instance.
    pub async fn shutdown(&self) -> Vec<InstanceStatus> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
        }
        info!("orchestrator shutting down");

        if let Some(task) = take(&self.health) {
            let _ = task.shutdown_tx.send(true);
            if let Err(e) = task.handle.await {
                debug!(error = %e, "health loop ended abnormally");
            }
        }

        let supervisors: Vec<_> = self.cluster.supervisors.write().await.drain().collect();
        let finals = join_all(supervisors.iter().map(|(id, handle)| async move {
            match handle.stop().await {
                Ok(state) => InstanceStatus::from(&state),
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "instance did not stop cleanly");
                    handle.abort();
                    InstanceStatus::from(&handle.state())
                }
            }
        }))
        .await;

        self.watchdogs.stop_all().await;
        if let Some(router) = take(&self.router) {
            router.abort();
        }
        reap_held(&self.cluster).await;
        let unreaped = self.cluster.held.lock().await.len();
        if unreaped > 0 {
            warn!(count = unreaped, "processes on unreachable nodes were never confirmed dead");
        }

        let mut released = 0usize;
        for ledger in self.cluster.budget.snapshot() {
            for id in ledger.reservations.keys() {
                if let Some((node, gb)) = self.cluster.budget.deallocate(id) {
                    debug!(instance_id = %id, %node, ram_gb = gb, "released leftover reservation");
                    released += 1;
                }
            }
        }
        if released > 0 {
            warn!(count = released, "released reservations left behind by aborted supervisors");
        }

        let mut finals = finals;
        finals.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        info!(instances = finals.len(), "orchestrator stopped");
        finals
    }
}

impl Drop for ClusterOrchestrator {
    fn drop(&mut self) {
        if let Some(task) = take(&self.health) {
            let _ = task.shutdown_tx.send(true);
            task.handle.abort();
        }
        if let Some(router) = take(&self.router) {
            router.abort();
        }
    }
}
