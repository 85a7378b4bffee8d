//! State shared by the orchestrator's tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use fleet_core::{InstanceId, InstanceSpec, Node, NodeHealth, NodeId, ProcessHandle};
use fleetgrid_budget::BudgetManager;
use fleetgrid_executor::RemoteExecutor;
use fleetgrid_lifecycle::SupervisorHandle;
use fleetgrid_placement::{NodeCandidate, build_candidates};
use fleetgrid_state::StateStore;
use tokio::sync::{Mutex, RwLock};
use tracing::error;

use crate::settings::OrchestratorSettings;

pub(crate) struct Cluster {
    pub nodes: RwLock<BTreeMap<NodeId, Node>>,
    pub specs: RwLock<BTreeMap<InstanceId, InstanceSpec>>,
    pub supervisors: RwLock<HashMap<InstanceId, Arc<SupervisorHandle>>>,
    pub budget: BudgetManager,
    pub executor: Arc<dyn RemoteExecutor>,
    pub state: StateStore,
    pub settings: OrchestratorSettings,
    /// Serialises placement decisions with their reservations.
    pub placement_lock: Mutex<()>,
    /// Processes whose termination was never confirmed, by ledger hold key.
    pub held: Mutex<BTreeMap<String, ProcessHandle>>,
}

/// Ledger key under which a stale generation's budget is held.
pub(crate) fn hold_key(handle: &ProcessHandle) -> String {
    format!("{}#gen{}", handle.instance_id, handle.generation)
}

impl Cluster {
    pub fn new(
        nodes: Vec<Node>,
        settings: OrchestratorSettings,
        executor: Arc<dyn RemoteExecutor>,
        state: StateStore,
    ) -> Self {
        Self {
            budget: BudgetManager::new(&nodes, settings.budget),
            nodes: RwLock::new(nodes.into_iter().map(|n| (n.node_id.clone(), n)).collect()),
            specs: RwLock::new(BTreeMap::new()),
            supervisors: RwLock::new(HashMap::new()),
            executor,
            state,
            settings,
            placement_lock: Mutex::new(()),
            held: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn node(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().await.get(node_id).cloned()
    }

    pub async fn node_list(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn spec(&self, instance_id: &str) -> Option<InstanceSpec> {
        self.specs.read().await.get(instance_id).cloned()
    }

    pub async fn supervisor(&self, instance_id: &str) -> Option<Arc<SupervisorHandle>> {
        self.supervisors.read().await.get(instance_id).cloned()
    }

    pub async fn supervisor_list(&self) -> Vec<Arc<SupervisorHandle>> {
        self.supervisors.read().await.values().cloned().collect()
    }

    /// Placement candidates reflecting current health and reservations.
    pub async fn candidates(&self) -> Vec<NodeCandidate> {
        let nodes = self.node_list().await;
        let specs = self.specs.read().await;
        build_candidates(&nodes, &self.budget.snapshot(), &specs)
    }

    /// Record a health check result on the node record.
    pub async fn set_node_health(&self, node_id: &str, health: NodeHealth, heartbeat: Option<u64>) {
        let updated = {
            let mut nodes = self.nodes.write().await;
            let Some(node) = nodes.get_mut(node_id) else {
                return;
            };
            node.health = health;
            if heartbeat.is_some() {
                node.last_heartbeat = heartbeat;
            }
            node.clone()
        };
        if let Err(e) = self.state.put_node(&updated) {
            error!(node = %node_id, error = %e, "failed to persist node record");
        }
    }
}
