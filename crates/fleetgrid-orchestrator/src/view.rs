//! Read models returned by the orchestrator and served by the status API.

use std::collections::BTreeMap;

use fleet_core::{InstanceId, InstanceRuntimeState, LifecycleState, Node, NodeHealth, NodeId};
use fleetgrid_budget::{BudgetReport, NodeLedgerSnapshot};
use fleetgrid_placement::PlacementPlan;
use serde::Serialize;

/// Caller options for `submit`.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Manual placement: instance id → node id.
    pub overrides: BTreeMap<InstanceId, NodeId>,
    /// Start the feasible instances even if others cannot be placed.
    pub allow_partial: bool,
}

/// Outcome of a successful `submit`.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReport {
    pub budget: BudgetReport,
    pub plan: PlacementPlan,
    /// Instances whose supervisors were started, in id order.
    pub started: Vec<InstanceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub state: LifecycleState,
    pub crash_count: u32,
    pub ram_allocated_gb: f64,
    pub node_id: Option<NodeId>,
    pub generation: u64,
    pub pid: Option<u32>,
}

impl From<&InstanceRuntimeState> for InstanceStatus {
    fn from(s: &InstanceRuntimeState) -> Self {
        Self {
            instance_id: s.instance_id.clone(),
            state: s.state,
            crash_count: s.crash_count,
            ram_allocated_gb: s.ram_allocated_gb,
            node_id: s
                .process_handle
                .as_ref()
                .map(|h| h.node_id.clone())
                .or_else(|| s.assigned_node.clone()),
            generation: s.generation,
            pid: s.process_handle.as_ref().map(|h| h.pid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub host: String,
    pub health: NodeHealth,
    pub last_heartbeat: Option<u64>,
    pub gpu_available: bool,
    pub total_ram_gb: f64,
    pub usable_gb: f64,
    pub allocated_gb: f64,
    pub free_gb: f64,
    pub live_available_gb: Option<f64>,
    pub instances: Vec<InstanceId>,
}

impl NodeStatus {
    pub fn new(node: &Node, ledger: Option<&NodeLedgerSnapshot>) -> Self {
        Self {
            node_id: node.node_id.clone(),
            host: node.host.clone(),
            health: node.health,
            last_heartbeat: node.last_heartbeat,
            gpu_available: node.gpu_available,
            total_ram_gb: node.total_ram_gb,
            usable_gb: ledger.map_or(0.0, |l| l.usable_gb),
            allocated_gb: ledger.map_or(0.0, |l| l.allocated_gb),
            free_gb: ledger.map_or(0.0, |l| l.free_gb),
            live_available_gb: ledger.and_then(|l| l.live_available_gb),
            instances: ledger
                .map(|l| l.reservations.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

/// One row of the `health-check` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeCheck {
    pub node_id: NodeId,
    pub healthy: bool,
    pub ram_available_gb: Option<f64>,
    pub load: Option<f64>,
    pub error: Option<String>,
}
