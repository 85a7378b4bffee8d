//! The per-node reservation ledger.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleet_core::{BudgetSettings, GB_EPSILON, InstanceId, Node, NodeHealth, NodeId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{BudgetError, BudgetResult};
use crate::report::{BudgetReport, BudgetRequest, RequirementLine, Violation, ViolationScope};

#[derive(Debug)]
struct NodeLedger {
    usable_gb: f64,
    reservations: BTreeMap<InstanceId, f64>,
    /// Free system memory from the last health check, if any.
    live_available_gb: Option<f64>,
    schedulable: bool,
}

/// Sum starting from +0.0; `Iterator::sum` yields -0.0 for an empty f64 iterator.
fn total(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(0.0, |a, b| a + b)
}

impl NodeLedger {
    fn allocated_gb(&self) -> f64 {
        total(self.reservations.values().copied())
    }

    /// Free budget ignoring reservations held by `exclude`, capped by live memory.
    fn free_gb_excluding(&self, exclude: &[&str]) -> f64 {
        let allocated = total(
            self.reservations
                .iter()
                .filter(|(id, _)| !exclude.contains(&id.as_str()))
                .map(|(_, gb)| *gb),
        );
        let free = (self.usable_gb - allocated).max(0.0);
        match self.live_available_gb {
            Some(live) => free.min(live.max(0.0)),
            None => free,
        }
    }
}

/// Point-in-time view of one node's ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeLedgerSnapshot {
    pub node_id: NodeId,
    pub usable_gb: f64,
    pub allocated_gb: f64,
    pub free_gb: f64,
    pub live_available_gb: Option<f64>,
    pub schedulable: bool,
    pub reservations: BTreeMap<InstanceId, f64>,
}

/// Authoritative memory ledger. Shared behind an `Arc`.
#[derive(Debug)]
pub struct BudgetManager {
    settings: BudgetSettings,
    index: Mutex<HashMap<InstanceId, NodeId>>,
    nodes: BTreeMap<NodeId, Mutex<NodeLedger>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BudgetManager {
    pub fn new(nodes: &[Node], settings: BudgetSettings) -> Self {
        let nodes = nodes
            .iter()
            .map(|n| {
                let ledger = NodeLedger {
                    usable_gb: n.usable_ram_gb(settings.safety_margin),
                    reservations: BTreeMap::new(),
                    live_available_gb: None,
                    schedulable: n.health == NodeHealth::Healthy,
                };
                (n.node_id.clone(), Mutex::new(ledger))
            })
            .collect();
        Self {
            settings,
            index: Mutex::new(HashMap::new()),
            nodes,
        }
    }

    pub fn settings(&self) -> BudgetSettings {
        self.settings
    }

    /// Record the outcome of a node health check.
    pub fn observe_node(&self, node_id: &str, health: NodeHealth, ram_available_gb: Option<f64>) {
        if let Some(ledger) = self.nodes.get(node_id) {
            let mut ledger = lock(ledger);
            ledger.schedulable = health == NodeHealth::Healthy;
            if ram_available_gb.is_some() {
                ledger.live_available_gb = ram_available_gb;
            }
        }
    }

    /// Pre-flight check for a batch of requests. Never mutates the ledger.
    ///
    /// Pinned requests are checked against their node's free budget.
    /// Unpinned requests are checked together against the combined free
    /// budget of schedulable nodes, and individually against the largest
    /// node that could ever hold them.
    pub fn validate(&self, requests: &[BudgetRequest]) -> BudgetReport {
        let overhead = self.settings.overhead_factor;
        let exclude: Vec<&str> = requests.iter().map(|r| r.instance_id.as_str()).collect();

        let lines: Vec<RequirementLine> = requests
            .iter()
            .map(|r| RequirementLine {
                instance_id: r.instance_id.clone(),
                declared_gb: r.declared_gb,
                estimated_gb: r.artifact_size_gb.map(|a| a * overhead),
                required_gb: r.required_gb(overhead),
                node_id: r.node_id.clone(),
            })
            .collect();

        // (free, usable, schedulable, live) per node
        let mut free: BTreeMap<&str, (f64, f64, bool, Option<f64>)> = BTreeMap::new();
        for (id, ledger) in &self.nodes {
            let ledger = lock(ledger);
            free.insert(
                id.as_str(),
                (
                    ledger.free_gb_excluding(&exclude),
                    ledger.usable_gb,
                    ledger.schedulable,
                    ledger.live_available_gb,
                ),
            );
        }
        let total_usable_gb = total(
            free.values()
                .filter(|(_, _, schedulable, _)| *schedulable)
                .map(|(f, ..)| *f),
        );

        let mut violations = Vec::new();

        let mut pinned: BTreeMap<&str, f64> = BTreeMap::new();
        for line in &lines {
            if let Some(node) = &line.node_id {
                *pinned.entry(node.as_str()).or_default() += line.required_gb;
            }
        }
        for (node, required) in &pinned {
            match free.get_mut(node) {
                None => violations.push(Violation {
                    scope: ViolationScope::Node(node.to_string()),
                    required_gb: *required,
                    usable_gb: 0.0,
                    excess_gb: *required,
                    hint: format!("node {node} is not configured; pick one of the cluster's nodes"),
                }),
                Some((node_free, _, _, live)) => {
                    if *required > *node_free + GB_EPSILON {
                        let excess = *required - *node_free;
                        let hint = match live {
                            Some(l) if (*l - *node_free).abs() < GB_EPSILON => format!(
                                "only {l:.1}GB of system memory is free on {node}; stop other \
                                 workloads there or move {excess:.1}GB of instances elsewhere"
                            ),
                            _ => format!(
                                "move {excess:.1}GB of instances off {node} or lower their \
                                 ram_required_gb"
                            ),
                        };
                        violations.push(Violation {
                            scope: ViolationScope::Node(node.to_string()),
                            required_gb: *required,
                            usable_gb: *node_free,
                            excess_gb: excess,
                            hint,
                        });
                    }
                    *node_free = (*node_free - *required).max(0.0);
                }
            }
        }

        let unpinned: Vec<&RequirementLine> =
            lines.iter().filter(|l| l.node_id.is_none()).collect();
        if !unpinned.is_empty() {
            let schedulable: Vec<&(f64, f64, bool, Option<f64>)> =
                free.values().filter(|(_, _, s, _)| *s).collect();
            let remaining = total(schedulable.iter().map(|(f, ..)| *f));
            let required = total(unpinned.iter().map(|l| l.required_gb));
            if required > remaining + GB_EPSILON {
                let excess = required - remaining;
                violations.push(Violation {
                    scope: ViolationScope::Cluster,
                    required_gb: required,
                    usable_gb: remaining,
                    excess_gb: excess,
                    hint: format!(
                        "reduce total requests by {excess:.1}GB, add node capacity, or lower \
                         the safety margin (currently {:.0}%)",
                        self.settings.safety_margin * 100.0
                    ),
                });
            }

            let largest = schedulable.iter().map(|(_, u, ..)| *u).fold(0.0, f64::max);
            for line in &unpinned {
                if line.required_gb > largest + GB_EPSILON {
                    let excess = line.required_gb - largest;
                    let hint = match line.estimated_gb {
                        Some(est) if est > line.declared_gb => format!(
                            "estimated footprint {est:.1}GB (artifact x{overhead:.2}) exceeds every \
                             node; use a smaller artifact or add a node with at least {:.1}GB usable",
                            line.required_gb
                        ),
                        _ => format!(
                            "no node offers {:.1}GB usable; lower ram_required_gb or add a larger node",
                            line.required_gb
                        ),
                    };
                    violations.push(Violation {
                        scope: ViolationScope::Instance(line.instance_id.clone()),
                        required_gb: line.required_gb,
                        usable_gb: largest,
                        excess_gb: excess,
                        hint,
                    });
                }
            }
        }

        let total_required_gb = total(lines.iter().map(|l| l.required_gb));
        let report = BudgetReport {
            safety_margin: self.settings.safety_margin,
            overhead_factor: overhead,
            lines,
            total_required_gb,
            total_usable_gb,
            violations,
        };
        if report.is_ok() {
            debug!(
                required_gb = report.total_required_gb,
                usable_gb = report.total_usable_gb,
                "budget validation passed"
            );
        } else {
            warn!(violations = report.violations.len(), "budget validation failed");
        }
        report
    }

    /// Like [`validate`](Self::validate) but turns violations into an error.
    pub fn check(&self, requests: &[BudgetRequest]) -> BudgetResult<BudgetReport> {
        let report = self.validate(requests);
        if report.is_ok() {
            Ok(report)
        } else {
            Err(BudgetError::ResourceExhaustion(Box::new(report)))
        }
    }

    /// Atomically reserve `ram_gb` on `node_id` for `instance_id`.
    pub fn allocate(&self, instance_id: &str, node_id: &str, ram_gb: f64) -> BudgetResult<()> {
        if !ram_gb.is_finite() || ram_gb <= 0.0 {
            return Err(BudgetError::InvalidAmount(ram_gb));
        }
        let ledger = self
            .nodes
            .get(node_id)
            .ok_or_else(|| BudgetError::UnknownNode(node_id.to_string()))?;

        let mut index = lock(&self.index);
        if let Some(existing) = index.get(instance_id) {
            return Err(BudgetError::AlreadyAllocated {
                instance_id: instance_id.to_string(),
                node_id: existing.clone(),
            });
        }

        let mut ledger = lock(ledger);
        let free = ledger.usable_gb - ledger.allocated_gb();
        if ram_gb > free + GB_EPSILON {
            return Err(BudgetError::InsufficientCapacity {
                node_id: node_id.to_string(),
                instance_id: instance_id.to_string(),
                requested_gb: ram_gb,
                free_gb: free.max(0.0),
            });
        }
        ledger.reservations.insert(instance_id.to_string(), ram_gb);
        index.insert(instance_id.to_string(), node_id.to_string());

        info!(
            %instance_id,
            node = %node_id,
            ram_gb,
            allocated_gb = ledger.allocated_gb(),
            usable_gb = ledger.usable_gb,
            "budget reserved"
        );
        Ok(())
    }

    /// Release an instance's reservation. Releasing twice is a no-op.
    ///
    /// Returns the released amount, or `None` when nothing was held.
    pub fn deallocate(&self, instance_id: &str) -> Option<(NodeId, f64)> {
        let mut index = lock(&self.index);
        let node_id = index.remove(instance_id)?;
        let released = self
            .nodes
            .get(&node_id)
            .and_then(|ledger| lock(ledger).reservations.remove(instance_id))
            .unwrap_or(0.0);
        info!(%instance_id, node = %node_id, ram_gb = released, "budget released");
        Some((node_id, released))
    }

    /// Move an instance's reservation to `hold_key` on the same node.
    ///
    /// The memory stays allocated while `instance_id` is free to reserve
    /// again; `deallocate(hold_key)` gives it back. `None` when the
    /// instance holds nothing or `hold_key` is taken.
    pub fn hold(&self, instance_id: &str, hold_key: &str) -> Option<(NodeId, f64)> {
        let mut index = lock(&self.index);
        if index.contains_key(hold_key) {
            warn!(%instance_id, %hold_key, "hold key already in use");
            return None;
        }
        let node_id = index.remove(instance_id)?;
        let gb = self.nodes.get(&node_id).and_then(|ledger| {
            let mut ledger = lock(ledger);
            let gb = ledger.reservations.remove(instance_id)?;
            ledger.reservations.insert(hold_key.to_string(), gb);
            Some(gb)
        })?;
        index.insert(hold_key.to_string(), node_id.clone());
        info!(%instance_id, %hold_key, node = %node_id, ram_gb = gb, "budget held");
        Some((node_id, gb))
    }

    /// The node and amount an instance currently holds.
    pub fn allocation(&self, instance_id: &str) -> Option<(NodeId, f64)> {
        let index = lock(&self.index);
        let node_id = index.get(instance_id)?;
        let gb = self
            .nodes
            .get(node_id)
            .and_then(|l| lock(l).reservations.get(instance_id).copied())?;
        Some((node_id.clone(), gb))
    }

    pub fn allocated_gb(&self, node_id: &str) -> f64 {
        self.nodes
            .get(node_id)
            .map_or(0.0, |l| lock(l).allocated_gb())
    }

    /// Structured ledger state, ordered by node id.
    pub fn snapshot(&self) -> Vec<NodeLedgerSnapshot> {
        self.nodes
            .iter()
            .map(|(id, ledger)| {
                let ledger = lock(ledger);
                let allocated_gb = ledger.allocated_gb();
                NodeLedgerSnapshot {
                    node_id: id.clone(),
                    usable_gb: ledger.usable_gb,
                    allocated_gb,
                    free_gb: (ledger.usable_gb - allocated_gb).max(0.0),
                    live_available_gb: ledger.live_available_gb,
                    schedulable: ledger.schedulable,
                    reservations: ledger.reservations.clone(),
                }
            })
            .collect()
    }

    /// Human-readable ledger dump.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for node in self.snapshot() {
            let _ = writeln!(
                out,
                "{:<16} {:>7.1}/{:>7.1}GB allocated, {:>7.1}GB free{}{}",
                node.node_id,
                node.allocated_gb,
                node.usable_gb,
                node.free_gb,
                node.live_available_gb
                    .map(|l| format!(" (system free {l:.1}GB)"))
                    .unwrap_or_default(),
                if node.schedulable { "" } else { " [not schedulable]" },
            );
            for (instance, gb) in &node.reservations {
                let _ = writeln!(out, "  {instance:<22} {gb:>7.1}GB");
            }
        }
        out
    }
}
