//! Placement engine — assigns a batch of instances to nodes.
//!
//! 1. Manual overrides are applied first. They skip scoring but not the
//!    hard constraints.
//! 2. Remaining instances are ordered by descending required RAM (ties by
//!    instance id) and each takes its highest-scoring feasible node.
//! 3. Every assignment updates provisional occupancy before the next
//!    instance is considered, so the result depends only on the inputs.

use std::collections::BTreeMap;
use std::fmt;

use fleet_core::{InstanceId, InstanceSpec, NodeId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::scorer::{
    NodeCandidate, NodeScore, PlacedPeer, Rejection, ScoringWeights, check_feasible, rank_nodes,
};

/// One instance to place, with its budget-derived RAM requirement.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub spec: InstanceSpec,
    pub required_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub node_id: NodeId,
    pub ram_gb: f64,
    /// `None` for manual overrides.
    pub score: Option<NodeScore>,
}

/// An instance that could not be placed, with every node's reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacementFailure {
    pub instance_id: InstanceId,
    pub reasons: Vec<(NodeId, Rejection)>,
}

impl fmt::Display for PlacementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot place {}:", self.instance_id)?;
        if self.reasons.is_empty() {
            return f.write_str(" no nodes configured");
        }
        for (node, reason) in &self.reasons {
            write!(f, "\n    {node}: {reason}")?;
        }
        Ok(())
    }
}

/// A placement decision for a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlacementPlan {
    pub assignments: BTreeMap<InstanceId, Assignment>,
    pub failures: Vec<PlacementFailure>,
}

impl PlacementPlan {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn node_for(&self, instance_id: &str) -> Option<&str> {
        self.assignments.get(instance_id).map(|a| a.node_id.as_str())
    }
}

/// Compute a placement plan for `requests` over `nodes`.
///
/// `nodes` already reflect running instances (occupancy, reservations and
/// anti-affinity peers). `overrides` maps instance ids to forced nodes.
pub fn compute_placement(
    requests: &[PlacementRequest],
    nodes: &[NodeCandidate],
    overrides: &BTreeMap<InstanceId, NodeId>,
    weights: &ScoringWeights,
) -> PlacementPlan {
    let mut nodes: Vec<NodeCandidate> = nodes.to_vec();
    nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    let mut locations: BTreeMap<InstanceId, NodeId> = nodes
        .iter()
        .flat_map(|n| n.placed.iter().map(|p| (p.instance_id.clone(), n.node_id.clone())))
        .collect();

    let mut plan = PlacementPlan::default();

    let (forced, mut free): (Vec<&PlacementRequest>, Vec<&PlacementRequest>) = requests
        .iter()
        .partition(|r| overrides.contains_key(&r.spec.instance_id));

    // Overrides in instance-id order.
    let mut forced = forced;
    forced.sort_by(|a, b| a.spec.instance_id.cmp(&b.spec.instance_id));
    for req in forced {
        let id = &req.spec.instance_id;
        let Some(target) = overrides.get(id) else { continue };
        let Some(node) = nodes.iter_mut().find(|n| &n.node_id == target) else {
            warn!(instance_id = %id, node = %target, "override names an unknown node");
            plan.failures.push(PlacementFailure {
                instance_id: id.clone(),
                reasons: vec![(target.clone(), Rejection::UnknownNode)],
            });
            continue;
        };
        match check_feasible(&req.spec, req.required_gb, node) {
            Ok(()) => {
                node.occupy(PlacedPeer::from_spec(&req.spec, req.required_gb));
                locations.insert(id.clone(), node.node_id.clone());
                info!(instance_id = %id, node = %node.node_id, "placed by override");
                plan.assignments.insert(
                    id.clone(),
                    Assignment {
                        node_id: node.node_id.clone(),
                        ram_gb: req.required_gb,
                        score: None,
                    },
                );
            }
            Err(reason) => {
                warn!(instance_id = %id, node = %target, %reason, "override is infeasible");
                plan.failures.push(PlacementFailure {
                    instance_id: id.clone(),
                    reasons: vec![(target.clone(), reason)],
                });
            }
        }
    }

    free.sort_by(|a, b| {
        b.required_gb
            .partial_cmp(&a.required_gb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.spec.instance_id.cmp(&b.spec.instance_id))
    });

    for req in free {
        let id = &req.spec.instance_id;
        let (ranked, rejections) = rank_nodes(&req.spec, req.required_gb, &nodes, &locations, weights);
        let Some(best) = ranked.into_iter().next() else {
            warn!(instance_id = %id, candidates = rejections.len(), "no feasible node");
            plan.failures.push(PlacementFailure {
                instance_id: id.clone(),
                reasons: rejections,
            });
            continue;
        };

        if let Some(node) = nodes.iter_mut().find(|n| n.node_id == best.node_id) {
            node.occupy(PlacedPeer::from_spec(&req.spec, req.required_gb));
        }
        locations.insert(id.clone(), best.node_id.clone());
        debug!(
            instance_id = %id,
            node = %best.node_id,
            score = best.score,
            efficiency = best.breakdown.efficiency,
            load = best.breakdown.load,
            capability = best.breakdown.capability,
            affinity = best.breakdown.affinity,
            hint = best.breakdown.hint,
            "placed instance"
        );
        plan.assignments.insert(
            id.clone(),
            Assignment {
                node_id: best.node_id.clone(),
                ram_gb: req.required_gb,
                score: Some(best),
            },
        );
    }

    if !plan.failures.is_empty() {
        warn!(
            placed = plan.assignments.len(),
            failed = plan.failures.len(),
            "placement incomplete"
        );
    }
    plan
}

#[cfg(test)]
mod tests {
    use fleet_core::NodeHealth;

    use super::*;

    fn make_node(id: &str, usable: f64, gpu: bool, max: u32) -> NodeCandidate {
        NodeCandidate {
            node_id: id.to_string(),
            health: NodeHealth::Healthy,
            gpu_available: gpu,
            max_instances: max,
            usable_gb: usable,
            allocated_gb: 0.0,
            live_available_gb: None,
            placed: Vec::new(),
        }
    }

    fn request(spec: InstanceSpec) -> PlacementRequest {
        PlacementRequest {
            required_gb: spec.ram_required_gb,
            spec,
        }
    }

    fn place(requests: &[PlacementRequest], nodes: &[NodeCandidate]) -> PlacementPlan {
        compute_placement(requests, nodes, &BTreeMap::new(), &ScoringWeights::default())
    }

    #[test]
    fn gpu_and_anti_affinity_split_across_nodes() {
        // A: 64GB with GPU, B: 8GB CPU-only; 15% margin already applied.
        let nodes = vec![make_node("A", 54.4, true, 4), make_node("B", 6.8, false, 1)];
        let mut gpu_req = InstanceSpec::new("gpu_req", 8.0);
        gpu_req.gpu_required = true;
        let mut cpu_only = InstanceSpec::new("cpu_only", 2.0);
        cpu_only.anti_affinity.push("gpu_req".to_string());

        let plan = place(&[request(cpu_only), request(gpu_req)], &nodes);

        assert!(plan.is_complete());
        assert_eq!(plan.node_for("gpu_req"), Some("A"));
        assert_eq!(plan.node_for("cpu_only"), Some("B"));
    }

    #[test]
    fn anti_affinity_pairs_never_share_a_node() {
        let nodes = vec![make_node("n1", 100.0, false, 8), make_node("n2", 100.0, false, 8)];
        let mut specs = Vec::new();
        for i in 0..4 {
            let mut s = InstanceSpec::new(format!("w-{i}"), 4.0);
            if i % 2 == 1 {
                s.anti_affinity.push(format!("w-{}", i - 1));
            }
            specs.push(request(s));
        }

        let plan = place(&specs, &nodes);
        assert!(plan.is_complete());
        assert_ne!(plan.node_for("w-0"), plan.node_for("w-1"));
        assert_ne!(plan.node_for("w-2"), plan.node_for("w-3"));
    }

    #[test]
    fn placement_is_deterministic() {
        let nodes = vec![
            make_node("n3", 20.0, false, 3),
            make_node("n1", 20.0, false, 3),
            make_node("n2", 40.0, true, 3),
        ];
        let specs: Vec<PlacementRequest> = (0..6)
            .map(|i| request(InstanceSpec::new(format!("w-{i}"), 2.0 + f64::from(i))))
            .collect();
        let mut reversed = specs.clone();
        reversed.reverse();

        let a = place(&specs, &nodes);
        let b = place(&reversed, &nodes);
        assert_eq!(a, b);
    }

    #[test]
    fn provisional_occupancy_respects_max_instances() {
        let nodes = vec![make_node("n1", 100.0, false, 1)];
        let plan = place(
            &[request(InstanceSpec::new("a", 1.0)), request(InstanceSpec::new("b", 1.0))],
            &nodes,
        );
        assert_eq!(plan.assignments.len(), 1);
        assert_eq!(plan.failures.len(), 1);
        assert!(matches!(
            plan.failures[0].reasons[0].1,
            Rejection::AtMaxInstances { .. }
        ));
    }

    #[test]
    fn failure_names_every_node() {
        let mut sick = make_node("n2", 100.0, false, 4);
        sick.health = NodeHealth::Unreachable;
        let nodes = vec![make_node("n1", 2.0, false, 4), sick];
        let mut spec = InstanceSpec::new("big", 10.0);
        spec.gpu_required = true;

        let plan = place(&[request(spec)], &nodes);
        let failure = &plan.failures[0];
        assert_eq!(failure.instance_id, "big");
        assert_eq!(failure.reasons.len(), 2);
        let text = failure.to_string();
        assert!(text.contains("n1: GPU required"));
        assert!(text.contains("n2: node is unreachable"));
    }

    #[test]
    fn override_bypasses_scoring_not_constraints() {
        let nodes = vec![make_node("n1", 100.0, false, 4), make_node("n2", 10.0, false, 4)];
        let mut overrides = BTreeMap::new();
        overrides.insert("a".to_string(), "n2".to_string());
        overrides.insert("b".to_string(), "n2".to_string());

        let plan = compute_placement(
            &[request(InstanceSpec::new("a", 6.0)), request(InstanceSpec::new("b", 6.0))],
            &nodes,
            &overrides,
            &ScoringWeights::default(),
        );
        assert_eq!(plan.node_for("a"), Some("n2"));
        assert!(plan.assignments["a"].score.is_none());
        // b does not fit next to a
        assert_eq!(plan.failures.len(), 1);
        assert_eq!(plan.failures[0].instance_id, "b");
    }

    #[test]
    fn override_to_unknown_node_fails() {
        let nodes = vec![make_node("n1", 100.0, false, 4)];
        let mut overrides = BTreeMap::new();
        overrides.insert("a".to_string(), "ghost".to_string());
        let plan = compute_placement(
            &[request(InstanceSpec::new("a", 1.0))],
            &nodes,
            &overrides,
            &ScoringWeights::default(),
        );
        assert_eq!(plan.failures[0].reasons[0].1, Rejection::UnknownNode);
    }

    #[test]
    fn running_instances_block_anti_affinity() {
        let mut n1 = make_node("n1", 100.0, false, 4);
        n1.occupy(PlacedPeer::from_spec(&InstanceSpec::new("old", 4.0), 4.0));
        let nodes = vec![n1, make_node("n2", 100.0, false, 4)];
        let mut spec = InstanceSpec::new("new", 4.0);
        spec.anti_affinity.push("old".to_string());

        let plan = place(&[request(spec)], &nodes);
        assert_eq!(plan.node_for("new"), Some("n2"));
    }
}
