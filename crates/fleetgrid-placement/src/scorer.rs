//! Node scoring for placement decisions.
//!
//! Each feasible (instance, node) pair gets a score out of 100 built from:
//! - **Resource efficiency** (30): projected utilization of usable RAM
//!   inside the 30–70% band scores full marks, linear penalty outside
//! - **Load balancing** (20): fewer instances on the node scores higher
//! - **Capability** (15): GPU instances on GPU nodes; CPU-only instances
//!   lose half on GPU nodes so those stay free for GPU work
//! - **Affinity** (25): share of already placed affinity peers on the node
//! - **User hint** (10): the instance's `preferred_node`
//!
//! Infeasible pairs return a [`Rejection`] instead of a score.

use std::collections::BTreeMap;
use std::fmt;

use fleet_core::{GB_EPSILON, InstanceId, InstanceSpec, NodeHealth, NodeId};
use serde::Serialize;

const EFFICIENCY_BAND_LOW: f64 = 0.3;
const EFFICIENCY_BAND_HIGH: f64 = 0.7;

/// An instance already occupying (or provisionally assigned to) a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedPeer {
    pub instance_id: InstanceId,
    pub anti_affinity: Vec<InstanceId>,
    pub ram_gb: f64,
}

impl PlacedPeer {
    pub fn from_spec(spec: &InstanceSpec, ram_gb: f64) -> Self {
        Self {
            instance_id: spec.instance_id.clone(),
            anti_affinity: spec.anti_affinity.clone(),
            ram_gb,
        }
    }
}

/// A node as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeCandidate {
    pub node_id: NodeId,
    pub health: NodeHealth,
    pub gpu_available: bool,
    pub max_instances: u32,
    /// `total_ram_gb * (1 - safety_margin)`.
    pub usable_gb: f64,
    pub allocated_gb: f64,
    /// Free system memory from the last health check.
    pub live_available_gb: Option<f64>,
    pub placed: Vec<PlacedPeer>,
}

impl NodeCandidate {
    pub fn instance_count(&self) -> u32 {
        self.placed.len() as u32
    }

    pub fn free_gb(&self) -> f64 {
        let free = (self.usable_gb - self.allocated_gb).max(0.0);
        match self.live_available_gb {
            Some(live) => free.min(live.max(0.0)),
            None => free,
        }
    }

    /// Record a provisional assignment.
    pub fn occupy(&mut self, peer: PlacedPeer) {
        self.allocated_gb += peer.ram_gb;
        self.placed.push(peer);
    }
}

/// Why a node cannot take an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    NotHealthy { health: NodeHealth },
    AtMaxInstances { max: u32 },
    InsufficientRam { required_gb: f64, free_gb: f64 },
    GpuUnavailable,
    AntiAffinity { peer: InstanceId },
    UnknownNode,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotHealthy { health } => write!(f, "node is {health}"),
            Rejection::AtMaxInstances { max } => write!(f, "already at max_instances ({max})"),
            Rejection::InsufficientRam { required_gb, free_gb } => {
                write!(f, "needs {required_gb:.1}GB, {free_gb:.1}GB free")
            }
            Rejection::GpuUnavailable => f.write_str("GPU required but not available"),
            Rejection::AntiAffinity { peer } => write!(f, "anti-affinity with {peer}"),
            Rejection::UnknownNode => f.write_str("node is not configured"),
        }
    }
}

/// Scored placement result for a single node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeScore {
    pub node_id: NodeId,
    /// Composite score, 0.0..=100.0.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub efficiency: f64,
    pub load: f64,
    pub capability: f64,
    pub affinity: f64,
    pub hint: f64,
}

/// Maximum points per component. Defaults sum to 100.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub efficiency: f64,
    pub load: f64,
    pub capability: f64,
    pub affinity: f64,
    pub hint: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            efficiency: 30.0,
            load: 20.0,
            capability: 15.0,
            affinity: 25.0,
            hint: 10.0,
        }
    }
}

/// Check the hard constraints for placing `spec` on `node`.
pub fn check_feasible(
    spec: &InstanceSpec,
    required_gb: f64,
    node: &NodeCandidate,
) -> Result<(), Rejection> {
    if node.health != NodeHealth::Healthy {
        return Err(Rejection::NotHealthy { health: node.health });
    }
    if node.instance_count() >= node.max_instances {
        return Err(Rejection::AtMaxInstances { max: node.max_instances });
    }
    if spec.gpu_required && !node.gpu_available {
        return Err(Rejection::GpuUnavailable);
    }
    let free_gb = node.free_gb();
    if required_gb > free_gb + GB_EPSILON {
        return Err(Rejection::InsufficientRam { required_gb, free_gb });
    }
    // Both directions: either side listing the other is a conflict.
    if let Some(peer) = node.placed.iter().find(|p| {
        spec.anti_affinity.contains(&p.instance_id) || p.anti_affinity.contains(&spec.instance_id)
    }) {
        return Err(Rejection::AntiAffinity {
            peer: peer.instance_id.clone(),
        });
    }
    Ok(())
}

/// Score a single node for `spec`.
///
/// `locations` maps every already placed instance to its node; it drives
/// the affinity component.
pub fn score_node(
    spec: &InstanceSpec,
    required_gb: f64,
    node: &NodeCandidate,
    locations: &BTreeMap<InstanceId, NodeId>,
    weights: &ScoringWeights,
) -> Result<NodeScore, Rejection> {
    check_feasible(spec, required_gb, node)?;

    let projected = if node.usable_gb > 0.0 {
        (node.allocated_gb + required_gb) / node.usable_gb
    } else {
        1.0
    };
    let efficiency = if projected < EFFICIENCY_BAND_LOW {
        weights.efficiency * projected / EFFICIENCY_BAND_LOW
    } else if projected <= EFFICIENCY_BAND_HIGH {
        weights.efficiency
    } else {
        weights.efficiency * (1.0 - projected) / (1.0 - EFFICIENCY_BAND_HIGH)
    }
    .clamp(0.0, weights.efficiency);

    let load = if node.max_instances > 0 {
        weights.load * (1.0 - f64::from(node.instance_count()) / f64::from(node.max_instances))
    } else {
        0.0
    };

    let capability = if spec.gpu_required || !node.gpu_available {
        weights.capability
    } else {
        weights.capability / 2.0
    };

    let placed_peers: Vec<&NodeId> = spec
        .affinity
        .iter()
        .filter_map(|peer| locations.get(peer))
        .collect();
    let affinity = if placed_peers.is_empty() {
        weights.affinity / 2.0
    } else {
        let here = placed_peers.iter().filter(|n| ***n == node.node_id).count();
        weights.affinity * here as f64 / placed_peers.len() as f64
    };

    let hint = if spec.preferred_node.as_deref() == Some(node.node_id.as_str()) {
        weights.hint
    } else {
        0.0
    };

    Ok(NodeScore {
        node_id: node.node_id.clone(),
        score: efficiency + load + capability + affinity + hint,
        breakdown: ScoreBreakdown {
            efficiency,
            load,
            capability,
            affinity,
            hint,
        },
    })
}

/// Score every node. Feasible nodes come back best first (ties by lowest
/// node id); infeasible nodes are returned with their rejection.
pub fn rank_nodes(
    spec: &InstanceSpec,
    required_gb: f64,
    nodes: &[NodeCandidate],
    locations: &BTreeMap<InstanceId, NodeId>,
    weights: &ScoringWeights,
) -> (Vec<NodeScore>, Vec<(NodeId, Rejection)>) {
    let mut scores = Vec::new();
    let mut rejections = Vec::new();
    for node in nodes {
        match score_node(spec, required_gb, node, locations, weights) {
            Ok(score) => scores.push(score),
            Err(reason) => rejections.push((node.node_id.clone(), reason)),
        }
    }

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    rejections.sort_by(|a, b| a.0.cmp(&b.0));
    (scores, rejections)
}
