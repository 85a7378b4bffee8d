//! Builds placement candidates from node records and the budget ledger.
//!
//! Occupancy comes from the ledger: every instance holding a reservation
//! counts towards `max_instances` and acts as an anti-affinity peer.

use std::collections::BTreeMap;

use fleet_core::{InstanceId, InstanceSpec, Node};
use fleetgrid_budget::NodeLedgerSnapshot;

use crate::scorer::{NodeCandidate, PlacedPeer};

/// Combine static node data, current health and ledger state.
///
/// `specs` supplies anti-affinity lists for instances holding reservations;
/// reservations without a known spec still count as occupancy.
pub fn build_candidates(
    nodes: &[Node],
    ledger: &[NodeLedgerSnapshot],
    specs: &BTreeMap<InstanceId, InstanceSpec>,
) -> Vec<NodeCandidate> {
    nodes
        .iter()
        .map(|node| {
            let snapshot = ledger.iter().find(|s| s.node_id == node.node_id);
            let placed = snapshot
                .map(|s| {
                    s.reservations
                        .iter()
                        .map(|(id, gb)| PlacedPeer {
                            instance_id: id.clone(),
                            anti_affinity: specs
                                .get(id)
                                .map(|spec| spec.anti_affinity.clone())
                                .unwrap_or_default(),
                            ram_gb: *gb,
                        })
                        .collect()
                })
                .unwrap_or_default();

            NodeCandidate {
                node_id: node.node_id.clone(),
                health: node.health,
                gpu_available: node.gpu_available,
                max_instances: node.max_instances,
                usable_gb: snapshot.map_or(0.0, |s| s.usable_gb),
                allocated_gb: snapshot.map_or(0.0, |s| s.allocated_gb),
                live_available_gb: snapshot.and_then(|s| s.live_available_gb),
                placed,
            }
        })
        .collect()
}
