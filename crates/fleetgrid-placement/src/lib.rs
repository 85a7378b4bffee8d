//! FleetGrid placement scheduler — deterministic, explainable assignment
//! of worker instances to nodes.
//!
//! # Components
//!
//! - **`scorer`** — per (instance, node) score out of 100 and the hard
//!   constraints that make a node infeasible
//! - **`placer`** — batch placement: overrides first, then instances by
//!   descending RAM, each taking its best feasible node
//! - **`convert`** — builds candidates from node records and the budget ledger

pub mod convert;
pub mod placer;
pub mod scorer;

pub use convert::build_candidates;
pub use placer::{Assignment, PlacementFailure, PlacementPlan, PlacementRequest, compute_placement};
pub use scorer::{
    NodeCandidate, NodeScore, PlacedPeer, Rejection, ScoreBreakdown, ScoringWeights, check_feasible,
    rank_nodes, score_node,
};
