//! fleetgrid-state — embedded state store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb). Holds instance runtime state,
//! submitted specs, node status snapshots and the append-only crash
//! journal. Values are JSON; crash keys are `{instance_id}:{seq:010}` so a
//! prefix scan returns one instance's crashes in order.
//!
//! `StateStore` is `Clone + Send + Sync` and can be shared across tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
