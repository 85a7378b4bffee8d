//! redb table definitions.
//!
//! Keys are `&str`, values are JSON-serialized domain types.

use redb::TableDefinition;

/// Runtime state keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Submitted instance specs keyed by `{instance_id}`.
pub const SPECS: TableDefinition<&str, &[u8]> = TableDefinition::new("specs");

/// Append-only crash journal keyed by `{instance_id}:{seq:010}`.
pub const CRASH_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("crash_events");

/// Node status snapshots keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
