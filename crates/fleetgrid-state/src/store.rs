//! StateStore — redb-backed persistence for FleetGrid.
//!
//! Instance state, specs and node snapshots are overwritten in place. The
//! crash journal is append-only: `append_crash` assigns the next sequence
//! number inside the write transaction and never rewrites an entry.

use std::path::Path;
use std::sync::Arc;

use fleet_core::{CrashEvent, CrashReason, InstanceRuntimeState, InstanceSpec, Node, epoch_secs};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn decode<T: DeserializeOwned>(table: JsonTable, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::record(table.name(), e))
}

fn encode<T: Serialize>(table: JsonTable, value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StateError::record(table.name(), e))
}

#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) the store file at `path`.
    pub fn open(path: &Path) -> StateResult<Self> {
        let store = Self {
            db: Arc::new(Database::create(path)?),
        };
        store.create_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Ephemeral store for tests and runs without a `state_dir`.
    pub fn open_in_memory() -> StateResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        let store = Self { db: Arc::new(db) };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write()?;
        for table in [INSTANCES, SPECS, CRASH_EVENTS, NODES] {
            txn.open_table(table)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(table, value)?;
        let txn = self.db.begin_write()?;
        txn.open_table(table)?.insert(key, bytes.as_slice())?;
        txn.commit()?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(table)?;
        let value = t.get(key)?;
        value.map(|guard| decode(table, guard.value())).transpose()
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(table)?;
        t.iter()?
            .map(|entry| {
                let (_, value) = entry?;
                decode(table, value.value())
            })
            .collect()
    }

    fn delete(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write()?;
        let existed = txn.open_table(table)?.remove(key)?.is_some();
        txn.commit()?;
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update the runtime state of an instance.
    pub fn put_instance(&self, state: &InstanceRuntimeState) -> StateResult<()> {
        self.put(INSTANCES, &state.instance_id, state)?;
        debug!(instance_id = %state.instance_id, state = %state.state, "instance state stored");
        Ok(())
    }

    pub fn get_instance(&self, instance_id: &str) -> StateResult<Option<InstanceRuntimeState>> {
        self.get(INSTANCES, instance_id)
    }

    /// All instances, ordered by instance id.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceRuntimeState>> {
        self.list(INSTANCES)
    }

    /// Remove an instance's runtime state and spec. The crash journal is kept.
    pub fn delete_instance(&self, instance_id: &str) -> StateResult<bool> {
        let existed = self.delete(INSTANCES, instance_id)?;
        self.delete(SPECS, instance_id)?;
        debug!(%instance_id, existed, "instance deleted");
        Ok(existed)
    }

    // ── Specs ──────────────────────────────────────────────────────

    pub fn put_spec(&self, spec: &InstanceSpec) -> StateResult<()> {
        self.put(SPECS, &spec.instance_id, spec)
    }

    pub fn get_spec(&self, instance_id: &str) -> StateResult<Option<InstanceSpec>> {
        self.get(SPECS, instance_id)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node status snapshot.
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put(NODES, &node.node_id, node)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        self.get(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list(NODES)
    }

    // ── Crash journal ──────────────────────────────────────────────

    /// Append a crash event, assigning the next per-instance sequence number.
    pub fn append_crash(
        &self,
        instance_id: &str,
        node_id: Option<&str>,
        reason: CrashReason,
        crash_count_after: u32,
    ) -> StateResult<CrashEvent> {
        let txn = self.db.begin_write()?;
        let event = {
            let mut table = txn.open_table(CRASH_EVENTS)?;
            let (start, end) = prefix_bounds(instance_id);
            let last_seq = match table.range(start.as_str()..end.as_str())?.next_back() {
                Some(entry) => {
                    let (_, value) = entry?;
                    decode::<CrashEvent>(CRASH_EVENTS, value.value())?.seq
                }
                None => 0,
            };

            let event = CrashEvent {
                instance_id: instance_id.to_string(),
                seq: last_seq + 1,
                node_id: node_id.map(str::to_string),
                timestamp: epoch_secs(),
                reason,
                crash_count_after,
            };
            let bytes = encode(CRASH_EVENTS, &event)?;
            table.insert(event.table_key().as_str(), bytes.as_slice())?;
            event
        };
        txn.commit()?;
        debug!(%instance_id, seq = event.seq, reason = %event.reason, "crash event appended");
        Ok(event)
    }

    /// Crash events for one instance, oldest first.
    pub fn crash_events(&self, instance_id: &str) -> StateResult<Vec<CrashEvent>> {
        let (start, end) = prefix_bounds(instance_id);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CRASH_EVENTS)?;
        table
            .range(start.as_str()..end.as_str())?
            .map(|entry| {
                let (_, value) = entry?;
                decode(CRASH_EVENTS, value.value())
            })
            .collect()
    }

    /// Every crash event in the journal, grouped by instance id.
    pub fn all_crash_events(&self) -> StateResult<Vec<CrashEvent>> {
        self.list(CRASH_EVENTS)
    }
}

/// Key range covering `{instance_id}:*`. `;` sorts right after `:`.
fn prefix_bounds(instance_id: &str) -> (String, String) {
    (format!("{instance_id}:"), format!("{instance_id};"))
}
