//! Error types for the FleetGrid state store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(#[from] redb::DatabaseError),

    #[error("state transaction failed: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("state table unavailable: {0}")]
    Table(#[from] redb::TableError),

    #[error("state storage failed: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("state commit failed: {0}")]
    Commit(#[from] redb::CommitError),

    /// A record could not be encoded, or a stored record no longer decodes.
    #[error("bad record in table `{table}`: {source}")]
    Record {
        table: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StateError {
    pub(crate) fn record(table: &str, source: serde_json::Error) -> Self {
        StateError::Record {
            table: table.to_string(),
            source,
        }
    }
}
