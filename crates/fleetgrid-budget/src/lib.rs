//! fleetgrid-budget — authoritative memory ledger for FleetGrid.
//!
//! Every worker instance reserves RAM on exactly one node before its
//! process starts and releases it only after the process is confirmed
//! dead. The ledger guarantees that, per node, the sum of reservations
//! never exceeds `total_ram_gb * (1 - safety_margin)`.
//!
//! # Architecture
//!
//! ```text
//! BudgetManager
//!   ├── index: Mutex<instance_id → node_id>
//!   └── per node: Mutex<NodeLedger>   (reservations + live free memory)
//! ```
//!
//! Lock order is always index first, then a single node ledger.
//!
//! `validate` is the pre-flight check run before anything is scheduled.
//! It never mutates the ledger and returns a [`BudgetReport`] naming every
//! violated scope with the excess and a remediation hint.

pub mod error;
pub mod ledger;
pub mod report;

pub use error::{BudgetError, BudgetResult};
pub use ledger::{BudgetManager, NodeLedgerSnapshot};
pub use report::{BudgetReport, BudgetRequest, RequirementLine, Violation, ViolationScope};
