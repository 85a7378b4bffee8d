//! fleetgrid-lifecycle — keeps each worker instance alive.
//!
//! [`InstanceLifecycle`] is the pure state machine: transitions, crash
//! counting, backoff and the retry window. [`spawn_supervisor`] runs one
//! task per instance that drives the machine from [`LifecycleEvent`]s and
//! performs side effects through [`InstanceHooks`].

pub mod error;
pub mod hooks;
pub mod machine;
pub mod supervisor;

pub use error::{LifecycleError, LifecycleResult};
pub use hooks::{InstanceHooks, Reservation};
pub use machine::{Backoff, CrashVerdict, InstanceLifecycle, StartLimit};
pub use supervisor::{LifecycleEvent, SupervisorHandle, spawn_supervisor};
