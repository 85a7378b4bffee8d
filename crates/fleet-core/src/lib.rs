//! fleet-core — shared domain types and configuration for FleetGrid.
//!
//! Every other FleetGrid crate speaks in terms of the types defined here:
//! [`Node`], [`InstanceSpec`], [`InstanceRuntimeState`], [`CrashEvent`] and
//! [`WatchdogThreshold`]. The [`config`] module loads the declarative
//! cluster file and resolves it into typed settings.

pub mod config;
pub mod duration;
pub mod types;

pub use config::{
    BudgetSettings, ClusterConfig, ConfigError, ConfigResult, ExecutorSettings, HealthSettings,
    InstanceBatch, LifecycleSettings, parse_placement_overrides,
};
pub use duration::parse_duration;
pub use types::*;
