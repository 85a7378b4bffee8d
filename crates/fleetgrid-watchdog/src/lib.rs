//! fleetgrid-watchdog — resource watchdogs for running workers.
//!
//! One polling loop runs per (target, metric): memory and GPU loops watch
//! a single instance, thermal loops watch a node. Each loop feeds a
//! [`ThresholdTracker`], which picks the next polling interval and decides
//! when the kill policy applies. Kills go through a [`KillSwitch`] so they
//! only ever touch the offending instance.

pub mod error;
pub mod monitor;
pub mod sampler;
pub mod tracker;

pub use error::{SampleError, SampleResult};
pub use monitor::{KillSwitch, Victim, WatchTarget, WatchdogEvent, WatchdogMonitor};
pub use sampler::{GpuSampler, InstanceTarget, MemorySampler, ThermalSampler, UsageSampler};
pub use tracker::{KillDecision, ThresholdTracker, Verdict};
