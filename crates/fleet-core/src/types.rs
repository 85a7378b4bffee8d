//! Domain types shared across FleetGrid crates.
//!
//! Nodes come from static configuration, instance specs from the caller.
//! Runtime state and crash events are produced by the orchestrator and
//! persisted by `fleetgrid-state`. All types serialize to JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a managed worker instance.
pub type InstanceId = String;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Tolerance used when comparing gigabyte quantities.
pub const GB_EPSILON: f64 = 1e-9;

// ── Node ──────────────────────────────────────────────────────────

/// Health of a node as determined by periodic checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    /// Recent checks failed but the failure threshold is not reached yet.
    Degraded,
    Unreachable,
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeHealth::Healthy => "healthy",
            NodeHealth::Degraded => "degraded",
            NodeHealth::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// SSH credentials for a remote node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub port: Option<u16>,
}

/// A host capable of running worker instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub host: String,
    #[serde(default)]
    pub credentials: Credentials,
    pub total_ram_gb: f64,
    pub gpu_available: bool,
    pub max_instances: u32,
    pub health: NodeHealth,
    /// Unix timestamp of the last successful health check.
    pub last_heartbeat: Option<u64>,
}

impl Node {
    /// Whether commands for this node run on the orchestrator host itself.
    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1" | "local")
    }

    /// RAM that may be reserved on this node under the given safety margin.
    pub fn usable_ram_gb(&self, safety_margin: f64) -> f64 {
        self.total_ram_gb * (1.0 - safety_margin)
    }

    /// SSH destination string, `user@host` when a user is configured.
    pub fn ssh_destination(&self) -> String {
        match &self.credentials.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

// ── Instance spec ─────────────────────────────────────────────────

/// Caller-owned description of one worker instance. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance_id: InstanceId,
    /// Opaque reference handed to the worker (usually a config file path).
    pub worker_config_ref: String,
    pub ram_required_gb: f64,
    #[serde(default)]
    pub gpu_required: bool,
    #[serde(default)]
    pub affinity: Vec<InstanceId>,
    #[serde(default)]
    pub anti_affinity: Vec<InstanceId>,
    #[serde(default)]
    pub preferred_node: Option<NodeId>,
    /// Size of the model artifact the worker loads, if known.
    #[serde(default)]
    pub artifact_size_gb: Option<f64>,
    /// Extra environment variables for the worker process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl InstanceSpec {
    /// Minimal spec, mostly useful in tests and examples.
    pub fn new(instance_id: impl Into<String>, ram_required_gb: f64) -> Self {
        let instance_id = instance_id.into();
        Self {
            worker_config_ref: format!("{instance_id}.yaml"),
            instance_id,
            ram_required_gb,
            gpu_required: false,
            affinity: Vec::new(),
            anti_affinity: Vec::new(),
            preferred_node: None,
            artifact_size_gb: None,
            env: BTreeMap::new(),
        }
    }

    /// True if either spec lists the other in its anti-affinity set.
    pub fn conflicts_with(&self, other: &InstanceSpec) -> bool {
        self.anti_affinity.iter().any(|id| id == &other.instance_id)
            || other.anti_affinity.iter().any(|id| id == &self.instance_id)
    }
}

// ── Runtime state ─────────────────────────────────────────────────

/// Lifecycle state of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Budget reserved, launch requested, not yet confirmed alive.
    Initializing,
    Running,
    Crashed,
    /// Waiting out backoff or for budget before a restart.
    Resurrecting,
    Stopped,
    /// Restart limit exhausted; no further automatic restarts.
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Initializing => "INITIALIZING",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Crashed => "CRASHED",
            LifecycleState::Resurrecting => "RESURRECTING",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Opaque handle to a launched worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    /// Process id on the node that runs the worker.
    pub pid: u32,
    /// Launch counter for this instance; bumps on every (re)launch.
    pub generation: u64,
    pub started_at: u64,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code), signal: None }
    }

    pub fn signal(signal: i32) -> Self {
        Self { code: None, signal: Some(signal) }
    }

    /// Exit status is unknown (process vanished while unobserved).
    pub fn unknown() -> Self {
        Self { code: None, signal: None }
    }

    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// Current view of one managed instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRuntimeState {
    pub instance_id: InstanceId,
    pub assigned_node: Option<NodeId>,
    pub process_handle: Option<ProcessHandle>,
    pub state: LifecycleState,
    pub crash_count: u32,
    pub ram_allocated_gb: f64,
    pub generation: u64,
    pub started_at: Option<u64>,
    pub last_crash_at: Option<u64>,
}

impl InstanceRuntimeState {
    /// Fresh state for an instance whose budget has just been reserved.
    pub fn initializing(instance_id: &str, node_id: &str, ram_allocated_gb: f64) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            assigned_node: Some(node_id.to_string()),
            process_handle: None,
            state: LifecycleState::Initializing,
            crash_count: 0,
            ram_allocated_gb,
            generation: 0,
            started_at: None,
            last_crash_at: None,
        }
    }
}

// ── Crash events ──────────────────────────────────────────────────

/// Resource class enforced by a watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Memory,
    Gpu,
    Thermal,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Memory, Metric::Gpu, Metric::Thermal];

    /// Unit suffix used in log lines and reports.
    pub fn unit(self) -> &'static str {
        match self {
            Metric::Memory | Metric::Gpu => "%",
            Metric::Thermal => "°C",
        }
    }

    /// Whether the metric is measured per process (vs. per node).
    pub fn is_process_scoped(self) -> bool {
        !matches!(self, Metric::Thermal)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Metric::Memory => "memory",
            Metric::Gpu => "gpu",
            Metric::Thermal => "thermal",
        };
        f.write_str(s)
    }
}

/// Why an instance left the RUNNING state involuntarily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrashReason {
    NonZeroExit { code: i32 },
    Signaled { signal: i32 },
    /// The OS (or the worker itself) reported resource exhaustion.
    ResourceExhausted { detail: String },
    WatchdogKill { metric: Metric, value: f64, forced: bool },
    LaunchFailed { message: String },
    /// The process disappeared without an observed exit status.
    Lost,
}

/// Conventional exit code of a process killed by SIGKILL (128 + 9).
const SIGKILL_EXIT_CODE: i32 = 137;
const SIGKILL: i32 = 9;

impl CrashReason {
    /// Classify an unrequested exit. Clean exits are not crashes.
    pub fn from_exit(outcome: ExitOutcome) -> Option<Self> {
        match (outcome.code, outcome.signal) {
            (Some(0), _) => None,
            (Some(SIGKILL_EXIT_CODE), _) | (None, Some(SIGKILL)) => {
                Some(CrashReason::ResourceExhausted {
                    detail: format!("worker killed externally ({outcome}), likely out of memory"),
                })
            }
            (Some(code), _) => Some(CrashReason::NonZeroExit { code }),
            (None, Some(signal)) => Some(CrashReason::Signaled { signal }),
            (None, None) => Some(CrashReason::Lost),
        }
    }
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashReason::NonZeroExit { code } => write!(f, "exited with code {code}"),
            CrashReason::Signaled { signal } => write!(f, "terminated by signal {signal}"),
            CrashReason::ResourceExhausted { detail } => write!(f, "resource exhaustion: {detail}"),
            CrashReason::WatchdogKill { metric, value, forced } => write!(
                f,
                "{metric} watchdog {} at {value:.1}{}",
                if *forced { "force-killed" } else { "stopped" },
                metric.unit()
            ),
            CrashReason::LaunchFailed { message } => write!(f, "launch failed: {message}"),
            CrashReason::Lost => f.write_str("process lost"),
        }
    }
}

/// Append-only record of one crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashEvent {
    pub instance_id: InstanceId,
    /// Per-instance sequence number, starting at 1.
    pub seq: u64,
    pub node_id: Option<NodeId>,
    pub timestamp: u64,
    pub reason: CrashReason,
    pub crash_count_after: u32,
}

impl CrashEvent {
    /// Composite key for ordered storage: `{instance_id}:{seq:010}`.
    pub fn table_key(&self) -> String {
        format!("{}:{:010}", self.instance_id, self.seq)
    }
}

// ── Watchdog thresholds ───────────────────────────────────────────

/// Threshold configuration for one resource class.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogThreshold {
    pub metric: Metric,
    /// Level that switches polling to `fast_interval`.
    pub warning_pct: f64,
    /// Level that triggers the kill policy. Degrees Celsius for thermal.
    pub critical_pct: f64,
    pub base_interval: Duration,
    pub fast_interval: Duration,
    /// Rise between consecutive samples treated as an emergency.
    pub spike_delta_pct: Option<f64>,
    /// Wait between graceful stop and force kill.
    pub grace_period: Duration,
}

impl WatchdogThreshold {
    pub fn default_for(metric: Metric) -> Self {
        let (warning_pct, critical_pct) = match metric {
            Metric::Memory | Metric::Gpu => (70.0, 85.0),
            Metric::Thermal => (75.0, 85.0),
        };
        Self {
            metric,
            warning_pct,
            critical_pct,
            base_interval: Duration::from_secs(3),
            fast_interval: Duration::from_secs(1),
            spike_delta_pct: Some(10.0),
            grace_period: Duration::from_secs(2),
        }
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
