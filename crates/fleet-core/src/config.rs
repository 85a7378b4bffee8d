//! Cluster configuration file parser.
//!
//! The cluster file is YAML (or TOML when the extension says so). Every
//! section except `nodes` is optional; missing values take the defaults
//! documented on the resolved settings types below.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::{or_default, parse_duration};
use crate::types::{Credentials, InstanceId, InstanceSpec, Metric, Node, NodeHealth, NodeId, WatchdogThreshold};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn read_file<T: for<'de> Deserialize<'de>>(path: &Path) -> ConfigResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(toml::from_str(&content)?),
        _ => Ok(serde_yaml::from_str(&content)?),
    }
}

// ── File format ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Directory for the state database. In-memory when absent.
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub host: String,
    #[serde(default)]
    pub credentials: Credentials,
    pub ram_gb: f64,
    #[serde(default)]
    pub gpu: bool,
    pub max_instances: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub safety_margin: Option<f64>,
    pub overhead_factor: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub memory: Option<ThresholdConfig>,
    pub gpu: Option<ThresholdConfig>,
    pub thermal: Option<ThresholdConfig>,
    /// Grace period between graceful stop and force kill (e.g. "2s").
    pub grace_period: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub warning: Option<f64>,
    pub critical: Option<f64>,
    pub base_interval: Option<String>,
    pub fast_interval: Option<String>,
    pub spike_delta: Option<f64>,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub base_delay: Option<String>,
    pub max_delay: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_window: Option<String>,
    pub budget_retry_interval: Option<String>,
    pub startup_grace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub connect_timeout: Option<String>,
    pub command_timeout: Option<String>,
    pub stop_timeout: Option<String>,
    /// Directory on each node where bundles are deployed and workers run.
    pub work_dir: Option<PathBuf>,
    /// Worker command line; `worker_config_ref` is appended as last argument.
    pub worker_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval: Option<String>,
    pub unhealthy_threshold: Option<u32>,
}

// ── Resolved settings ─────────────────────────────────────────────

/// Budget parameters. Defaults: margin 0.15, overhead factor 1.5.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSettings {
    pub safety_margin: f64,
    pub overhead_factor: f64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            safety_margin: 0.15,
            overhead_factor: 1.5,
        }
    }
}

/// Restart policy. Defaults: 3s base, 30s cap, 3 retries per 60s.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub retry_window: Duration,
    pub budget_retry_interval: Duration,
    /// How long a freshly launched process must survive to count as alive.
    pub startup_grace: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            max_retries: 3,
            retry_window: Duration::from_secs(60),
            budget_retry_interval: Duration::from_secs(10),
            startup_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub stop_timeout: Duration,
    pub work_dir: PathBuf,
    pub worker_command: Vec<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(10),
            work_dir: PathBuf::from("/tmp/fleetgrid"),
            worker_command: vec!["fleet-worker".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    pub interval: Duration,
    /// Consecutive failed checks before a node is marked unreachable.
    pub unhealthy_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            unhealthy_threshold: 3,
        }
    }
}

impl ClusterConfig {
    /// Load a cluster file. `.toml` files are parsed as TOML, anything else as YAML.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        read_file(path)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Check the whole file and report every problem at once.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut problems = Vec::new();

        if self.nodes.is_empty() {
            problems.push("at least one node must be configured".to_string());
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                problems.push("node id must not be empty".to_string());
            }
            if !seen.insert(node.id.as_str()) {
                problems.push(format!("duplicate node id '{}'", node.id));
            }
            if node.host.trim().is_empty() {
                problems.push(format!("node '{}': host must not be empty", node.id));
            }
            if !(node.ram_gb > 0.0) {
                problems.push(format!("node '{}': ram_gb must be positive", node.id));
            }
            if node.max_instances == Some(0) {
                problems.push(format!("node '{}': max_instances must be at least 1", node.id));
            }
        }

        if let Some(margin) = self.budget.safety_margin {
            if !(0.0..1.0).contains(&margin) {
                problems.push(format!("budget.safety_margin {margin} must be in [0, 1)"));
            }
        }
        if let Some(factor) = self.budget.overhead_factor {
            if !(factor >= 1.0) {
                problems.push(format!("budget.overhead_factor {factor} must be >= 1"));
            }
        }

        for (name, threshold) in [
            ("memory", &self.watchdog.memory),
            ("gpu", &self.watchdog.gpu),
            ("thermal", &self.watchdog.thermal),
        ] {
            if let Some(t) = threshold {
                if let (Some(w), Some(c)) = (t.warning, t.critical) {
                    if w >= c {
                        problems.push(format!("watchdog.{name}: warning {w} must be below critical {c}"));
                    }
                }
                check_duration(&mut problems, &format!("watchdog.{name}.base_interval"), &t.base_interval);
                check_duration(&mut problems, &format!("watchdog.{name}.fast_interval"), &t.fast_interval);
            }
        }
        check_duration(&mut problems, "watchdog.grace_period", &self.watchdog.grace_period);

        let lc = &self.lifecycle;
        for (name, value) in [
            ("lifecycle.base_delay", &lc.base_delay),
            ("lifecycle.max_delay", &lc.max_delay),
            ("lifecycle.retry_window", &lc.retry_window),
            ("lifecycle.budget_retry_interval", &lc.budget_retry_interval),
            ("lifecycle.startup_grace", &lc.startup_grace),
            ("executor.connect_timeout", &self.executor.connect_timeout),
            ("executor.command_timeout", &self.executor.command_timeout),
            ("executor.stop_timeout", &self.executor.stop_timeout),
            ("health.interval", &self.health.interval),
        ] {
            check_duration(&mut problems, name, value);
        }
        if let Some(cmd) = &self.executor.worker_command {
            if cmd.is_empty() {
                problems.push("executor.worker_command must not be empty".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Runtime node records. Every node starts out healthy.
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .map(|n| Node {
                node_id: n.id.clone(),
                host: n.host.clone(),
                credentials: n.credentials.clone(),
                total_ram_gb: n.ram_gb,
                gpu_available: n.gpu,
                max_instances: n.max_instances.unwrap_or(4),
                health: NodeHealth::Healthy,
                last_heartbeat: None,
            })
            .collect()
    }

    pub fn budget_settings(&self) -> BudgetSettings {
        let d = BudgetSettings::default();
        BudgetSettings {
            safety_margin: self.budget.safety_margin.unwrap_or(d.safety_margin),
            overhead_factor: self.budget.overhead_factor.unwrap_or(d.overhead_factor),
        }
    }

    /// Enabled watchdog thresholds, one per resource class.
    ///
    /// The GPU class is only returned when at least one node has a GPU.
    pub fn watchdog_thresholds(&self) -> Vec<WatchdogThreshold> {
        let any_gpu = self.nodes.iter().any(|n| n.gpu);
        let grace = self.watchdog.grace_period.as_deref();

        Metric::ALL
            .into_iter()
            .filter(|m| *m != Metric::Gpu || any_gpu)
            .filter_map(|metric| {
                let cfg = match metric {
                    Metric::Memory => &self.watchdog.memory,
                    Metric::Gpu => &self.watchdog.gpu,
                    Metric::Thermal => &self.watchdog.thermal,
                };
                let mut t = WatchdogThreshold::default_for(metric);
                t.grace_period = or_default(grace, t.grace_period);
                if let Some(c) = cfg {
                    if !c.enabled {
                        return None;
                    }
                    t.warning_pct = c.warning.unwrap_or(t.warning_pct);
                    t.critical_pct = c.critical.unwrap_or(t.critical_pct);
                    t.base_interval = or_default(c.base_interval.as_deref(), t.base_interval);
                    t.fast_interval = or_default(c.fast_interval.as_deref(), t.fast_interval);
                    if c.spike_delta.is_some() {
                        t.spike_delta_pct = c.spike_delta;
                    }
                }
                Some(t)
            })
            .collect()
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        let d = LifecycleSettings::default();
        let lc = &self.lifecycle;
        LifecycleSettings {
            base_delay: or_default(lc.base_delay.as_deref(), d.base_delay),
            max_delay: or_default(lc.max_delay.as_deref(), d.max_delay),
            max_retries: lc.max_retries.unwrap_or(d.max_retries),
            retry_window: or_default(lc.retry_window.as_deref(), d.retry_window),
            budget_retry_interval: or_default(lc.budget_retry_interval.as_deref(), d.budget_retry_interval),
            startup_grace: or_default(lc.startup_grace.as_deref(), d.startup_grace),
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        let d = ExecutorSettings::default();
        let ex = &self.executor;
        ExecutorSettings {
            connect_timeout: or_default(ex.connect_timeout.as_deref(), d.connect_timeout),
            command_timeout: or_default(ex.command_timeout.as_deref(), d.command_timeout),
            stop_timeout: or_default(ex.stop_timeout.as_deref(), d.stop_timeout),
            work_dir: ex.work_dir.clone().unwrap_or(d.work_dir),
            worker_command: ex.worker_command.clone().unwrap_or(d.worker_command),
        }
    }

    pub fn health_settings(&self) -> HealthSettings {
        let d = HealthSettings::default();
        HealthSettings {
            interval: or_default(self.health.interval.as_deref(), d.interval),
            unhealthy_threshold: self.health.unhealthy_threshold.unwrap_or(d.unhealthy_threshold),
        }
    }
}

fn check_duration(problems: &mut Vec<String>, name: &str, value: &Option<String>) {
    if let Some(v) = value {
        if parse_duration(v).is_none() {
            problems.push(format!("{name}: cannot parse duration '{v}'"));
        }
    }
}

// ── Instance batches ──────────────────────────────────────────────

/// A batch of instance specs as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceBatch {
    pub instances: Vec<InstanceSpec>,
}

impl InstanceBatch {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        read_file(path)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();
        for spec in &self.instances {
            let id = &spec.instance_id;
            if id.trim().is_empty() {
                problems.push("instance_id must not be empty".to_string());
            }
            if !seen.insert(id.as_str()) {
                problems.push(format!("duplicate instance_id '{id}'"));
            }
            if !(spec.ram_required_gb > 0.0) {
                problems.push(format!("instance '{id}': ram_required_gb must be positive"));
            }
            if spec.anti_affinity.contains(id) {
                problems.push(format!("instance '{id}': anti_affinity lists itself"));
            }
            if let Some(both) = spec.affinity.iter().find(|a| spec.anti_affinity.contains(a)) {
                problems.push(format!("instance '{id}': '{both}' is in both affinity and anti_affinity"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// Parse `--placement a:node-1,b:node-2` into an override map.
pub fn parse_placement_overrides(s: &str) -> ConfigResult<BTreeMap<InstanceId, NodeId>> {
    let mut overrides = BTreeMap::new();
    let mut problems = Vec::new();
    for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once(':') {
            Some((instance, node)) if !instance.is_empty() && !node.is_empty() => {
                if overrides.insert(instance.to_string(), node.to_string()).is_some() {
                    problems.push(format!("instance '{instance}' overridden twice"));
                }
            }
            _ => problems.push(format!("malformed placement '{pair}', expected instance:node")),
        }
    }
    if problems.is_empty() {
        Ok(overrides)
    } else {
        Err(ConfigError::Invalid(problems))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
nodes:
  - id: A
    host: localhost
    ram_gb: 64
    gpu: true
    max_instances: 4
  - id: B
    host: worker-b.lan
    credentials:
      user: llm
      port: 2222
    ram_gb: 8
    max_instances: 1
budget:
  safety_margin: 0.2
watchdog:
  memory:
    warning: 60
    critical: 80
    base_interval: 5s
  thermal:
    enabled: false
lifecycle:
  base_delay: 2s
  max_retries: 5
"#;

    #[test]
    fn parse_sample() {
        let cfg = ClusterConfig::from_yaml_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.nodes[1].credentials.port, Some(2222));
    }

    #[test]
    fn resolved_nodes() {
        let cfg = ClusterConfig::from_yaml_str(SAMPLE).unwrap();
        let nodes = cfg.nodes();
        assert_eq!(nodes[0].node_id, "A");
        assert!(nodes[0].gpu_available);
        assert_eq!(nodes[1].max_instances, 1);
        assert_eq!(nodes[1].ssh_destination(), "llm@worker-b.lan");
        assert!(nodes.iter().all(|n| n.health == NodeHealth::Healthy));
    }

    #[test]
    fn budget_defaults_and_overrides() {
        let cfg = ClusterConfig::from_yaml_str(SAMPLE).unwrap();
        let b = cfg.budget_settings();
        assert_eq!(b.safety_margin, 0.2);
        assert_eq!(b.overhead_factor, 1.5);
    }

    #[test]
    fn watchdog_thresholds_resolve() {
        let cfg = ClusterConfig::from_yaml_str(SAMPLE).unwrap();
        let thresholds = cfg.watchdog_thresholds();
        // thermal disabled, gpu present because node A has one
        let metrics: Vec<Metric> = thresholds.iter().map(|t| t.metric).collect();
        assert_eq!(metrics, vec![Metric::Memory, Metric::Gpu]);
        let mem = &thresholds[0];
        assert_eq!(mem.warning_pct, 60.0);
        assert_eq!(mem.critical_pct, 80.0);
        assert_eq!(mem.base_interval, Duration::from_secs(5));
        assert_eq!(mem.fast_interval, Duration::from_secs(1));
    }

    #[test]
    fn lifecycle_settings_resolve() {
        let cfg = ClusterConfig::from_yaml_str(SAMPLE).unwrap();
        let lc = cfg.lifecycle_settings();
        assert_eq!(lc.base_delay, Duration::from_secs(2));
        assert_eq!(lc.max_delay, Duration::from_secs(30));
        assert_eq!(lc.max_retries, 5);
    }

    #[test]
    fn validate_reports_every_problem() {
        let yaml = r#"
nodes:
  - id: A
    host: localhost
    ram_gb: 0
  - id: A
    host: ""
    ram_gb: 4
budget:
  safety_margin: 1.5
lifecycle:
  base_delay: soon
"#;
        let cfg = ClusterConfig::from_yaml_str(yaml).unwrap();
        let err = cfg.validate().unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 5, "{problems:?}");
    }

    #[test]
    fn toml_files_are_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(
            &path,
            "[[nodes]]\nid = \"A\"\nhost = \"localhost\"\nram_gb = 16.0\n",
        )
        .unwrap();
        let cfg = ClusterConfig::from_file(&path).unwrap();
        assert_eq!(cfg.nodes[0].ram_gb, 16.0);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ClusterConfig::from_file(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn batch_validation() {
        let mut a = InstanceSpec::new("a", 2.0);
        a.anti_affinity.push("a".to_string());
        let b = InstanceSpec::new("a", 0.0);
        let batch = InstanceBatch { instances: vec![a, b] };
        let ConfigError::Invalid(problems) = batch.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 3, "{problems:?}");
    }

    #[test]
    fn placement_overrides() {
        let map = parse_placement_overrides("a:n1, b:n2").unwrap();
        assert_eq!(map.get("a").map(String::as_str), Some("n1"));
        assert_eq!(map.get("b").map(String::as_str), Some("n2"));
        assert!(parse_placement_overrides("a").is_err());
        assert!(parse_placement_overrides("a:n1,a:n2").is_err());
        assert!(parse_placement_overrides("").unwrap().is_empty());
    }
}
