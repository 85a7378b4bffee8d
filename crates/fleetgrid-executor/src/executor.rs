//! The `RemoteExecutor` seam and the worker launch contract.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{ExitOutcome, InstanceSpec, Node, ProcessHandle};
use futures_util::stream::BoxStream;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ExecutorResult};

/// Infinite stream of log lines. Reconnects on its own; ends only when dropped.
pub type LogStream = BoxStream<'static, String>;

/// Signals FleetGrid sends to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    pub fn as_raw(self) -> i32 {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Terminate => "TERM",
            Signal::Kill => "KILL",
        }
    }
}

/// Outcome of `health_check`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeHealthReport {
    pub healthy: bool,
    pub ram_available_gb: f64,
    /// One-minute load average.
    pub load: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    pub copied: usize,
    pub unchanged: usize,
}

/// How a `stop` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Process was already gone.
    NotRunning,
    /// Exited within the graceful timeout.
    Graceful,
    /// Needed SIGKILL.
    Forced,
}

/// Run-where-I-tell-you. One implementation per transport.
///
/// Every method is bounded by an explicit timeout inside the implementation.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Idempotent sync of `bundle` into the node's work directory.
    async fn deploy(&self, node: &Node, bundle: &Path) -> ExecutorResult<DeployReport>;

    /// Launch a worker. `generation` is recorded in the returned handle.
    async fn start(
        &self,
        node: &Node,
        spec: &InstanceSpec,
        env: &BTreeMap<String, String>,
        generation: u64,
    ) -> ExecutorResult<ProcessHandle>;

    async fn health_check(&self, node: &Node) -> ExecutorResult<NodeHealthReport>;

    fn stream_logs(&self, node: &Node, instance_id: &str) -> LogStream;

    async fn signal(&self, node: &Node, pid: u32, signal: Signal) -> ExecutorResult<()>;

    async fn is_alive(&self, node: &Node, pid: u32) -> ExecutorResult<bool>;

    /// Resolve once the process behind `handle` has exited.
    async fn wait_exit(&self, node: &Node, handle: &ProcessHandle) -> ExecutorResult<ExitOutcome>;

    /// Resident set size in KiB, `None` when the process is gone.
    async fn process_rss_kb(&self, node: &Node, pid: u32) -> ExecutorResult<Option<u64>>;

    /// Run a shell command on the node and return its stdout.
    async fn run(&self, node: &Node, command: &str) -> ExecutorResult<String>;

    /// SIGTERM, wait up to `graceful_timeout`, then SIGKILL.
    ///
    /// Fails with [`ExecutorError::StillAlive`] when the process survives
    /// the SIGKILL wait.
    async fn stop(
        &self,
        node: &Node,
        handle: &ProcessHandle,
        graceful_timeout: Duration,
    ) -> ExecutorResult<StopOutcome> {
        let pid = handle.pid;
        if !self.is_alive(node, pid).await? {
            return Ok(StopOutcome::NotRunning);
        }
        info!(instance_id = %handle.instance_id, node = %node.node_id, pid, "stopping worker");
        self.signal(node, pid, Signal::Terminate).await?;

        if wait_until_dead(self, node, pid, graceful_timeout).await? {
            debug!(instance_id = %handle.instance_id, pid, "worker exited gracefully");
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            instance_id = %handle.instance_id,
            pid,
            timeout = ?graceful_timeout,
            "graceful stop timed out, forcing kill"
        );
        self.signal(node, pid, Signal::Kill).await?;
        if !wait_until_dead(self, node, pid, FORCE_KILL_WAIT).await? {
            return Err(ExecutorError::StillAlive {
                node_id: node.node_id.clone(),
                pid,
            });
        }
        Ok(StopOutcome::Forced)
    }
}

const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);
const DEATH_POLL: Duration = Duration::from_millis(100);

/// Poll `is_alive` until the process is gone or `limit` elapses.
pub async fn wait_until_dead<E: RemoteExecutor + ?Sized>(
    executor: &E,
    node: &Node,
    pid: u32,
    limit: Duration,
) -> ExecutorResult<bool> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if !executor.is_alive(node, pid).await? {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(DEATH_POLL).await;
    }
}

/// Systemd-style unit name for an instance.
pub fn unit_name(instance_id: &str) -> String {
    format!("fleet-worker@{instance_id}")
}

/// Environment handed to every worker: the instance's own variables plus the
/// resource limits FleetGrid enforces.
pub fn worker_env(spec: &InstanceSpec, node: &Node, ram_limit_gb: f64) -> BTreeMap<String, String> {
    let mut env = spec.env.clone();
    env.insert("FLEET_INSTANCE_ID".to_string(), spec.instance_id.clone());
    env.insert("FLEET_NODE_ID".to_string(), node.node_id.clone());
    env.insert("FLEET_RAM_LIMIT_GB".to_string(), format!("{ram_limit_gb:.2}"));
    env.insert(
        "FLEET_GPU".to_string(),
        if spec.gpu_required { "1" } else { "0" }.to_string(),
    );
    env.insert("FLEET_UNIT".to_string(), unit_name(&spec.instance_id));
    env
}

/// Bound `fut` by `after`, mapping expiry to [`ExecutorError::Timeout`].
pub async fn with_timeout<T, F>(
    node: &Node,
    operation: &'static str,
    after: Duration,
    fut: F,
) -> ExecutorResult<T>
where
    F: Future<Output = ExecutorResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExecutorError::Timeout {
            node_id: node.node_id.clone(),
            operation,
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::{Credentials, NodeHealth};

    use super::*;

    fn node() -> Node {
        Node {
            node_id: "n1".to_string(),
            host: "localhost".to_string(),
            credentials: Credentials::default(),
            total_ram_gb: 16.0,
            gpu_available: true,
            max_instances: 2,
            health: NodeHealth::Healthy,
            last_heartbeat: None,
        }
    }

    #[test]
    fn worker_env_carries_limits() {
        let mut spec = InstanceSpec::new("w-1", 4.0);
        spec.gpu_required = true;
        spec.env.insert("MODEL".to_string(), "tiny".to_string());

        let env = worker_env(&spec, &node(), 6.0);
        assert_eq!(env["FLEET_INSTANCE_ID"], "w-1");
        assert_eq!(env["FLEET_NODE_ID"], "n1");
        assert_eq!(env["FLEET_RAM_LIMIT_GB"], "6.00");
        assert_eq!(env["FLEET_GPU"], "1");
        assert_eq!(env["FLEET_UNIT"], "fleet-worker@w-1");
        assert_eq!(env["MODEL"], "tiny");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_error() {
        let result: ExecutorResult<()> = with_timeout(&node(), "ping", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ExecutorError::Timeout { operation: "ping", .. })));
    }

    /// A process that ignores every signal.
    #[derive(Default)]
    struct Unkillable {
        signals: std::sync::Mutex<Vec<Signal>>,
    }

    #[async_trait]
    impl RemoteExecutor for Unkillable {
        async fn deploy(&self, _node: &Node, _bundle: &Path) -> ExecutorResult<DeployReport> {
            Ok(DeployReport::default())
        }

        async fn start(
            &self,
            _node: &Node,
            _spec: &InstanceSpec,
            _env: &BTreeMap<String, String>,
            _generation: u64,
        ) -> ExecutorResult<ProcessHandle> {
            unreachable!("not started in these tests")
        }

        async fn health_check(&self, _node: &Node) -> ExecutorResult<NodeHealthReport> {
            unreachable!("not checked in these tests")
        }

        fn stream_logs(&self, _node: &Node, _instance_id: &str) -> LogStream {
            Box::pin(futures_util::stream::empty::<String>())
        }

        async fn signal(&self, _node: &Node, _pid: u32, signal: Signal) -> ExecutorResult<()> {
            self.signals.lock().unwrap().push(signal);
            Ok(())
        }

        async fn is_alive(&self, _node: &Node, _pid: u32) -> ExecutorResult<bool> {
            Ok(true)
        }

        async fn wait_exit(
            &self,
            _node: &Node,
            _handle: &ProcessHandle,
        ) -> ExecutorResult<ExitOutcome> {
            std::future::pending().await
        }

        async fn process_rss_kb(&self, _node: &Node, _pid: u32) -> ExecutorResult<Option<u64>> {
            Ok(Some(1024))
        }

        async fn run(&self, _node: &Node, _command: &str) -> ExecutorResult<String> {
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_fails_when_kill_is_not_confirmed() {
        let exec = Unkillable::default();
        let handle = ProcessHandle {
            instance_id: "w-1".to_string(),
            node_id: "n1".to_string(),
            pid: 4242,
            generation: 1,
            started_at: 0,
        };

        let result = exec.stop(&node(), &handle, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(ExecutorError::StillAlive { ref node_id, pid: 4242 }) if node_id == "n1"
        ));
        assert_eq!(*exec.signals.lock().unwrap(), vec![Signal::Terminate, Signal::Kill]);
    }

    #[test]
    fn signal_numbers() {
        assert_eq!(Signal::Terminate.as_raw(), 15);
        assert_eq!(Signal::Kill.as_raw(), 9);
    }
}
