//! Dispatches each call to the local or SSH executor based on the node.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{ExecutorSettings, ExitOutcome, InstanceSpec, Node, ProcessHandle};

use crate::error::ExecutorResult;
use crate::executor::{
    DeployReport, LogStream, NodeHealthReport, RemoteExecutor, Signal, StopOutcome,
};
use crate::local::LocalExecutor;
use crate::ssh::SshExecutor;

/// The executor FleetGrid uses in production.
///
/// Nodes whose host names this machine run through
/// [`LocalExecutor`]; everything else goes over SSH.
pub struct RoutingExecutor {
    local: LocalExecutor,
    ssh: SshExecutor,
}

impl RoutingExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            local: LocalExecutor::new(settings.clone()),
            ssh: SshExecutor::new(settings),
        }
    }

    fn pick(&self, node: &Node) -> &dyn RemoteExecutor {
        if node.is_local() { &self.local } else { &self.ssh }
    }
}

#[async_trait]
impl RemoteExecutor for RoutingExecutor {
    async fn deploy(&self, node: &Node, bundle: &Path) -> ExecutorResult<DeployReport> {
        self.pick(node).deploy(node, bundle).await
    }

    async fn start(
        &self,
        node: &Node,
        spec: &InstanceSpec,
        env: &BTreeMap<String, String>,
        generation: u64,
    ) -> ExecutorResult<ProcessHandle> {
        self.pick(node).start(node, spec, env, generation).await
    }

    async fn health_check(&self, node: &Node) -> ExecutorResult<NodeHealthReport> {
        self.pick(node).health_check(node).await
    }

    fn stream_logs(&self, node: &Node, instance_id: &str) -> LogStream {
        self.pick(node).stream_logs(node, instance_id)
    }

    async fn signal(&self, node: &Node, pid: u32, signal: Signal) -> ExecutorResult<()> {
        self.pick(node).signal(node, pid, signal).await
    }

    async fn is_alive(&self, node: &Node, pid: u32) -> ExecutorResult<bool> {
        self.pick(node).is_alive(node, pid).await
    }

    async fn wait_exit(&self, node: &Node, handle: &ProcessHandle) -> ExecutorResult<ExitOutcome> {
        self.pick(node).wait_exit(node, handle).await
    }

    async fn process_rss_kb(&self, node: &Node, pid: u32) -> ExecutorResult<Option<u64>> {
        self.pick(node).process_rss_kb(node, pid).await
    }

    async fn run(&self, node: &Node, command: &str) -> ExecutorResult<String> {
        self.pick(node).run(node, command).await
    }

    async fn stop(
        &self,
        node: &Node,
        handle: &ProcessHandle,
        graceful_timeout: Duration,
    ) -> ExecutorResult<StopOutcome> {
        self.pick(node).stop(node, handle, graceful_timeout).await
    }
}
