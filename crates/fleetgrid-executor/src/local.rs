//! Executor for workers on the orchestrator host itself.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{ExecutorSettings, ExitOutcome, InstanceSpec, Node, ProcessHandle, epoch_secs};
use sysinfo::{ProcessesToUpdate, System};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::deploy::sync_tree;
use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::{
    DeployReport, LogStream, NodeHealthReport, RemoteExecutor, Signal, with_timeout,
};
use crate::logs::{HISTORY_LINES, follow_command};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const FOREIGN_EXIT_POLL: Duration = Duration::from_secs(1);
const MAX_TRACKED_CHILDREN: usize = 256;

type ExitWatch = watch::Receiver<Option<ExitOutcome>>;

/// Spawns workers with `tokio::process` and reaps them in the background.
pub struct LocalExecutor {
    settings: ExecutorSettings,
    /// pid → exit status published by the reaper task.
    children: Arc<Mutex<HashMap<u32, ExitWatch>>>,
}

impl LocalExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            settings,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn log_path(&self, instance_id: &str) -> PathBuf {
        self.settings.work_dir.join("logs").join(format!("{instance_id}.log"))
    }

    fn bundle_dir(&self) -> PathBuf {
        self.settings.work_dir.join("bundle")
    }

    fn exit_watch(&self, pid: u32) -> Option<ExitWatch> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }

    fn track(&self, pid: u32, rx: ExitWatch) {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        if children.len() >= MAX_TRACKED_CHILDREN {
            children.retain(|_, rx| rx.borrow().is_none());
        }
        children.insert(pid, rx);
    }
}

fn exit_outcome(status: ExitStatus) -> ExitOutcome {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitOutcome::code(code),
        (None, Some(sig)) => ExitOutcome::signal(sig),
        (None, None) => ExitOutcome::unknown(),
    }
}

fn pid_exists(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

async fn blocking<T, F>(f: F) -> ExecutorResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ExecutorError::Io(std::io::Error::other(e)))
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn deploy(&self, node: &Node, bundle: &Path) -> ExecutorResult<DeployReport> {
        let src = bundle.to_path_buf();
        let dst = self.bundle_dir();
        let report = blocking(move || sync_tree(&src, &dst))
            .await?
            .map_err(|e| ExecutorError::Deploy {
                node_id: node.node_id.clone(),
                message: e.to_string(),
            })?;
        info!(node = %node.node_id, copied = report.copied, unchanged = report.unchanged, "bundle deployed");
        Ok(report)
    }

    async fn start(
        &self,
        node: &Node,
        spec: &InstanceSpec,
        env: &BTreeMap<String, String>,
        generation: u64,
    ) -> ExecutorResult<ProcessHandle> {
        let spawn_err = |message: String| ExecutorError::Spawn {
            instance_id: spec.instance_id.clone(),
            message,
        };
        let (program, args) = self
            .settings
            .worker_command
            .split_first()
            .ok_or_else(|| spawn_err("worker_command is empty".to_string()))?;

        let log_path = self.log_path(&spec.instance_id);
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::create_dir_all(&self.settings.work_dir)?;
        let stdout = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&spec.worker_config_ref)
            .envs(env)
            .current_dir(&self.settings.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let mut child = cmd.spawn().map_err(|e| spawn_err(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err("process exited before reporting a pid".to_string()))?;

        let (tx, rx) = watch::channel(None);
        let instance_id = spec.instance_id.clone();
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => exit_outcome(status),
                Err(e) => {
                    warn!(%instance_id, pid, error = %e, "failed to reap worker");
                    ExitOutcome::unknown()
                }
            };
            debug!(%instance_id, pid, %outcome, "worker reaped");
            let _ = tx.send(Some(outcome));
        });
        self.track(pid, rx);

        info!(
            instance_id = %spec.instance_id,
            node = %node.node_id,
            pid,
            generation,
            log = %log_path.display(),
            "worker started"
        );
        Ok(ProcessHandle {
            instance_id: spec.instance_id.clone(),
            node_id: node.node_id.clone(),
            pid,
            generation,
            started_at: epoch_secs(),
        })
    }

    async fn health_check(&self, node: &Node) -> ExecutorResult<NodeHealthReport> {
        with_timeout(node, "health_check", self.settings.command_timeout, async {
            blocking(|| {
                let mut sys = System::new();
                sys.refresh_memory();
                NodeHealthReport {
                    healthy: true,
                    ram_available_gb: sys.available_memory() as f64 / BYTES_PER_GB,
                    load: System::load_average().one,
                }
            })
            .await
        })
        .await
    }

    fn stream_logs(&self, _node: &Node, instance_id: &str) -> LogStream {
        let path = self.log_path(instance_id);
        follow_command(format!("local:{instance_id}"), move |first| {
            let history = if first { HISTORY_LINES } else { 0 };
            let mut cmd = Command::new("tail");
            cmd.arg("-n").arg(history.to_string()).arg("-F").arg(&path);
            cmd
        })
    }

    async fn signal(&self, node: &Node, pid: u32, signal: Signal) -> ExecutorResult<()> {
        // SAFETY: plain kill(2) on a pid we launched; no memory is shared.
        let ret = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!(node = %node.node_id, pid, "signal target already gone");
                return Ok(());
            }
            return Err(ExecutorError::Io(err));
        }
        debug!(node = %node.node_id, pid, signal = signal.name(), "signal sent");
        Ok(())
    }

    async fn is_alive(&self, _node: &Node, pid: u32) -> ExecutorResult<bool> {
        match self.exit_watch(pid) {
            Some(rx) => Ok(rx.borrow().is_none()),
            None => Ok(pid_exists(pid)),
        }
    }

    async fn wait_exit(&self, node: &Node, handle: &ProcessHandle) -> ExecutorResult<ExitOutcome> {
        match self.exit_watch(handle.pid) {
            Some(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(outcome) => Ok((*outcome).unwrap_or_else(ExitOutcome::unknown)),
                Err(_) => Ok(ExitOutcome::unknown()),
            },
            None => {
                // Not our child (adopted after a restart): poll for disappearance.
                while self.is_alive(node, handle.pid).await? {
                    tokio::time::sleep(FOREIGN_EXIT_POLL).await;
                }
                Ok(ExitOutcome::unknown())
            }
        }
    }

    async fn process_rss_kb(&self, node: &Node, pid: u32) -> ExecutorResult<Option<u64>> {
        if !self.is_alive(node, pid).await? {
            return Ok(None);
        }
        with_timeout(node, "process_rss", self.settings.command_timeout, async {
            blocking(move || {
                let mut sys = System::new();
                let spid = sysinfo::Pid::from_u32(pid);
                sys.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
                sys.process(spid).map(|p| p.memory() / 1024)
            })
            .await
        })
        .await
    }

    async fn run(&self, node: &Node, command: &str) -> ExecutorResult<String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).stdin(Stdio::null()).kill_on_drop(true);
        let output = with_timeout(node, "run", self.settings.command_timeout, async {
            cmd.output().await.map_err(ExecutorError::from)
        })
        .await?;
        if !output.status.success() {
            return Err(ExecutorError::CommandFailed {
                node_id: node.node_id.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
