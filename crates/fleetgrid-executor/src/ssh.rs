//! Executor for remote nodes, driving the system `ssh` and `rsync` binaries.
//!
//! Workers are launched detached under `nohup`. A small wrapper shell
//! records the worker pid and, once it exits, its exit code into files
//! under `{work_dir}/run/`, so exits remain observable across SSH
//! reconnects.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{ExecutorSettings, ExitOutcome, InstanceSpec, Node, ProcessHandle, epoch_secs};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::{
    DeployReport, LogStream, NodeHealthReport, RemoteExecutor, Signal, with_timeout,
};
use crate::logs::{HISTORY_LINES, follow_command};

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(600);
const EXIT_POLL: Duration = Duration::from_secs(1);
/// Consecutive unreachable polls before `wait_exit` gives up.
const MAX_WAIT_FAILURES: u32 = 5;
const KB_PER_GB: f64 = 1024.0 * 1024.0;

pub struct SshExecutor {
    settings: ExecutorSettings,
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl SshExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }

    fn work_dir(&self) -> String {
        self.settings.work_dir.display().to_string()
    }

    fn ssh_options(&self, node: &Node) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout.as_secs().max(1)),
        ];
        if let Some(port) = node.credentials.port {
            opts.push("-p".to_string());
            opts.push(port.to_string());
        }
        if let Some(identity) = &node.credentials.identity_file {
            opts.push("-i".to_string());
            opts.push(identity.display().to_string());
        }
        opts
    }

    fn ssh_command(&self, node: &Node, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_options(node))
            .arg(node.ssh_destination())
            .arg(remote)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run `remote` over SSH, bounded by the command timeout.
    async fn exec(&self, node: &Node, operation: &'static str, remote: &str) -> ExecutorResult<String> {
        let mut cmd = self.ssh_command(node, remote);
        let output = with_timeout(node, operation, self.settings.command_timeout, async {
            cmd.output().await.map_err(|e| ExecutorError::Connection {
                node_id: node.node_id.clone(),
                message: format!("cannot run ssh: {e}"),
            })
        })
        .await?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(SSH_CONNECTION_FAILURE) => Err(ExecutorError::Connection {
                node_id: node.node_id.clone(),
                message: stderr,
            }),
            _ => Err(ExecutorError::CommandFailed {
                node_id: node.node_id.clone(),
                status: output.status.to_string(),
                stderr,
            }),
        }
    }

    fn run_file(&self, instance_id: &str, generation: u64, ext: &str) -> String {
        format!("{}/run/{instance_id}.{generation}.{ext}", self.work_dir())
    }

    fn log_file(&self, instance_id: &str) -> String {
        format!("{}/logs/{instance_id}.log", self.work_dir())
    }

    /// Shell script that launches the worker detached and prints its pid.
    pub(crate) fn launch_script(
        &self,
        spec: &InstanceSpec,
        env: &BTreeMap<String, String>,
        generation: u64,
    ) -> String {
        let pid_file = shell_quote(&self.run_file(&spec.instance_id, generation, "pid"));
        let exit_file = shell_quote(&self.run_file(&spec.instance_id, generation, "exit"));
        let log_file = shell_quote(&self.log_file(&spec.instance_id));
        let work_dir = shell_quote(&self.work_dir());

        let mut argv: Vec<String> = vec!["env".to_string()];
        argv.extend(env.iter().map(|(k, v)| shell_quote(&format!("{k}={v}"))));
        argv.extend(self.settings.worker_command.iter().map(|a| shell_quote(a)));
        argv.push(shell_quote(&spec.worker_config_ref));

        let inner = format!(
            "{} & echo $! > {pid_file}; wait $!; echo $? > {exit_file}",
            argv.join(" ")
        );
        format!(
            "mkdir -p {work_dir}/run {work_dir}/logs && cd {work_dir} && rm -f {pid_file} {exit_file} || exit 1; \
             nohup sh -c {} >> {log_file} 2>&1 < /dev/null & \
             i=0; while [ ! -s {pid_file} ] && [ $i -lt 50 ]; do sleep 0.1; i=$((i+1)); done; cat {pid_file}",
            shell_quote(&inner)
        )
    }
}

pub(crate) fn parse_pid(node: &Node, output: &str) -> ExecutorResult<u32> {
    output
        .trim()
        .parse::<u32>()
        .map_err(|_| ExecutorError::Parse {
            node_id: node.node_id.clone(),
            output: output.trim().to_string(),
        })
}

/// Parse `MemAvailable` (kB) and the 1-minute load average, one per line.
pub(crate) fn parse_health(node: &Node, output: &str) -> ExecutorResult<NodeHealthReport> {
    let parse_err = || ExecutorError::Parse {
        node_id: node.node_id.clone(),
        output: output.trim().to_string(),
    };
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let mem_kb: f64 = lines.next().and_then(|l| l.parse().ok()).ok_or_else(parse_err)?;
    let load: f64 = lines.next().and_then(|l| l.parse().ok()).ok_or_else(parse_err)?;
    Ok(NodeHealthReport {
        healthy: true,
        ram_available_gb: mem_kb / KB_PER_GB,
        load,
    })
}

/// Exit file contents: the shell's `$?`, empty if the wrapper never finished.
pub(crate) fn parse_exit(output: &str) -> ExitOutcome {
    output
        .trim()
        .parse::<i32>()
        .map(ExitOutcome::code)
        .unwrap_or_else(|_| ExitOutcome::unknown())
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn deploy(&self, node: &Node, bundle: &Path) -> ExecutorResult<DeployReport> {
        let target_dir = format!("{}/bundle", self.work_dir());
        self.exec(node, "deploy", &format!("mkdir -p {}", shell_quote(&target_dir)))
            .await?;

        let ssh = format!("ssh {}", self.ssh_options(node).join(" "));
        let mut cmd = Command::new("rsync");
        cmd.args(["-az", "--checksum", "--itemize-changes", "-e", &ssh])
            .arg(format!("{}/", bundle.display()))
            .arg(format!("{}:{}/", node.ssh_destination(), target_dir))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = with_timeout(node, "deploy", DEPLOY_TIMEOUT, async {
            cmd.output().await.map_err(ExecutorError::from)
        })
        .await?;
        if !output.status.success() {
            return Err(ExecutorError::Deploy {
                node_id: node.node_id.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let copied = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| l.starts_with("<f") || l.starts_with(">f"))
            .count();
        info!(node = %node.node_id, copied, "bundle deployed");
        Ok(DeployReport { copied, unchanged: 0 })
    }

    async fn start(
        &self,
        node: &Node,
        spec: &InstanceSpec,
        env: &BTreeMap<String, String>,
        generation: u64,
    ) -> ExecutorResult<ProcessHandle> {
        let script = self.launch_script(spec, env, generation);
        let output = self.exec(node, "start", &script).await?;
        let pid = parse_pid(node, &output).map_err(|_| ExecutorError::Spawn {
            instance_id: spec.instance_id.clone(),
            message: format!("worker did not report a pid: {:?}", output.trim()),
        })?;
        info!(
            instance_id = %spec.instance_id,
            node = %node.node_id,
            pid,
            generation,
            "remote worker started"
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
        let output = self
            .exec(
                node,
                "health_check",
                "awk '/MemAvailable/ {print $2}' /proc/meminfo; cut -d' ' -f1 /proc/loadavg",
            )
            .await?;
        parse_health(node, &output)
    }

    fn stream_logs(&self, node: &Node, instance_id: &str) -> LogStream {
        let log_file = shell_quote(&self.log_file(instance_id));
        let opts = self.ssh_options(node);
        let dest = node.ssh_destination();
        follow_command(format!("{}:{instance_id}", node.node_id), move |first| {
            let history = if first { HISTORY_LINES } else { 0 };
            let mut cmd = Command::new("ssh");
            cmd.args(&opts)
                .arg(&dest)
                .arg(format!("tail -n {history} -F {log_file}"));
            cmd
        })
    }

    async fn signal(&self, node: &Node, pid: u32, signal: Signal) -> ExecutorResult<()> {
        self.exec(
            node,
            "signal",
            &format!("kill -s {} {pid} 2>/dev/null; true", signal.name()),
        )
        .await?;
        debug!(node = %node.node_id, pid, signal = signal.name(), "signal sent");
        Ok(())
    }

    async fn is_alive(&self, node: &Node, pid: u32) -> ExecutorResult<bool> {
        let output = self
            .exec(
                node,
                "is_alive",
                &format!("kill -0 {pid} 2>/dev/null && echo alive || echo dead"),
            )
            .await?;
        Ok(output.trim() == "alive")
    }

    async fn wait_exit(&self, node: &Node, handle: &ProcessHandle) -> ExecutorResult<ExitOutcome> {
        let mut failures = 0;
        loop {
            match self.is_alive(node, handle.pid).await {
                Ok(true) => failures = 0,
                Ok(false) => break,
                Err(e) if e.is_connectivity() && failures + 1 < MAX_WAIT_FAILURES => {
                    failures += 1;
                    warn!(
                        instance_id = %handle.instance_id,
                        node = %node.node_id,
                        failures,
                        error = %e,
                        "lost contact while waiting for worker"
                    );
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(EXIT_POLL * (failures + 1)).await;
        }

        let exit_file = shell_quote(&self.run_file(&handle.instance_id, handle.generation, "exit"));
        // The wrapper writes the exit file right after the worker dies.
        let mut outcome = ExitOutcome::unknown();
        for _ in 0..3 {
            let output = self
                .exec(node, "wait_exit", &format!("cat {exit_file} 2>/dev/null; true"))
                .await?;
            outcome = parse_exit(&output);
            if outcome.code.is_some() {
                break;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
        Ok(outcome)
    }

    async fn process_rss_kb(&self, node: &Node, pid: u32) -> ExecutorResult<Option<u64>> {
        let output = self
            .exec(node, "process_rss", &format!("ps -o rss= -p {pid}; true"))
            .await?;
        Ok(output.trim().parse::<u64>().ok())
    }

    async fn run(&self, node: &Node, command: &str) -> ExecutorResult<String> {
        self.exec(node, "run", command).await
    }
}
