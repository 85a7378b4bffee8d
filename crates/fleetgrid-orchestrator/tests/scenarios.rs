//! End-to-end orchestrator scenarios against an in-memory executor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{
    Credentials, CrashReason, ExitOutcome, InstanceSpec, LifecycleState, Metric, Node, NodeHealth,
    ProcessHandle,
};
use fleetgrid_executor::{
    DeployReport, ExecutorError, ExecutorResult, LogStream, NodeHealthReport, RemoteExecutor,
    Signal,
};
use fleetgrid_lifecycle::LifecycleError;
use fleetgrid_orchestrator::{
    ClusterOrchestrator, InstanceStatus, OrchestratorError, OrchestratorSettings, SubmitOptions,
};
use fleetgrid_state::StateStore;
use futures_util::StreamExt;
use tokio::sync::watch;

const GB_KB: f64 = 1024.0 * 1024.0;

struct FakeProcess {
    exit: watch::Sender<Option<ExitOutcome>>,
    rss_kb: u64,
}

/// Processes live in memory. SIGTERM exits with 0, SIGKILL with signal 9.
#[derive(Default)]
struct FakeExecutor {
    next_pid: AtomicU32,
    procs: Mutex<HashMap<u32, FakeProcess>>,
    starts: Mutex<Vec<(String, String, u64)>>,
    signals: Mutex<Vec<(u32, Signal)>>,
    down: Mutex<HashSet<String>>,
    /// Free system memory per node; defaults to the node's total.
    available_gb: Mutex<HashMap<String, f64>>,
}

impl FakeExecutor {
    fn exit(&self, pid: u32, outcome: ExitOutcome) {
        if let Some(p) = self.procs.lock().unwrap().get(&pid) {
            p.exit.send_replace(Some(outcome));
        }
    }

    fn set_rss_gb(&self, pid: u32, gb: f64) {
        if let Some(p) = self.procs.lock().unwrap().get_mut(&pid) {
            p.rss_kb = (gb * GB_KB) as u64;
        }
    }

    fn take_down(&self, node_id: &str) {
        self.down.lock().unwrap().insert(node_id.to_string());
    }

    fn bring_up(&self, node_id: &str) {
        self.down.lock().unwrap().remove(node_id);
    }

    fn set_available_gb(&self, node_id: &str, gb: f64) {
        self.available_gb
            .lock()
            .unwrap()
            .insert(node_id.to_string(), gb);
    }

    fn reachable(&self, node: &Node) -> ExecutorResult<()> {
        if self.down.lock().unwrap().contains(&node.node_id) {
            return Err(ExecutorError::Connection {
                node_id: node.node_id.clone(),
                message: "no route to host".to_string(),
            });
        }
        Ok(())
    }

    fn starts(&self) -> Vec<(String, String, u64)> {
        self.starts.lock().unwrap().clone()
    }

    fn signals(&self) -> Vec<(u32, Signal)> {
        self.signals.lock().unwrap().clone()
    }

    fn alive(&self, pid: u32) -> bool {
        self.procs
            .lock()
            .unwrap()
            .get(&pid)
            .is_some_and(|p| p.exit.borrow().is_none())
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn deploy(&self, node: &Node, _bundle: &Path) -> ExecutorResult<DeployReport> {
        self.reachable(node)?;
        Ok(DeployReport {
            copied: 1,
            unchanged: 0,
        })
    }

    async fn start(
        &self,
        node: &Node,
        spec: &InstanceSpec,
        env: &BTreeMap<String, String>,
        generation: u64,
    ) -> ExecutorResult<ProcessHandle> {
        self.reachable(node)?;
        assert_eq!(env.get("FLEET_NODE_ID"), Some(&node.node_id));
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (exit, _) = watch::channel(None);
        self.procs.lock().unwrap().insert(
            pid,
            FakeProcess {
                exit,
                rss_kb: GB_KB as u64,
            },
        );
        self.starts.lock().unwrap().push((
            spec.instance_id.clone(),
            node.node_id.clone(),
            generation,
        ));
        Ok(ProcessHandle {
            instance_id: spec.instance_id.clone(),
            node_id: node.node_id.clone(),
            pid,
            generation,
            started_at: 0,
        })
    }

    async fn health_check(&self, node: &Node) -> ExecutorResult<NodeHealthReport> {
        self.reachable(node)?;
        let available = self.available_gb.lock().unwrap().get(&node.node_id).copied();
        Ok(NodeHealthReport {
            healthy: true,
            ram_available_gb: available.unwrap_or(node.total_ram_gb),
            load: 0.1,
        })
    }

    fn stream_logs(&self, _node: &Node, instance_id: &str) -> LogStream {
        futures_util::stream::iter(vec![format!("{instance_id} ready")]).boxed()
    }

    async fn signal(&self, node: &Node, pid: u32, signal: Signal) -> ExecutorResult<()> {
        self.reachable(node)?;
        self.signals.lock().unwrap().push((pid, signal));
        let outcome = match signal {
            Signal::Terminate => ExitOutcome::code(0),
            Signal::Kill => ExitOutcome::signal(9),
        };
        self.exit(pid, outcome);
        Ok(())
    }

    async fn is_alive(&self, node: &Node, pid: u32) -> ExecutorResult<bool> {
        self.reachable(node)?;
        Ok(self.alive(pid))
    }

    async fn wait_exit(&self, _node: &Node, handle: &ProcessHandle) -> ExecutorResult<ExitOutcome> {
        let mut rx = self
            .procs
            .lock()
            .unwrap()
            .get(&handle.pid)
            .map(|p| p.exit.subscribe())
            .ok_or_else(|| ExecutorError::Spawn {
                instance_id: handle.instance_id.clone(),
                message: "unknown pid".to_string(),
            })?;
        let outcome = rx.wait_for(Option::is_some).await.map(|o| *o);
        match outcome {
            Ok(Some(outcome)) => Ok(outcome),
            _ => Ok(ExitOutcome::unknown()),
        }
    }

    async fn process_rss_kb(&self, node: &Node, pid: u32) -> ExecutorResult<Option<u64>> {
        self.reachable(node)?;
        let procs = self.procs.lock().unwrap();
        Ok(procs
            .get(&pid)
            .filter(|p| p.exit.borrow().is_none())
            .map(|p| p.rss_kb))
    }

    async fn run(&self, node: &Node, _command: &str) -> ExecutorResult<String> {
        self.reachable(node)?;
        Ok(String::new())
    }
}

fn node(id: &str, ram_gb: f64, gpu: bool, max_instances: u32) -> Node {
    Node {
        node_id: id.to_string(),
        host: format!("{id}.fleet.internal"),
        credentials: Credentials::default(),
        total_ram_gb: ram_gb,
        gpu_available: gpu,
        max_instances,
        health: NodeHealth::Healthy,
        last_heartbeat: None,
    }
}

fn cluster(nodes: Vec<Node>) -> (ClusterOrchestrator, Arc<FakeExecutor>) {
    let fake = Arc::new(FakeExecutor::default());
    let orch = ClusterOrchestrator::new(
        nodes,
        OrchestratorSettings::default(),
        fake.clone(),
        StateStore::open_in_memory().unwrap(),
    );
    (orch, fake)
}

async fn wait_until(
    orch: &ClusterOrchestrator,
    instance_id: &str,
    pred: impl Fn(&InstanceStatus) -> bool,
) -> InstanceStatus {
    for _ in 0..4000 {
        if let Some(status) = orch.instance(instance_id).await {
            if pred(&status) {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{instance_id} never reached the expected state");
}

async fn running(orch: &ClusterOrchestrator, instance_id: &str, generation: u64) -> InstanceStatus {
    wait_until(orch, instance_id, |s| {
        s.state == LifecycleState::Running && s.generation == generation
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn gpu_and_anti_affinity_placement() {
    let (orch, fake) = cluster(vec![node("A", 64.0, true, 4), node("B", 8.0, false, 1)]);

    let mut gpu_req = InstanceSpec::new("gpu_req", 8.0);
    gpu_req.gpu_required = true;
    let mut cpu_only = InstanceSpec::new("cpu_only", 2.0);
    cpu_only.anti_affinity = vec!["gpu_req".to_string()];

    let report = orch
        .submit(vec![gpu_req, cpu_only], SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(report.plan.node_for("gpu_req"), Some("A"));
    assert_eq!(report.plan.node_for("cpu_only"), Some("B"));
    assert_eq!(report.started, vec!["cpu_only", "gpu_req"]);

    let status = running(&orch, "cpu_only", 1).await;
    assert_eq!(status.node_id.as_deref(), Some("B"));
    assert_eq!(status.ram_allocated_gb, 2.0);
    running(&orch, "gpu_req", 1).await;
    assert_eq!(fake.starts().len(), 2);

    let nodes = orch.nodes().await;
    assert_eq!(nodes[0].allocated_gb, 8.0);
    assert_eq!(nodes[1].instances, vec!["cpu_only"]);
}

#[tokio::test(start_paused = true)]
async fn over_budget_batch_starts_nothing() {
    let (orch, fake) = cluster(vec![node("solo", 32.0, false, 8)]);
    let specs = vec![
        InstanceSpec::new("w8", 8.0),
        InstanceSpec::new("w10", 10.0),
        InstanceSpec::new("w12", 12.0),
    ];

    let err = orch.submit(specs, SubmitOptions::default()).await.unwrap_err();
    let report = match err {
        OrchestratorError::ResourceExhaustion(report) => report,
        other => panic!("expected resource exhaustion, got {other}"),
    };
    assert_eq!(report.violations.len(), 1);
    assert!((report.violations[0].excess_gb - 2.8).abs() < 1e-6);
    assert!(report.to_string().contains("excess 2.8GB"));

    assert!(fake.starts().is_empty());
    assert!(orch.status().await.is_empty());
    assert_eq!(orch.nodes().await[0].allocated_gb, 0.0);
}

#[tokio::test(start_paused = true)]
async fn repeated_crashes_end_in_failed() {
    let (orch, fake) = cluster(vec![node("n1", 32.0, false, 4)]);
    orch.submit(vec![InstanceSpec::new("w", 4.0)], SubmitOptions::default())
        .await
        .unwrap();

    for generation in 1..=4 {
        let status = running(&orch, "w", generation).await;
        fake.exit(status.pid.unwrap(), ExitOutcome::code(1));
    }
    let status = wait_until(&orch, "w", |s| s.state == LifecycleState::Failed).await;
    assert_eq!(status.crash_count, 4);
    assert_eq!(status.ram_allocated_gb, 0.0);
    assert_eq!(orch.nodes().await[0].allocated_gb, 0.0);

    let events = orch.crash_events(Some("w")).unwrap();
    let counts: Vec<u32> = events.iter().map(|e| e.crash_count_after).collect();
    assert_eq!(counts, vec![1, 2, 3, 4]);
    assert!(events.iter().all(|e| e.reason == CrashReason::NonZeroExit { code: 1 }));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fake.starts().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn memory_watchdog_kills_only_the_offender() {
    let (orch, fake) = cluster(vec![node("n1", 32.0, false, 4)]);
    orch.submit(
        vec![InstanceSpec::new("hog", 4.0), InstanceSpec::new("calm", 4.0)],
        SubmitOptions::default(),
    )
    .await
    .unwrap();

    let hog = running(&orch, "hog", 1).await;
    let calm = running(&orch, "calm", 1).await;
    let hog_pid = hog.pid.unwrap();
    fake.set_rss_gb(hog_pid, 3.8);

    running(&orch, "hog", 2).await;

    let events = orch.crash_events(Some("hog")).unwrap();
    assert_eq!(events.len(), 1);
    match &events[0].reason {
        CrashReason::WatchdogKill {
            metric,
            value,
            forced,
        } => {
            assert_eq!(*metric, Metric::Memory);
            assert!(*value >= 85.0);
            assert!(!forced);
        }
        other => panic!("unexpected crash reason {other}"),
    }
    assert_eq!(fake.signals(), vec![(hog_pid, Signal::Terminate)]);

    let calm_now = orch.instance("calm").await.unwrap();
    assert_eq!(calm_now.state, LifecycleState::Running);
    assert_eq!(calm_now.pid, calm.pid);
    assert!(orch.crash_events(Some("calm")).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn partial_submission_is_opt_in() {
    let (orch, fake) = cluster(vec![node("cpu", 16.0, false, 4)]);
    let mut gpu = InstanceSpec::new("g", 4.0);
    gpu.gpu_required = true;
    let specs = vec![InstanceSpec::new("a", 4.0), gpu];

    let err = orch
        .submit(specs.clone(), SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PlacementInfeasible(ref f) if f[0].instance_id == "g"));
    assert!(fake.starts().is_empty());
    assert_eq!(orch.nodes().await[0].allocated_gb, 0.0);

    let report = orch
        .submit(
            specs,
            SubmitOptions {
                allow_partial: true,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.started, vec!["a"]);
    assert_eq!(report.plan.failures[0].instance_id, "g");
    running(&orch, "a", 1).await;
    assert!(orch.instance("g").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn duplicates_are_rejected() {
    let (orch, _fake) = cluster(vec![node("n1", 32.0, false, 4)]);

    let err = orch
        .submit(
            vec![InstanceSpec::new("a", 1.0), InstanceSpec::new("a", 1.0)],
            SubmitOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::DuplicateInstance(ref id) if id == "a"));

    orch.submit(vec![InstanceSpec::new("a", 1.0)], SubmitOptions::default())
        .await
        .unwrap();
    let err = orch
        .submit(vec![InstanceSpec::new("a", 1.0)], SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyManaged(_)));
}

#[tokio::test(start_paused = true)]
async fn manual_placement_pins_the_node() {
    let (orch, _fake) = cluster(vec![node("n1", 32.0, false, 4), node("n2", 32.0, false, 4)]);
    let overrides = BTreeMap::from([("a".to_string(), "n2".to_string())]);

    let report = orch
        .submit(
            vec![InstanceSpec::new("a", 2.0)],
            SubmitOptions {
                overrides,
                allow_partial: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(report.plan.node_for("a"), Some("n2"));
    assert!(report.plan.assignments["a"].score.is_none());
}

#[tokio::test(start_paused = true)]
async fn stop_releases_budget_and_allows_resubmission() {
    let (orch, fake) = cluster(vec![node("n1", 32.0, false, 4)]);
    orch.submit(vec![InstanceSpec::new("a", 4.0)], SubmitOptions::default())
        .await
        .unwrap();
    let status = running(&orch, "a", 1).await;

    let stopped = orch.stop("a").await.unwrap();
    assert_eq!(stopped.state, LifecycleState::Stopped);
    assert_eq!(orch.nodes().await[0].allocated_gb, 0.0);
    assert!(!fake.alive(status.pid.unwrap()));
    assert!(orch.active_watchdogs().await.is_empty());

    orch.submit(vec![InstanceSpec::new("a", 4.0)], SubmitOptions::default())
        .await
        .unwrap();
    running(&orch, "a", 1).await;

    assert!(matches!(
        orch.stop("nope").await,
        Err(OrchestratorError::InstanceNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn unreachable_node_relocates_its_instances() {
    let (orch, fake) = cluster(vec![node("n1", 32.0, false, 4), node("n2", 32.0, false, 4)]);
    orch.start().await;
    orch.submit(
        vec![InstanceSpec::new("a", 4.0)],
        SubmitOptions {
            overrides: BTreeMap::from([("a".to_string(), "n1".to_string())]),
            allow_partial: false,
        },
    )
    .await
    .unwrap();
    running(&orch, "a", 1).await;

    fake.take_down("n1");
    let moved = running(&orch, "a", 2).await;
    assert_eq!(moved.node_id.as_deref(), Some("n2"));

    let nodes = orch.nodes().await;
    assert_eq!(nodes[0].health, NodeHealth::Unreachable);
    // held until the old process is confirmed dead
    assert_eq!(nodes[0].allocated_gb, 4.0);
    assert_eq!(nodes[1].allocated_gb, 4.0);
    assert!(nodes[1].last_heartbeat.is_some());

    let events = orch.crash_events(Some("a")).unwrap();
    assert_eq!(events[0].reason, CrashReason::Lost);
    assert_eq!(events[0].node_id.as_deref(), Some("n1"));

    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn healed_partition_kills_the_stale_generation() {
    let (orch, fake) = cluster(vec![node("n1", 32.0, false, 4), node("n2", 32.0, false, 4)]);
    orch.start().await;
    orch.submit(
        vec![InstanceSpec::new("a", 4.0)],
        SubmitOptions {
            overrides: BTreeMap::from([("a".to_string(), "n1".to_string())]),
            allow_partial: false,
        },
    )
    .await
    .unwrap();
    let old_pid = running(&orch, "a", 1).await.pid.unwrap();

    fake.take_down("n1");
    let moved = running(&orch, "a", 2).await;
    assert_eq!(moved.node_id.as_deref(), Some("n2"));
    assert!(fake.alive(old_pid));
    assert_eq!(orch.nodes().await[0].allocated_gb, 4.0);

    fake.bring_up("n1");
    for _ in 0..600 {
        if orch.nodes().await[0].allocated_gb == 0.0 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let nodes = orch.nodes().await;
    assert_eq!(nodes[0].health, NodeHealth::Healthy);
    assert_eq!(nodes[0].allocated_gb, 0.0);
    assert!(nodes[0].allocated_gb.is_sign_positive());
    assert!(nodes[0].instances.is_empty());
    assert_eq!(nodes[1].allocated_gb, 4.0);
    assert!(!fake.alive(old_pid));
    assert!(fake.signals().contains(&(old_pid, Signal::Kill)));

    let current = orch.instance("a").await.unwrap();
    assert_eq!(current.state, LifecycleState::Running);
    assert_eq!(current.generation, 2);
    assert_eq!(current.pid, moved.pid);
    assert!(fake.alive(moved.pid.unwrap()));

    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_stop_keeps_budget_until_reaped() {
    let (orch, fake) = cluster(vec![node("n1", 32.0, false, 4)]);
    orch.submit(vec![InstanceSpec::new("a", 4.0)], SubmitOptions::default())
        .await
        .unwrap();
    let pid = running(&orch, "a", 1).await.pid.unwrap();

    fake.take_down("n1");
    let err = orch.stop("a").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Lifecycle(LifecycleError::StopUnconfirmed { ref instance_id, .. })
            if instance_id == "a"
    ));
    let status = orch.instance("a").await.unwrap();
    assert_eq!(status.state, LifecycleState::Stopped);
    assert_eq!(status.ram_allocated_gb, 0.0);
    assert!(fake.alive(pid));
    assert_eq!(orch.nodes().await[0].allocated_gb, 4.0);

    fake.bring_up("n1");
    orch.start().await;
    for _ in 0..100 {
        if !fake.alive(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(!fake.alive(pid));
    assert_eq!(fake.signals(), vec![(pid, Signal::Kill)]);
    assert_eq!(orch.nodes().await[0].allocated_gb, 0.0);

    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn first_submit_respects_live_memory() {
    let (orch, fake) = cluster(vec![node("n1", 32.0, false, 4)]);
    fake.set_available_gb("n1", 1.0);
    orch.start().await;

    let err = orch
        .submit(vec![InstanceSpec::new("big", 8.0)], SubmitOptions::default())
        .await
        .unwrap_err();
    let report = match err {
        OrchestratorError::ResourceExhaustion(report) => report,
        other => panic!("expected resource exhaustion, got {other}"),
    };
    assert_eq!(report.violations.len(), 1);
    assert!((report.violations[0].usable_gb - 1.0).abs() < 1e-6);
    assert!(fake.starts().is_empty());
    assert_eq!(orch.nodes().await[0].live_available_gb, Some(1.0));

    fake.set_available_gb("n1", 30.0);
    orch.submit(vec![InstanceSpec::new("big", 8.0)], SubmitOptions::default())
        .await
        .unwrap();
    running(&orch, "big", 1).await;

    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_everything() {
    let (orch, fake) = cluster(vec![node("n1", 32.0, false, 4)]);
    orch.start().await;
    orch.submit(
        vec![InstanceSpec::new("a", 4.0), InstanceSpec::new("b", 4.0)],
        SubmitOptions::default(),
    )
    .await
    .unwrap();
    running(&orch, "a", 1).await;
    running(&orch, "b", 1).await;

    let finals = orch.shutdown().await;
    assert_eq!(finals.len(), 2);
    assert!(finals.iter().all(|s| s.state == LifecycleState::Stopped));
    assert_eq!(orch.nodes().await[0].allocated_gb, 0.0);
    assert!(orch.active_watchdogs().await.is_empty());
    assert_eq!(
        fake.signals()
            .iter()
            .filter(|(_, s)| *s == Signal::Terminate)
            .count(),
        2
    );

    let err = orch
        .submit(vec![InstanceSpec::new("c", 1.0)], SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ShuttingDown));
}

#[tokio::test(start_paused = true)]
async fn logs_and_deploys_reach_the_executor() {
    let (orch, _fake) = cluster(vec![node("n1", 32.0, false, 4), node("n2", 16.0, false, 4)]);
    orch.submit(vec![InstanceSpec::new("a", 1.0)], SubmitOptions::default())
        .await
        .unwrap();
    running(&orch, "a", 1).await;

    let mut logs = orch.stream_logs("a").await.unwrap();
    assert_eq!(logs.next().await.as_deref(), Some("a ready"));

    let deploys = orch.deploy_all(Path::new("/srv/bundle")).await;
    assert_eq!(deploys.len(), 2);
    assert!(deploys.iter().all(|(_, r)| r.as_ref().is_ok_and(|d| d.copied == 1)));

    let checks = orch.health_check_all().await;
    assert!(checks.iter().all(|c| c.healthy));
}
