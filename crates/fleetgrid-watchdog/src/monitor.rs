//! Watchdog monitor: background polling loops per (target, metric).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{InstanceId, Metric, Node, NodeId, WatchdogThreshold, epoch_secs};
use fleetgrid_executor::{ExecutorResult, RemoteExecutor, Signal};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SampleError;
use crate::sampler::{GpuSampler, InstanceTarget, MemorySampler, ThermalSampler, UsageSampler};
use crate::tracker::{KillDecision, ThresholdTracker, Verdict};

/// What a watchdog loop observes.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchTarget {
    Instance(InstanceTarget),
    Node(Node),
}

impl WatchTarget {
    pub fn node(&self) -> &Node {
        match self {
            WatchTarget::Instance(t) => &t.node,
            WatchTarget::Node(node) => node,
        }
    }

    fn key(&self) -> String {
        match self {
            WatchTarget::Instance(t) => t.instance_id.clone(),
            WatchTarget::Node(node) => node_key(&node.node_id),
        }
    }
}

fn node_key(node_id: &str) -> String {
    format!("node:{node_id}")
}

/// The single instance a kill is aimed at.
#[derive(Debug, Clone, PartialEq)]
pub struct Victim {
    pub instance_id: InstanceId,
    pub generation: u64,
    pub node: Node,
    pub pid: u32,
}

impl From<&InstanceTarget> for Victim {
    fn from(t: &InstanceTarget) -> Self {
        Self {
            instance_id: t.instance_id.clone(),
            generation: t.generation,
            node: t.node.clone(),
            pid: t.pid,
        }
    }
}

/// Notification for every threshold crossing.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogEvent {
    Warning {
        instance_id: Option<InstanceId>,
        node_id: NodeId,
        metric: Metric,
        value: f64,
        timestamp: u64,
    },
    Spike {
        instance_id: Option<InstanceId>,
        node_id: NodeId,
        metric: Metric,
        from: f64,
        to: f64,
        timestamp: u64,
    },
    /// Sent before the graceful stop, so the owner can attribute the exit.
    Kill(KillDecision),
}

/// Everything a watchdog loop needs from the rest of the system.
#[async_trait]
pub trait KillSwitch: Send + Sync {
    /// Instance to sacrifice for a node-scoped breach, if any runs there.
    async fn victim_on(&self, node: &Node) -> Option<Victim>;

    /// Deliver an event. Returns once it is queued with its consumer.
    async fn notify(&self, event: WatchdogEvent);

    async fn signal(&self, victim: &Victim, signal: Signal) -> ExecutorResult<()>;

    async fn is_alive(&self, victim: &Victim) -> ExecutorResult<bool>;
}

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MonitorSlot {
    fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

type SlotKey = (String, Metric);

/// Owns every watchdog loop in the cluster.
pub struct WatchdogMonitor {
    thresholds: HashMap<Metric, WatchdogThreshold>,
    samplers: HashMap<Metric, Arc<dyn UsageSampler>>,
    kill_switch: Arc<dyn KillSwitch>,
    monitors: Arc<RwLock<HashMap<SlotKey, MonitorSlot>>>,
}

impl WatchdogMonitor {
    /// Only metrics present in `thresholds` are ever watched.
    pub fn new(thresholds: Vec<WatchdogThreshold>, kill_switch: Arc<dyn KillSwitch>) -> Self {
        Self {
            thresholds: thresholds.into_iter().map(|t| (t.metric, t)).collect(),
            samplers: HashMap::new(),
            kill_switch,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn UsageSampler>) -> Self {
        self.samplers.insert(sampler.metric(), sampler);
        self
    }

    /// Register the memory, GPU and thermal samplers backed by `executor`.
    pub fn with_executor_samplers(self, executor: Arc<dyn RemoteExecutor>) -> Self {
        self.with_sampler(Arc::new(MemorySampler::new(executor.clone())))
            .with_sampler(Arc::new(GpuSampler::new(executor.clone())))
            .with_sampler(Arc::new(ThermalSampler::new(executor)))
    }

    /// Start the process-scoped loops for a freshly confirmed instance.
    ///
    /// Replaces loops left over from an earlier generation.
    pub async fn watch_instance(&self, target: InstanceTarget) {
        let gpu = target.gpu;
        let target = WatchTarget::Instance(target);
        self.start(&target, Metric::Memory).await;
        if gpu {
            self.start(&target, Metric::Gpu).await;
        }
    }

    pub async fn unwatch_instance(&self, instance_id: &str) {
        let mut monitors = self.monitors.write().await;
        for metric in [Metric::Memory, Metric::Gpu] {
            if let Some(slot) = monitors.remove(&(instance_id.to_string(), metric)) {
                slot.stop();
                debug!(%instance_id, %metric, "watchdog detached");
            }
        }
    }

    pub async fn watch_node(&self, node: Node) {
        self.start(&WatchTarget::Node(node), Metric::Thermal).await;
    }

    pub async fn unwatch_node(&self, node_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(&(node_key(node_id), Metric::Thermal)) {
            slot.stop();
            debug!(node = %node_id, "thermal watchdog detached");
        }
    }

    /// Stop all loops (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        let count = monitors.len();
        for (_, slot) in monitors.drain() {
            slot.stop();
        }
        info!(count, "all watchdogs stopped");
    }

    pub async fn active_monitors(&self) -> Vec<(String, Metric)> {
        let monitors = self.monitors.read().await;
        let mut keys: Vec<_> = monitors.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn is_watching(&self, key: &str, metric: Metric) -> bool {
        self.monitors
            .read()
            .await
            .contains_key(&(key.to_string(), metric))
    }

    async fn start(&self, target: &WatchTarget, metric: Metric) {
        let (Some(threshold), Some(sampler)) =
            (self.thresholds.get(&metric), self.samplers.get(&metric))
        else {
            return;
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_watch_loop(
            target.clone(),
            threshold.clone(),
            sampler.clone(),
            self.kill_switch.clone(),
            shutdown_rx,
        ));

        let key = target.key();
        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert((key.clone(), metric), MonitorSlot { handle, shutdown_tx }) {
            old.stop();
        }
        info!(
            target = %key,
            node = %target.node().node_id,
            %metric,
            interval = ?threshold.base_interval,
            "watchdog started"
        );
    }
}

async fn run_watch_loop(
    target: WatchTarget,
    threshold: WatchdogThreshold,
    sampler: Arc<dyn UsageSampler>,
    kill_switch: Arc<dyn KillSwitch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let metric = threshold.metric;
    let key = target.key();
    let mut tracker = ThresholdTracker::new(threshold);

    loop {
        let interval = tracker.next_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                debug!(target = %key, %metric, "watchdog loop shutting down");
                break;
            }
        }

        let value = match sampler.sample(&target).await {
            Ok(value) => value,
            Err(SampleError::ProcessGone { pid }) => {
                debug!(target = %key, %metric, pid, "process gone, waiting for detach");
                tracker.reset();
                continue;
            }
            Err(e) => {
                warn!(target = %key, %metric, error = %e, "sample failed");
                tracker.reset();
                continue;
            }
        };

        let instance_id = match &target {
            WatchTarget::Instance(t) => Some(t.instance_id.clone()),
            WatchTarget::Node(_) => None,
        };
        let node_id = target.node().node_id.clone();

        match tracker.record(value) {
            Verdict::Quiet => {}
            Verdict::Warning => {
                kill_switch
                    .notify(WatchdogEvent::Warning {
                        instance_id,
                        node_id,
                        metric,
                        value,
                        timestamp: epoch_secs(),
                    })
                    .await;
            }
            Verdict::Spike { from, to } => {
                kill_switch
                    .notify(WatchdogEvent::Spike {
                        instance_id,
                        node_id,
                        metric,
                        from,
                        to,
                        timestamp: epoch_secs(),
                    })
                    .await;
            }
            Verdict::Critical => {
                enforce(&target, tracker.threshold(), value, sampler.as_ref(), kill_switch.as_ref())
                    .await;
                tracker.reset();
            }
        }
    }
}

/// Graceful stop, grace period, then force kill if still alive and still
/// over the critical level.
async fn enforce(
    target: &WatchTarget,
    threshold: &WatchdogThreshold,
    value: f64,
    sampler: &dyn UsageSampler,
    kill_switch: &dyn KillSwitch,
) {
    let victim = match target {
        WatchTarget::Instance(t) => Victim::from(t),
        WatchTarget::Node(node) => match kill_switch.victim_on(node).await {
            Some(victim) => victim,
            None => {
                warn!(
                    node = %node.node_id,
                    metric = %threshold.metric,
                    value,
                    "critical level on node without instances"
                );
                return;
            }
        },
    };

    warn!(
        instance_id = %victim.instance_id,
        node = %victim.node.node_id,
        metric = %threshold.metric,
        value,
        critical = threshold.critical_pct,
        "critical level reached, stopping instance"
    );
    kill_switch
        .notify(WatchdogEvent::Kill(KillDecision {
            instance_id: victim.instance_id.clone(),
            generation: victim.generation,
            node_id: victim.node.node_id.clone(),
            metric: threshold.metric,
            value,
            critical: threshold.critical_pct,
            timestamp: epoch_secs(),
        }))
        .await;

    if let Err(e) = kill_switch.signal(&victim, Signal::Terminate).await {
        warn!(instance_id = %victim.instance_id, error = %e, "graceful stop failed");
    }
    tokio::time::sleep(threshold.grace_period).await;

    match kill_switch.is_alive(&victim).await {
        Ok(false) => {
            debug!(instance_id = %victim.instance_id, "instance stopped within grace period");
            return;
        }
        Ok(true) => {}
        Err(e) => {
            warn!(instance_id = %victim.instance_id, error = %e, "cannot confirm instance stopped");
            return;
        }
    }

    // An unreadable sample after the grace period counts as still over.
    let still_over = match sampler.sample(target).await {
        Ok(now) => now >= threshold.critical_pct,
        Err(_) => true,
    };
    if !still_over {
        info!(
            instance_id = %victim.instance_id,
            metric = %threshold.metric,
            "usage dropped below critical during grace period, not forcing"
        );
        return;
    }

    warn!(instance_id = %victim.instance_id, pid = victim.pid, "force-killing instance");
    if let Err(e) = kill_switch.signal(&victim, Signal::Kill).await {
        warn!(instance_id = %victim.instance_id, error = %e, "force kill failed");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use fleet_core::{Credentials, NodeHealth};
    use tokio::time::Instant;

    use super::*;
    use crate::error::SampleResult;

    fn node(id: &str) -> Node {
        Node {
            node_id: id.to_string(),
            host: "10.0.0.5".to_string(),
            credentials: Credentials::default(),
            total_ram_gb: 32.0,
            gpu_available: false,
            max_instances: 4,
            health: NodeHealth::Healthy,
            last_heartbeat: None,
        }
    }

    fn instance(id: &str) -> InstanceTarget {
        InstanceTarget {
            instance_id: id.to_string(),
            generation: 1,
            node: node("n1"),
            pid: 4242,
            ram_allocated_gb: 8.0,
            gpu: false,
        }
    }

    fn threshold(metric: Metric) -> WatchdogThreshold {
        WatchdogThreshold {
            metric,
            warning_pct: 70.0,
            critical_pct: 85.0,
            base_interval: Duration::from_secs(5),
            fast_interval: Duration::from_secs(1),
            spike_delta_pct: Some(10.0),
            grace_period: Duration::from_secs(2),
        }
    }

    /// Replays scripted values, then repeats the last one.
    struct Scripted {
        metric: Metric,
        values: Mutex<VecDeque<f64>>,
        last: Mutex<f64>,
        calls: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(metric: Metric, values: &[f64]) -> Arc<Self> {
            Arc::new(Self {
                metric,
                values: Mutex::new(values.iter().copied().collect()),
                last: Mutex::new(0.0),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UsageSampler for Scripted {
        fn metric(&self) -> Metric {
            self.metric
        }

        async fn sample(&self, _target: &WatchTarget) -> SampleResult<f64> {
            self.calls.lock().unwrap().push(Instant::now());
            let mut last = self.last.lock().unwrap();
            if let Some(v) = self.values.lock().unwrap().pop_front() {
                *last = v;
            }
            Ok(*last)
        }
    }

    struct Failing;

    #[async_trait]
    impl UsageSampler for Failing {
        fn metric(&self) -> Metric {
            Metric::Memory
        }

        async fn sample(&self, _target: &WatchTarget) -> SampleResult<f64> {
            Err(SampleError::NoData("memory"))
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<WatchdogEvent>>,
        signals: Mutex<Vec<(String, Signal)>>,
        /// Whether the victim ignores SIGTERM.
        stubborn: bool,
        victim: Option<Victim>,
    }

    #[async_trait]
    impl KillSwitch for Recorder {
        async fn victim_on(&self, _node: &Node) -> Option<Victim> {
            self.victim.clone()
        }

        async fn notify(&self, event: WatchdogEvent) {
            self.events.lock().unwrap().push(event);
        }

        async fn signal(&self, victim: &Victim, signal: Signal) -> ExecutorResult<()> {
            self.signals
                .lock()
                .unwrap()
                .push((victim.instance_id.clone(), signal));
            Ok(())
        }

        async fn is_alive(&self, _victim: &Victim) -> ExecutorResult<bool> {
            let killed = self
                .signals
                .lock()
                .unwrap()
                .iter()
                .any(|(_, s)| *s == Signal::Kill);
            Ok(self.stubborn && !killed)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_interval_then_kill() {
        let sampler = Scripted::new(Metric::Memory, &[60.0, 75.0, 90.0, 10.0]);
        let switch = Arc::new(Recorder::default());
        let monitor = WatchdogMonitor::new(vec![threshold(Metric::Memory)], switch.clone())
            .with_sampler(sampler.clone());

        let start = Instant::now();
        monitor.watch_instance(instance("w-1")).await;
        tokio::time::sleep(Duration::from_secs(12)).await;

        let calls: Vec<Duration> = sampler
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|t| *t - start)
            .collect();
        // 60 at 5s, 75 at 10s (elevated), 90 one fast interval later
        assert_eq!(calls[0], Duration::from_secs(5));
        assert_eq!(calls[1], Duration::from_secs(10));
        assert_eq!(calls[2], Duration::from_secs(11));

        let events = switch.events.lock().unwrap().clone();
        assert!(matches!(
            &events[0],
            WatchdogEvent::Spike { from, to, .. } if *from == 60.0 && *to == 75.0
        ));
        assert!(matches!(
            &events[1],
            WatchdogEvent::Kill(KillDecision { instance_id, value, .. })
                if instance_id == "w-1" && *value == 90.0
        ));
        assert_eq!(
            switch.signals.lock().unwrap().as_slice(),
            &[("w-1".to_string(), Signal::Terminate)]
        );
        monitor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_process_is_force_killed() {
        let sampler = Scripted::new(Metric::Memory, &[95.0]);
        let switch = Arc::new(Recorder {
            stubborn: true,
            ..Recorder::default()
        });
        let monitor = WatchdogMonitor::new(vec![threshold(Metric::Memory)], switch.clone())
            .with_sampler(sampler);

        monitor.watch_instance(instance("w-1")).await;
        tokio::time::sleep(Duration::from_secs(8)).await;

        let signals = switch.signals.lock().unwrap().clone();
        assert_eq!(signals[0], ("w-1".to_string(), Signal::Terminate));
        assert_eq!(signals[1], ("w-1".to_string(), Signal::Kill));
        monitor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_during_grace_skips_force_kill() {
        let sampler = Scripted::new(Metric::Memory, &[95.0, 50.0]);
        let switch = Arc::new(Recorder {
            stubborn: true,
            ..Recorder::default()
        });
        let monitor = WatchdogMonitor::new(vec![threshold(Metric::Memory)], switch.clone())
            .with_sampler(sampler);

        monitor.watch_instance(instance("w-1")).await;
        tokio::time::sleep(Duration::from_secs(8)).await;
        monitor.unwatch_instance("w-1").await;

        let signals = switch.signals.lock().unwrap().clone();
        assert_eq!(signals, vec![("w-1".to_string(), Signal::Terminate)]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_data_never_kills() {
        let switch = Arc::new(Recorder::default());
        let monitor = WatchdogMonitor::new(vec![threshold(Metric::Memory)], switch.clone())
            .with_sampler(Arc::new(Failing));

        monitor.watch_instance(instance("w-1")).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(switch.signals.lock().unwrap().is_empty());
        assert!(switch.events.lock().unwrap().is_empty());
        monitor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn thermal_breach_kills_the_chosen_victim_only() {
        let sampler = Scripted::new(Metric::Thermal, &[92.0, 40.0]);
        let victim = Victim {
            instance_id: "big".to_string(),
            generation: 3,
            node: node("n1"),
            pid: 99,
        };
        let switch = Arc::new(Recorder {
            victim: Some(victim),
            ..Recorder::default()
        });
        let monitor = WatchdogMonitor::new(vec![threshold(Metric::Thermal)], switch.clone())
            .with_sampler(sampler);

        monitor.watch_node(node("n1")).await;
        tokio::time::sleep(Duration::from_secs(8)).await;

        let events = switch.events.lock().unwrap().clone();
        assert!(matches!(
            &events[0],
            WatchdogEvent::Kill(KillDecision { instance_id, generation: 3, .. }) if instance_id == "big"
        ));
        assert_eq!(
            switch.signals.lock().unwrap().as_slice(),
            &[("big".to_string(), Signal::Terminate)]
        );
        monitor.unwatch_node("n1").await;
        assert!(monitor.active_monitors().await.is_empty());
    }

    #[tokio::test]
    async fn gpu_loop_only_for_gpu_instances() {
        let switch = Arc::new(Recorder::default());
        let monitor = WatchdogMonitor::new(
            vec![threshold(Metric::Memory), threshold(Metric::Gpu)],
            switch,
        )
        .with_sampler(Scripted::new(Metric::Memory, &[]))
        .with_sampler(Scripted::new(Metric::Gpu, &[]));

        monitor.watch_instance(instance("cpu")).await;
        let mut gpu = instance("gpu");
        gpu.gpu = true;
        monitor.watch_instance(gpu).await;

        assert!(monitor.is_watching("cpu", Metric::Memory).await);
        assert!(!monitor.is_watching("cpu", Metric::Gpu).await);
        assert!(monitor.is_watching("gpu", Metric::Gpu).await);

        monitor.unwatch_instance("gpu").await;
        assert_eq!(
            monitor.active_monitors().await,
            vec![("cpu".to_string(), Metric::Memory)]
        );
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn disabled_metric_is_not_watched() {
        let switch = Arc::new(Recorder::default());
        let monitor = WatchdogMonitor::new(vec![], switch)
            .with_sampler(Scripted::new(Metric::Memory, &[]));
        monitor.watch_instance(instance("w-1")).await;
        assert!(monitor.active_monitors().await.is_empty());
    }
}
