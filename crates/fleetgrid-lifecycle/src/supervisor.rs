//! Per-instance supervisor task.
//!
//! Every state change for an instance happens inside its supervisor, one
//! event at a time. Process exits, watchdog kills and stop requests arrive
//! as [`LifecycleEvent`]s; backoff and budget retries are timers owned by
//! the same loop, so a stop cancels them in the step that handles it.

use std::sync::Arc;

use fleet_core::{
    CrashReason, ExitOutcome, InstanceId, InstanceRuntimeState, LifecycleSettings,
    LifecycleState, Metric, ProcessHandle, epoch_secs,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::hooks::{InstanceHooks, Reservation};
use crate::machine::{CrashVerdict, InstanceLifecycle};

const EVENT_QUEUE_DEPTH: usize = 32;
const SIGKILL: i32 = 9;
const SIGKILL_EXIT_CODE: i32 = 137;

/// Input to a supervisor.
#[derive(Debug)]
pub enum LifecycleEvent {
    /// The process of `generation` exited.
    Exited { generation: u64, outcome: ExitOutcome },
    /// The process of `generation` can no longer be observed.
    Lost { generation: u64, message: String },
    /// A watchdog is about to stop the process of `generation`.
    WatchdogKill {
        generation: u64,
        metric: Metric,
        value: f64,
    },
    /// Explicit stop. Acknowledged with the final state, or
    /// [`LifecycleError::StopUnconfirmed`] when the process may still run.
    Stop {
        ack: oneshot::Sender<LifecycleResult<InstanceRuntimeState>>,
    },
}

/// Owner's side of a running supervisor.
pub struct SupervisorHandle {
    instance_id: InstanceId,
    events: mpsc::Sender<LifecycleEvent>,
    state: watch::Receiver<InstanceRuntimeState>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state(&self) -> InstanceRuntimeState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstanceRuntimeState> {
        self.state.clone()
    }

    pub async fn notify(&self, event: LifecycleEvent) -> LifecycleResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| LifecycleError::SupervisorGone(self.instance_id.clone()))
    }

    /// Stop the instance and wait until its budget is released, or held
    /// because the process could not be confirmed gone.
    pub async fn stop(&self) -> LifecycleResult<InstanceRuntimeState> {
        let (ack, done) = oneshot::channel();
        if self.events.send(LifecycleEvent::Stop { ack }).await.is_err() {
            // Supervisor already finished: the instance is terminal.
            return Ok(self.state());
        }
        done.await
            .map_err(|_| LifecycleError::SupervisorGone(self.instance_id.clone()))?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start supervising an instance whose budget is already reserved.
pub fn spawn_supervisor(
    instance_id: &str,
    reservation: Reservation,
    settings: LifecycleSettings,
    hooks: Arc<dyn InstanceHooks>,
) -> SupervisorHandle {
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let runtime =
        InstanceRuntimeState::initializing(instance_id, &reservation.node_id, reservation.ram_gb);
    let (state_tx, state_rx) = watch::channel(runtime.clone());

    let supervisor = Supervisor {
        machine: InstanceLifecycle::new(instance_id, &settings),
        settings,
        hooks,
        events_weak: events_tx.downgrade(),
        events_rx,
        state_tx,
        runtime,
        reservation: Some(reservation),
        pending_kill: None,
        timer: None,
        waiter: None,
    };
    let task = tokio::spawn(supervisor.run());

    SupervisorHandle {
        instance_id: instance_id.to_string(),
        events: events_tx,
        state: state_rx,
        task,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    /// Startup grace elapsed: check the process is alive.
    Confirm,
    /// Backoff elapsed: relaunch.
    Resurrect,
    /// Budget was unavailable: try to reserve again.
    BudgetRetry,
}

enum Wake {
    Event(Option<LifecycleEvent>),
    Timer(Timer),
}

struct PendingKill {
    generation: u64,
    metric: Metric,
    value: f64,
}

struct Supervisor {
    machine: InstanceLifecycle,
    settings: LifecycleSettings,
    hooks: Arc<dyn InstanceHooks>,
    events_weak: mpsc::WeakSender<LifecycleEvent>,
    events_rx: mpsc::Receiver<LifecycleEvent>,
    state_tx: watch::Sender<InstanceRuntimeState>,
    runtime: InstanceRuntimeState,
    reservation: Option<Reservation>,
    pending_kill: Option<PendingKill>,
    timer: Option<(Timer, Instant)>,
    /// Task waiting for the current process to exit.
    waiter: Option<JoinHandle<()>>,
}

impl Supervisor {
    fn id(&self) -> &str {
        &self.runtime.instance_id
    }

    async fn run(mut self) {
        self.launch().await;

        while !self.machine.state().is_terminal() {
            let wake = match self.timer {
                Some((kind, at)) => tokio::select! {
                    event = self.events_rx.recv() => Wake::Event(event),
                    _ = tokio::time::sleep_until(at) => Wake::Timer(kind),
                },
                None => Wake::Event(self.events_rx.recv().await),
            };

            match wake {
                Wake::Timer(kind) => {
                    self.timer = None;
                    match kind {
                        Timer::Confirm => self.confirm().await,
                        Timer::Resurrect | Timer::BudgetRetry => self.launch().await,
                    }
                }
                Wake::Event(Some(event)) => self.on_event(event).await,
                Wake::Event(None) => {
                    debug!(instance_id = %self.id(), "all handles dropped, supervisor exiting");
                    break;
                }
            }
        }

        self.stop_waiter();
        debug!(instance_id = %self.id(), state = %self.machine.state(), "supervisor finished");
    }

    /// Reserve if needed, then launch a new generation.
    async fn launch(&mut self) {
        if self.reservation.is_none() {
            let previous = self.runtime.assigned_node.clone();
            match self.hooks.reserve(self.id(), previous.as_deref()).await {
                Ok(reservation) => self.reservation = Some(reservation),
                Err(e) => {
                    info!(
                        instance_id = %self.id(),
                        error = %e,
                        retry_in = ?self.settings.budget_retry_interval,
                        "cannot reserve budget for resurrection, will retry"
                    );
                    self.timer = Some((
                        Timer::BudgetRetry,
                        Instant::now() + self.settings.budget_retry_interval,
                    ));
                    return;
                }
            }
        }
        let Some(reservation) = self.reservation.clone() else {
            return;
        };

        let generation = match self.machine.begin_launch() {
            Ok(generation) => generation,
            Err(e) => {
                error!(instance_id = %self.id(), error = %e, "launch refused");
                return;
            }
        };
        self.runtime.assigned_node = Some(reservation.node_id.clone());
        self.runtime.ram_allocated_gb = reservation.ram_gb;

        match self.hooks.launch(self.id(), &reservation, generation).await {
            Ok(handle) => {
                info!(
                    instance_id = %self.id(),
                    node = %handle.node_id,
                    pid = handle.pid,
                    generation,
                    "worker launched"
                );
                self.runtime.started_at = Some(handle.started_at);
                self.runtime.process_handle = Some(handle.clone());
                self.spawn_waiter(handle);
                self.timer = Some((Timer::Confirm, Instant::now() + self.settings.startup_grace));
                self.publish().await;
            }
            Err(e) => {
                warn!(instance_id = %self.id(), generation, error = %e, "launch failed");
                let reason = CrashReason::LaunchFailed {
                    message: e.to_string(),
                };
                self.handle_crash(generation, reason, false).await;
            }
        }
    }

    async fn confirm(&mut self) {
        let Some(handle) = self.runtime.process_handle.clone() else {
            return;
        };
        match self.hooks.confirm_alive(&handle).await {
            Ok(true) => {
                if let Err(e) = self.machine.confirm_running(handle.generation) {
                    warn!(instance_id = %self.id(), error = %e, "cannot confirm instance");
                    return;
                }
                self.hooks.attach(&handle, self.runtime.ram_allocated_gb).await;
                self.publish().await;
            }
            Ok(false) => {
                debug!(instance_id = %self.id(), pid = handle.pid, "worker gone before confirmation");
            }
            Err(e) => {
                warn!(instance_id = %self.id(), error = %e, "liveness check failed, retrying");
                self.timer = Some((Timer::Confirm, Instant::now() + self.settings.startup_grace));
            }
        }
    }

    async fn on_event(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Exited { generation, outcome } => {
                if generation != self.machine.generation() {
                    debug!(instance_id = %self.id(), generation, "exit of an older generation");
                    return;
                }
                let kill = self
                    .pending_kill
                    .take()
                    .filter(|k| k.generation == generation);
                if let Some(kill) = kill {
                    let reason = CrashReason::WatchdogKill {
                        metric: kill.metric,
                        value: kill.value,
                        forced: outcome.signal == Some(SIGKILL)
                            || outcome.code == Some(SIGKILL_EXIT_CODE),
                    };
                    self.handle_crash(generation, reason, false).await;
                } else if let Some(reason) = CrashReason::from_exit(outcome) {
                    self.handle_crash(generation, reason, false).await;
                } else {
                    self.handle_clean_exit(generation).await;
                }
            }
            LifecycleEvent::Lost { generation, message } => {
                warn!(instance_id = %self.id(), generation, %message, "worker lost");
                self.handle_crash(generation, CrashReason::Lost, true).await;
            }
            LifecycleEvent::WatchdogKill {
                generation,
                metric,
                value,
            } => {
                if generation == self.machine.generation() {
                    info!(instance_id = %self.id(), generation, %metric, value, "watchdog kill pending");
                    self.pending_kill = Some(PendingKill {
                        generation,
                        metric,
                        value,
                    });
                }
            }
            LifecycleEvent::Stop { ack } => {
                let result = self.stop().await.map(|()| self.runtime.clone());
                let _ = ack.send(result);
            }
        }
    }

    /// Crash handling order: detach watchdogs, confirm the process is gone,
    /// release budget, record the crash, then schedule or give up. A lost
    /// process that cannot be confirmed gone has its budget held instead.
    async fn handle_crash(&mut self, generation: u64, reason: CrashReason, reap: bool) {
        if !self.machine.crash(generation) {
            return;
        }
        self.timer = None;
        self.pending_kill = None;
        self.runtime.last_crash_at = Some(epoch_secs());
        let handle = self.runtime.process_handle.take();
        let node_id = handle
            .as_ref()
            .map(|h| h.node_id.clone())
            .or_else(|| self.runtime.assigned_node.clone());

        warn!(
            instance_id = %self.id(),
            node = node_id.as_deref().unwrap_or("-"),
            generation,
            crash_count = self.machine.crash_count(),
            %reason,
            "instance crashed"
        );
        self.publish().await;

        self.hooks.detach(self.id()).await;
        let mut held = false;
        if reap {
            if let Some(handle) = &handle {
                if let Err(e) = self.hooks.reap(handle).await {
                    warn!(
                        instance_id = %self.id(),
                        pid = handle.pid,
                        error = %e,
                        "cannot confirm termination, holding its budget until reaped"
                    );
                    self.hooks.hold(handle).await;
                    held = true;
                }
            }
        }
        self.stop_waiter();
        if !held {
            self.hooks.release(self.id()).await;
        }
        self.reservation = None;
        self.runtime.ram_allocated_gb = 0.0;
        self.hooks
            .record_crash(self.id(), node_id.as_deref(), &reason, self.machine.crash_count())
            .await;

        match self.machine.decide(Instant::now()) {
            Ok(CrashVerdict::Resurrect { delay }) => {
                self.timer = Some((Timer::Resurrect, Instant::now() + delay));
            }
            Ok(CrashVerdict::Failed) => {
                error!(
                    instance_id = %self.id(),
                    crash_count = self.machine.crash_count(),
                    "instance failed permanently"
                );
            }
            Err(e) => error!(instance_id = %self.id(), error = %e, "crash bookkeeping failed"),
        }
        self.publish().await;
    }

    async fn handle_clean_exit(&mut self, generation: u64) {
        if !self.machine.exited_cleanly(generation) {
            return;
        }
        info!(instance_id = %self.id(), generation, "worker exited cleanly, marking stopped");
        self.timer = None;
        self.pending_kill = None;
        self.runtime.process_handle = None;
        self.hooks.detach(self.id()).await;
        self.hooks.release(self.id()).await;
        self.reservation = None;
        self.runtime.ram_allocated_gb = 0.0;
        self.publish().await;
    }

    async fn stop(&mut self) -> LifecycleResult<()> {
        let previous = self.machine.state();
        if !self.machine.stop() {
            return Ok(());
        }
        self.timer = None;
        self.pending_kill = None;
        self.hooks.detach(self.id()).await;
        let mut unconfirmed = None;
        if let Some(handle) = self.runtime.process_handle.take() {
            if let Err(e) = self.hooks.terminate(&handle).await {
                error!(
                    instance_id = %self.id(),
                    pid = handle.pid,
                    error = %e,
                    "stop not confirmed, holding its budget until reaped"
                );
                self.hooks.hold(&handle).await;
                unconfirmed = Some(e);
            }
        }
        self.stop_waiter();
        if unconfirmed.is_none() {
            self.hooks.release(self.id()).await;
        }
        self.reservation = None;
        self.runtime.ram_allocated_gb = 0.0;
        info!(instance_id = %self.id(), %previous, "instance stopped");
        self.publish().await;

        match unconfirmed {
            Some(e) => Err(LifecycleError::StopUnconfirmed {
                instance_id: self.id().to_string(),
                message: e.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn spawn_waiter(&mut self, handle: ProcessHandle) {
        self.stop_waiter();
        let Some(tx) = self.events_weak.upgrade() else {
            return;
        };
        let hooks = self.hooks.clone();
        self.waiter = Some(tokio::spawn(async move {
            let generation = handle.generation;
            let event = match hooks.wait_exit(&handle).await {
                Ok(outcome) => LifecycleEvent::Exited {
                    generation,
                    outcome,
                },
                Err(e) => LifecycleEvent::Lost {
                    generation,
                    message: e.to_string(),
                },
            };
            let _ = tx.send(event).await;
        }));
    }

    fn stop_waiter(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            waiter.abort();
        }
    }

    async fn publish(&mut self) {
        self.runtime.state = self.machine.state();
        self.runtime.crash_count = self.machine.crash_count();
        self.runtime.generation = self.machine.generation();
        self.state_tx.send_replace(self.runtime.clone());
        self.hooks.persist(&self.runtime).await;
    }
}
