//! Instance lifecycle state machine.
//!
//! ```text
//! INITIALIZING → RUNNING → CRASHED → RESURRECTING → RUNNING ...
//!                                  ↘ FAILED
//! any non-terminal state → STOPPED
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use fleet_core::{InstanceId, LifecycleSettings, LifecycleState};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, LifecycleResult};

/// Exponential resurrection delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// `min(base * 2^(crash_count - 1), max)`.
    pub fn delay(&self, crash_count: u32) -> Duration {
        let exp = crash_count.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// Sliding window of recent crashes.
#[derive(Debug, Clone)]
pub struct StartLimit {
    max_retries: u32,
    window: Duration,
    crashes: VecDeque<Instant>,
}

impl StartLimit {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            crashes: VecDeque::new(),
        }
    }

    /// Record a crash at `now`; true once more than `max_retries` crashes
    /// fall inside the window.
    pub fn record(&mut self, now: Instant) -> bool {
        self.crashes.push_back(now);
        while let Some(&oldest) = self.crashes.front() {
            if now.duration_since(oldest) > self.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.len() as u32 > self.max_retries
    }

    pub fn recent(&self) -> usize {
        self.crashes.len()
    }
}

/// What happens after a crash has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    Resurrect { delay: Duration },
    Failed,
}

#[derive(Debug)]
pub struct InstanceLifecycle {
    instance_id: InstanceId,
    state: LifecycleState,
    crash_count: u32,
    generation: u64,
    /// Generation whose crash was already handled.
    crashed: Option<u64>,
    backoff: Backoff,
    limit: StartLimit,
}

impl InstanceLifecycle {
    pub fn new(instance_id: &str, settings: &LifecycleSettings) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            state: LifecycleState::Initializing,
            crash_count: 0,
            generation: 0,
            crashed: None,
            backoff: Backoff {
                base: settings.base_delay,
                max: settings.max_delay,
            },
            limit: StartLimit::new(settings.max_retries, settings.retry_window),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }

    /// Generation of the most recent launch attempt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn invalid(&self, to: LifecycleState) -> LifecycleError {
        LifecycleError::InvalidTransition {
            instance_id: self.instance_id.clone(),
            from: self.state,
            to,
        }
    }

    /// Allocate the generation for a new launch attempt.
    pub fn begin_launch(&mut self) -> LifecycleResult<u64> {
        match self.state {
            LifecycleState::Initializing | LifecycleState::Resurrecting => {
                self.generation += 1;
                debug!(instance_id = %self.instance_id, generation = self.generation, "launch attempt");
                Ok(self.generation)
            }
            _ => Err(self.invalid(LifecycleState::Running)),
        }
    }

    /// The process of `generation` survived startup.
    pub fn confirm_running(&mut self, generation: u64) -> LifecycleResult<()> {
        if generation != self.generation {
            return Err(self.invalid(LifecycleState::Running));
        }
        match self.state {
            LifecycleState::Initializing | LifecycleState::Resurrecting => {
                self.state = LifecycleState::Running;
                info!(instance_id = %self.instance_id, generation, "instance running");
                Ok(())
            }
            _ => Err(self.invalid(LifecycleState::Running)),
        }
    }

    /// Move to CRASHED. Returns false for stale or duplicate notifications,
    /// which must be ignored.
    pub fn crash(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.crashed == Some(generation) {
            debug!(
                instance_id = %self.instance_id,
                generation,
                current = self.generation,
                "ignoring stale or duplicate crash"
            );
            return false;
        }
        match self.state {
            LifecycleState::Initializing | LifecycleState::Running | LifecycleState::Resurrecting => {
                self.state = LifecycleState::Crashed;
                self.crash_count += 1;
                self.crashed = Some(generation);
                true
            }
            _ => {
                debug!(instance_id = %self.instance_id, generation, state = %self.state, "crash already handled");
                false
            }
        }
    }

    /// Decide between resurrection and giving up. Only valid in CRASHED.
    pub fn decide(&mut self, now: Instant) -> LifecycleResult<CrashVerdict> {
        if self.state != LifecycleState::Crashed {
            return Err(self.invalid(LifecycleState::Resurrecting));
        }
        if self.limit.record(now) {
            self.state = LifecycleState::Failed;
            warn!(
                instance_id = %self.instance_id,
                crash_count = self.crash_count,
                recent = self.limit.recent(),
                "crash limit exceeded, giving up"
            );
            return Ok(CrashVerdict::Failed);
        }
        self.state = LifecycleState::Resurrecting;
        let delay = self.backoff.delay(self.crash_count);
        info!(
            instance_id = %self.instance_id,
            crash_count = self.crash_count,
            delay = ?delay,
            "resurrection scheduled"
        );
        Ok(CrashVerdict::Resurrect { delay })
    }

    /// A clean exit nobody asked for.
    pub fn exited_cleanly(&mut self, generation: u64) -> bool {
        let live = matches!(
            self.state,
            LifecycleState::Initializing | LifecycleState::Running | LifecycleState::Resurrecting
        );
        if generation != self.generation || !live || self.crashed == Some(generation) {
            return false;
        }
        self.state = LifecycleState::Stopped;
        true
    }

    /// Explicit stop. Returns false if already terminal.
    pub fn stop(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = LifecycleState::Stopped;
        true
    }
}
