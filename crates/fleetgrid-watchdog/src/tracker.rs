//! Threshold tracking for one watchdog loop.

use std::time::Duration;

use fleet_core::{InstanceId, Metric, NodeId, WatchdogThreshold};
use tracing::{debug, warn};

/// What a single sample means for the watched target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Below warning, or still elevated without a new crossing.
    Quiet,
    /// Just crossed `warning_pct` from below.
    Warning,
    /// Rose by more than `spike_delta_pct` since the previous sample.
    Spike { from: f64, to: f64 },
    /// At or above `critical_pct`; the kill policy applies.
    Critical,
}

/// A kill the watchdog has decided on, addressed to exactly one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct KillDecision {
    pub instance_id: InstanceId,
    pub generation: u64,
    pub node_id: NodeId,
    pub metric: Metric,
    pub value: f64,
    pub critical: f64,
    pub timestamp: u64,
}

/// Tracks consecutive samples for one (target, metric) pair.
#[derive(Debug)]
pub struct ThresholdTracker {
    threshold: WatchdogThreshold,
    last: Option<f64>,
    /// Above warning or recently spiked: poll at the fast interval.
    elevated: bool,
}

impl ThresholdTracker {
    pub fn new(threshold: WatchdogThreshold) -> Self {
        Self {
            threshold,
            last: None,
            elevated: false,
        }
    }

    pub fn threshold(&self) -> &WatchdogThreshold {
        &self.threshold
    }

    /// Record a sample and classify it.
    pub fn record(&mut self, value: f64) -> Verdict {
        let t = &self.threshold;
        let previous = self.last.replace(value);
        let spiked = match (previous, t.spike_delta_pct) {
            (Some(prev), Some(delta)) => value - prev > delta,
            _ => false,
        };

        if value >= t.critical_pct {
            self.elevated = true;
            return Verdict::Critical;
        }

        let was_elevated = self.elevated;
        if spiked {
            self.elevated = true;
            warn!(
                metric = %t.metric,
                from = previous.unwrap_or_default(),
                to = value,
                "usage spike"
            );
            return Verdict::Spike {
                from: previous.unwrap_or_default(),
                to: value,
            };
        }

        if value >= t.warning_pct {
            self.elevated = true;
            if !was_elevated {
                debug!(metric = %t.metric, value, warning = t.warning_pct, "warning level crossed");
                return Verdict::Warning;
            }
        } else {
            self.elevated = false;
        }
        Verdict::Quiet
    }

    /// Forget history after a kill or a failed sample.
    pub fn reset(&mut self) {
        self.last = None;
        self.elevated = false;
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }

    /// Delay before the next sample.
    pub fn next_interval(&self) -> Duration {
        if self.elevated {
            self.threshold.fast_interval
        } else {
            self.threshold.base_interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold() -> WatchdogThreshold {
        WatchdogThreshold {
            metric: Metric::Memory,
            warning_pct: 70.0,
            critical_pct: 85.0,
            base_interval: Duration::from_secs(5),
            fast_interval: Duration::from_secs(1),
            spike_delta_pct: Some(20.0),
            grace_period: Duration::from_secs(2),
        }
    }

    #[test]
    fn interval_follows_warning_level() {
        let mut tracker = ThresholdTracker::new(threshold());
        assert_eq!(tracker.record(60.0), Verdict::Quiet);
        assert_eq!(tracker.next_interval(), Duration::from_secs(5));

        assert_eq!(tracker.record(75.0), Verdict::Warning);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));

        // staying elevated is not a new crossing
        assert_eq!(tracker.record(78.0), Verdict::Quiet);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));

        assert_eq!(tracker.record(50.0), Verdict::Quiet);
        assert_eq!(tracker.next_interval(), Duration::from_secs(5));
    }

    #[test]
    fn critical_wins_over_spike() {
        let mut tracker = ThresholdTracker::new(threshold());
        tracker.record(40.0);
        assert_eq!(tracker.record(90.0), Verdict::Critical);
    }

    #[test]
    fn spike_below_warning_switches_to_fast_polling() {
        let mut tracker = ThresholdTracker::new(threshold());
        tracker.record(10.0);
        assert_eq!(tracker.record(35.0), Verdict::Spike { from: 10.0, to: 35.0 });
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn no_spike_without_history_or_delta() {
        let mut t = threshold();
        t.spike_delta_pct = None;
        let mut tracker = ThresholdTracker::new(t);
        tracker.record(0.0);
        assert_eq!(tracker.record(60.0), Verdict::Quiet);
    }

    #[test]
    fn reset_clears_history() {
        let mut tracker = ThresholdTracker::new(threshold());
        tracker.record(80.0);
        tracker.reset();
        assert_eq!(tracker.last(), None);
        assert_eq!(tracker.next_interval(), Duration::from_secs(5));
        // first sample after a reset cannot be a spike
        assert_eq!(tracker.record(60.0), Verdict::Quiet);
    }
}
