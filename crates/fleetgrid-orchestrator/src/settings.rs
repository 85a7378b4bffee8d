use fleet_core::{
    BudgetSettings, ClusterConfig, ExecutorSettings, HealthSettings, LifecycleSettings, Metric,
    WatchdogThreshold,
};
use fleetgrid_placement::ScoringWeights;

/// Everything the orchestrator needs from the cluster file, resolved.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub budget: BudgetSettings,
    pub lifecycle: LifecycleSettings,
    pub executor: ExecutorSettings,
    pub health: HealthSettings,
    /// Enabled watchdog classes only.
    pub thresholds: Vec<WatchdogThreshold>,
    pub weights: ScoringWeights,
}

impl OrchestratorSettings {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            budget: config.budget_settings(),
            lifecycle: config.lifecycle_settings(),
            executor: config.executor_settings(),
            health: config.health_settings(),
            thresholds: config.watchdog_thresholds(),
            weights: ScoringWeights::default(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            budget: BudgetSettings::default(),
            lifecycle: LifecycleSettings::default(),
            executor: ExecutorSettings::default(),
            health: HealthSettings::default(),
            thresholds: Metric::ALL
                .into_iter()
                .map(WatchdogThreshold::default_for)
                .collect(),
            weights: ScoringWeights::default(),
        }
    }
}
