//! Usage samplers, one per resource class.
//!
//! Memory and GPU are measured for a single worker process. Thermal is
//! measured for the whole node.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{InstanceId, Metric, Node};
use fleetgrid_executor::RemoteExecutor;

use crate::error::{SampleError, SampleResult};
use crate::monitor::WatchTarget;

const KB_PER_GB: f64 = 1024.0 * 1024.0;

/// A running instance as seen by its watchdogs.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTarget {
    pub instance_id: InstanceId,
    pub generation: u64,
    pub node: Node,
    pub pid: u32,
    pub ram_allocated_gb: f64,
    /// Whether the worker was placed for GPU use.
    pub gpu: bool,
}

#[async_trait]
pub trait UsageSampler: Send + Sync {
    fn metric(&self) -> Metric;

    /// Current usage: percent for memory and GPU, °C for thermal.
    async fn sample(&self, target: &WatchTarget) -> SampleResult<f64>;
}

/// RSS of the worker as a percentage of its allocated budget.
pub struct MemorySampler {
    executor: Arc<dyn RemoteExecutor>,
}

impl MemorySampler {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl UsageSampler for MemorySampler {
    fn metric(&self) -> Metric {
        Metric::Memory
    }

    async fn sample(&self, target: &WatchTarget) -> SampleResult<f64> {
        let WatchTarget::Instance(t) = target else {
            return Err(SampleError::WrongTarget);
        };
        let rss_kb = self
            .executor
            .process_rss_kb(&t.node, t.pid)
            .await?
            .ok_or(SampleError::ProcessGone { pid: t.pid })?;
        if t.ram_allocated_gb <= 0.0 {
            return Err(SampleError::NoData("memory budget"));
        }
        Ok(rss_kb as f64 / KB_PER_GB / t.ram_allocated_gb * 100.0)
    }
}

const NVIDIA_SMI: &str = "nvidia-smi --query-compute-apps=pid,used_memory --format=csv,noheader,nounits; \
     echo ---; nvidia-smi --query-gpu=memory.total --format=csv,noheader,nounits";

/// GPU memory held by the worker as a percentage of total device memory.
pub struct GpuSampler {
    executor: Arc<dyn RemoteExecutor>,
}

impl GpuSampler {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }
}

/// Parse the combined `nvidia-smi` output. Memory is in MiB.
///
/// Usage is summed over every device the process appears on and divided by
/// the summed capacity of all devices.
pub fn parse_gpu_usage(output: &str, pid: u32) -> SampleResult<f64> {
    let (apps, totals) = output
        .split_once("---")
        .ok_or_else(|| SampleError::Parse(output.trim().to_string()))?;

    let total_mib: f64 = totals
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.parse::<f64>().map_err(|_| SampleError::Parse(l.to_string())))
        .sum::<SampleResult<f64>>()?;
    if total_mib <= 0.0 {
        return Err(SampleError::NoData("gpu"));
    }

    let mut used_mib = 0.0;
    for line in apps.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split(',').map(str::trim);
        let (Some(p), Some(mem)) = (fields.next(), fields.next()) else {
            return Err(SampleError::Parse(line.to_string()));
        };
        if p.parse::<u32>().ok() == Some(pid) {
            used_mib += mem
                .parse::<f64>()
                .map_err(|_| SampleError::Parse(line.to_string()))?;
        }
    }
    Ok(used_mib / total_mib * 100.0)
}

#[async_trait]
impl UsageSampler for GpuSampler {
    fn metric(&self) -> Metric {
        Metric::Gpu
    }

    async fn sample(&self, target: &WatchTarget) -> SampleResult<f64> {
        let WatchTarget::Instance(t) = target else {
            return Err(SampleError::WrongTarget);
        };
        let output = self.executor.run(&t.node, NVIDIA_SMI).await?;
        parse_gpu_usage(&output, t.pid)
    }
}

/// Hottest thermal zone on the node, in °C.
pub struct ThermalSampler {
    executor: Arc<dyn RemoteExecutor>,
}

impl ThermalSampler {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }
}

/// Parse millidegree readings, one zone per line.
pub fn parse_max_temperature(output: &str) -> SampleResult<f64> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            l.parse::<f64>()
                .map(|milli| milli / 1000.0)
                .map_err(|_| SampleError::Parse(l.to_string()))
        })
        .try_fold(None, |max: Option<f64>, t| {
            let t = t?;
            Ok::<_, SampleError>(Some(max.map_or(t, |m| m.max(t))))
        })?
        .ok_or(SampleError::NoData("thermal"))
}

#[async_trait]
impl UsageSampler for ThermalSampler {
    fn metric(&self) -> Metric {
        Metric::Thermal
    }

    async fn sample(&self, target: &WatchTarget) -> SampleResult<f64> {
        let output = self
            .executor
            .run(target.node(), "cat /sys/class/thermal/thermal_zone*/temp 2>/dev/null; true")
            .await?;
        parse_max_temperature(&output)
    }
}
