//! Budget requests and the structured pre-flight report.

use std::fmt;

use fleet_core::{InstanceId, InstanceSpec, NodeId};
use serde::Serialize;

/// One instance's memory demand, as seen by the pre-flight check.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetRequest {
    pub instance_id: InstanceId,
    /// Limit declared by the caller.
    pub declared_gb: f64,
    /// Model artifact size; scaled by the overhead factor into an estimate.
    pub artifact_size_gb: Option<f64>,
    /// Node the request is pinned to (manual placement or resurrection).
    pub node_id: Option<NodeId>,
}

impl BudgetRequest {
    pub fn from_spec(spec: &InstanceSpec) -> Self {
        Self {
            instance_id: spec.instance_id.clone(),
            declared_gb: spec.ram_required_gb,
            artifact_size_gb: spec.artifact_size_gb,
            node_id: None,
        }
    }

    pub fn on_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// `max(declared, artifact_size * overhead_factor)`.
    pub fn required_gb(&self, overhead_factor: f64) -> f64 {
        let estimated = self.artifact_size_gb.map_or(0.0, |a| a * overhead_factor);
        self.declared_gb.max(estimated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequirementLine {
    pub instance_id: InstanceId,
    pub declared_gb: f64,
    pub estimated_gb: Option<f64>,
    pub required_gb: f64,
    pub node_id: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ViolationScope {
    /// Requests pinned to one node exceed its free budget.
    Node(NodeId),
    /// Unpinned requests exceed the combined free budget of schedulable nodes.
    Cluster,
    /// A single request is larger than any node could ever hold.
    Instance(InstanceId),
}

impl fmt::Display for ViolationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationScope::Node(id) => write!(f, "node {id}"),
            ViolationScope::Cluster => f.write_str("cluster"),
            ViolationScope::Instance(id) => write!(f, "instance {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub scope: ViolationScope,
    pub required_gb: f64,
    pub usable_gb: f64,
    pub excess_gb: f64,
    pub hint: String,
}

/// Result of `BudgetManager::validate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetReport {
    pub safety_margin: f64,
    pub overhead_factor: f64,
    pub lines: Vec<RequirementLine>,
    pub total_required_gb: f64,
    /// Free budget across schedulable nodes at validation time.
    pub total_usable_gb: f64,
    pub violations: Vec<Violation>,
}

impl BudgetReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    /// Required RAM for one instance, if it was part of the request.
    pub fn required_for(&self, instance_id: &str) -> Option<f64> {
        self.lines
            .iter()
            .find(|l| l.instance_id == instance_id)
            .map(|l| l.required_gb)
    }
}

impl fmt::Display for BudgetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "budget: {:.1}GB required, {:.1}GB usable (margin {:.0}%, overhead x{:.2})",
            self.total_required_gb,
            self.total_usable_gb,
            self.safety_margin * 100.0,
            self.overhead_factor
        )?;
        for line in &self.lines {
            write!(f, "  {:<24} {:>7.1}GB", line.instance_id, line.required_gb)?;
            if let Some(est) = line.estimated_gb {
                write!(f, " (declared {:.1}GB, estimated {:.1}GB)", line.declared_gb, est)?;
            }
            if let Some(node) = &line.node_id {
                write!(f, " on {node}")?;
            }
            writeln!(f)?;
        }
        if self.violations.is_empty() {
            return writeln!(f, "  OK");
        }
        for v in &self.violations {
            writeln!(
                f,
                "  VIOLATION {}: {:.1}GB required > {:.1}GB usable, excess {:.1}GB",
                v.scope, v.required_gb, v.usable_gb, v.excess_gb
            )?;
            writeln!(f, "    hint: {}", v.hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_takes_the_larger_estimate() {
        let mut req = BudgetRequest::from_spec(&InstanceSpec::new("w", 4.0));
        assert_eq!(req.required_gb(1.5), 4.0);

        req.artifact_size_gb = Some(4.0);
        assert_eq!(req.required_gb(1.5), 6.0);

        req.artifact_size_gb = Some(1.0);
        assert_eq!(req.required_gb(1.5), 4.0);
    }

    #[test]
    fn on_node_pins_the_request() {
        let req = BudgetRequest::from_spec(&InstanceSpec::new("w", 4.0)).on_node("n1");
        assert_eq!(req.node_id.as_deref(), Some("n1"));
    }
}
