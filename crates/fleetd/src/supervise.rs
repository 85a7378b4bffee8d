//! `fleetd submit`: start a batch and supervise it until Ctrl-C.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use fleet_core::{InstanceBatch, parse_placement_overrides};
use fleetgrid_orchestrator::{ClusterOrchestrator, InstanceStatus, SubmitOptions, SubmitReport};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::load_config;

pub struct SubmitArgs {
    pub config: PathBuf,
    pub specs: PathBuf,
    pub placement: Option<String>,
    pub allow_partial: bool,
    pub status_port: Option<u16>,
    pub bundle: Option<PathBuf>,
    pub json: bool,
}

pub async fn run(args: SubmitArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let batch = InstanceBatch::from_file(&args.specs)
        .with_context(|| format!("loading instance specs {}", args.specs.display()))?;
    batch.validate()?;
    let overrides = match &args.placement {
        Some(s) => parse_placement_overrides(s)?,
        None => Default::default(),
    };

    let orchestrator = Arc::new(ClusterOrchestrator::from_config(&config)?);
    if let Some(bundle) = &args.bundle {
        deploy(&orchestrator, bundle).await?;
    }
    orchestrator.start().await;

    let options = SubmitOptions {
        overrides,
        allow_partial: args.allow_partial,
    };
    let report = match orchestrator.submit(batch.instances, options).await {
        Ok(report) => report,
        Err(e) => {
            orchestrator.shutdown().await;
            return Err(e.into());
        }
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_report(&report));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api = args.status_port.map(|port| {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let orchestrator = orchestrator.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let stopped = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = fleetgrid_api::serve(orchestrator, addr, stopped).await {
                error!(%addr, error = %e, "status API failed");
            }
        })
    });

    info!(instances = report.started.len(), "supervising; press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C, stopping now");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let finals = orchestrator.shutdown().await;
    if let Some(api) = api {
        let _ = api.await;
    }
    print!("{}", render_status(&finals));
    Ok(())
}

/// Deploy to every node; any failure aborts.
pub async fn deploy(orchestrator: &ClusterOrchestrator, bundle: &Path) -> anyhow::Result<()> {
    let results = orchestrator.deploy_all(bundle).await;
    let mut failed = Vec::new();
    for (node, result) in results {
        match result {
            Ok(report) => println!(
                "  {node:<16} {} copied, {} unchanged",
                report.copied, report.unchanged
            ),
            Err(e) => {
                println!("  {node:<16} FAILED: {e}");
                failed.push(node);
            }
        }
    }
    if !failed.is_empty() {
        bail!("deploy failed on {}", failed.join(", "));
    }
    Ok(())
}

fn render_report(report: &SubmitReport) -> String {
    let mut out = report.budget.to_string();
    out.push_str("placement:\n");
    for (id, assignment) in &report.plan.assignments {
        let how = match &assignment.score {
            Some(score) => format!("score {:.1}", score.score),
            None => "manual".to_string(),
        };
        out.push_str(&format!(
            "  {id:<24} -> {:<16} {:>6.1}GB  {how}\n",
            assignment.node_id, assignment.ram_gb
        ));
    }
    for failure in &report.plan.failures {
        out.push_str(&format!("  {failure}\n"));
    }
    out
}

fn render_status(rows: &[InstanceStatus]) -> String {
    let mut out = format!("{:<24} {:<13} {:>7} {:<16}\n", "INSTANCE", "STATE", "CRASHES", "NODE");
    for row in rows {
        out.push_str(&format!(
            "{:<24} {:<13} {:>7} {:<16}\n",
            row.instance_id,
            row.state.to_string(),
            row.crash_count,
            row.node_id.as_deref().unwrap_or("-"),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use fleet_core::LifecycleState;

    use super::*;

    #[test]
    fn status_table_has_one_row_per_instance() {
        let rows = vec![
            InstanceStatus {
                instance_id: "chat".to_string(),
                state: LifecycleState::Stopped,
                crash_count: 2,
                ram_allocated_gb: 0.0,
                node_id: Some("A".to_string()),
                generation: 3,
                pid: None,
            },
            InstanceStatus {
                instance_id: "embed".to_string(),
                state: LifecycleState::Failed,
                crash_count: 4,
                ram_allocated_gb: 0.0,
                node_id: None,
                generation: 4,
                pid: None,
            },
        ];
        let table = render_status(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("chat"));
        assert!(lines[2].contains('-'));
    }
}
