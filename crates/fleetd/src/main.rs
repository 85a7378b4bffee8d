//! fleetd — the FleetGrid daemon and operator CLI.
//!
//! # Usage
//!
//! ```text
//! fleetd --config cluster.yaml validate-config
//! fleetd --config cluster.yaml health-check
//! fleetd --config cluster.yaml deploy-all ./bundle
//! fleetd --config cluster.yaml submit specs.yaml --placement chat:A --status-port 8610
//! ```

mod supervise;

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use fleet_core::ClusterConfig;
use fleetgrid_orchestrator::{ClusterOrchestrator, NodeCheck};
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid LLM worker orchestrator")]
struct Cli {
    /// Cluster file (YAML, or TOML by extension).
    #[arg(long, short, global = true, default_value = "fleetgrid.yaml")]
    config: PathBuf,

    /// Print machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate the cluster file.
    ValidateConfig,

    /// Check every node once and print a table. Fails if any node is unhealthy.
    HealthCheck,

    /// Sync an artifact bundle to every node.
    DeployAll {
        bundle: PathBuf,
    },

    /// Validate, place and start a batch of instances, then supervise them
    /// until Ctrl-C.
    Submit {
        /// Instance batch file (YAML or TOML).
        specs: PathBuf,

        /// Manual placement, e.g. `chat:A,embed:B`.
        #[arg(long)]
        placement: Option<String>,

        /// Start the feasible instances even if some cannot be placed.
        #[arg(long)]
        allow_partial: bool,

        /// Serve the status API on this port.
        #[arg(long)]
        status_port: Option<u16>,

        /// Deploy this bundle to every node before starting.
        #[arg(long)]
        bundle: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetd=debug,fleetgrid=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::ValidateConfig => validate_config(&cli.config),
        Command::HealthCheck => health_check(&cli.config, cli.json).await,
        Command::DeployAll { bundle } => deploy_all(&cli.config, &bundle).await,
        Command::Submit {
            specs,
            placement,
            allow_partial,
            status_port,
            bundle,
        } => {
            supervise::run(supervise::SubmitArgs {
                config: cli.config,
                specs,
                placement,
                allow_partial,
                status_port,
                bundle,
                json: cli.json,
            })
            .await
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<ClusterConfig> {
    let config = ClusterConfig::from_file(path)
        .with_context(|| format!("loading cluster file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn validate_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let budget = config.budget_settings();
    println!(
        "{}: {} node(s), safety margin {:.0}%, overhead x{:.2}",
        path.display(),
        config.nodes.len(),
        budget.safety_margin * 100.0,
        budget.overhead_factor
    );
    for node in config.nodes() {
        println!(
            "  {:<16} {:<24} {:>6.1}GB usable  gpu={}  max={}",
            node.node_id,
            node.host,
            node.usable_ram_gb(budget.safety_margin),
            node.gpu_available,
            node.max_instances
        );
    }
    Ok(())
}

async fn health_check(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let orchestrator = ClusterOrchestrator::from_config(&config)?;
    let checks = orchestrator.health_check_all().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&checks)?);
    } else {
        print!("{}", render_checks(&checks));
    }
    let unhealthy = checks.iter().filter(|c| !c.healthy).count();
    if unhealthy > 0 {
        bail!("{unhealthy} of {} node(s) unhealthy", checks.len());
    }
    Ok(())
}

fn render_checks(checks: &[NodeCheck]) -> String {
    let mut out = format!("{:<16} {:<9} {:>10} {:>6}  {}\n", "NODE", "STATUS", "FREE", "LOAD", "ERROR");
    for c in checks {
        out.push_str(&format!(
            "{:<16} {:<9} {:>10} {:>6}  {}\n",
            c.node_id,
            if c.healthy { "healthy" } else { "DOWN" },
            c.ram_available_gb
                .map(|gb| format!("{gb:.1}GB"))
                .unwrap_or_else(|| "-".to_string()),
            c.load
                .map(|l| format!("{l:.2}"))
                .unwrap_or_else(|| "-".to_string()),
            c.error.as_deref().unwrap_or(""),
        ));
    }
    out
}

async fn deploy_all(path: &Path, bundle: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let orchestrator = ClusterOrchestrator::from_config(&config)?;
    supervise::deploy(&orchestrator, bundle).await?;
    info!(bundle = %bundle.display(), "bundle deployed to every node");
    Ok(())
}
