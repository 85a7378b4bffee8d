//! fleetgrid-api — read-mostly status API for a running FleetGrid.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/instances` | Every managed instance |
//! | GET | `/api/v1/instances/{id}` | One instance |
//! | POST | `/api/v1/instances/{id}/stop` | Graceful stop, releases budget |
//! | GET | `/api/v1/instances/{id}/crashes` | Crash history, oldest first |
//! | GET | `/api/v1/instances/{id}/logs` | Streaming log tail (`?lines=N` to bound it) |
//! | GET | `/api/v1/nodes` | Node health and ledger |
//! | GET | `/api/v1/budget` | Ledger summary |

pub mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use fleetgrid_orchestrator::ClusterOrchestrator;
use tracing::info;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<ClusterOrchestrator>,
}

pub fn build_router(orchestrator: Arc<ClusterOrchestrator>) -> Router {
    let api_routes = Router::new()
        .route("/instances", get(handlers::list_instances))
        .route("/instances/{id}", get(handlers::get_instance))
        .route("/instances/{id}/stop", post(handlers::stop_instance))
        .route("/instances/{id}/crashes", get(handlers::list_crashes))
        .route("/instances/{id}/logs", get(handlers::stream_logs))
        .route("/nodes", get(handlers::list_nodes))
        .route("/budget", get(handlers::budget_report))
        .with_state(ApiState { orchestrator });

    Router::new().nest("/api/v1", api_routes)
}

/// Serve the status API until `shutdown` resolves.
pub async fn serve(
    orchestrator: Arc<ClusterOrchestrator>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "status API listening");
    axum::serve(listener, build_router(orchestrator))
        .with_graceful_shutdown(shutdown)
        .await
}
