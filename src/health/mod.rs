//! Minimal status surface for external orchestration.
//!
//! Exposes `GET /health`, `GET /metrics` (Prometheus text) and
//! `POST /shutdown` (graceful drain). Consumed by deployment tooling,
//! not by any dashboard.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::lifecycle::LifecycleState;
use crate::metrics;
use crate::scheduler::job::CampaignType;
use crate::scheduler::worker_pool::{process_memory_mb, SharedPoolStats};

/// Shared state behind the status endpoints.
#[derive(Clone)]
pub struct StatusState {
    pub worker_id: String,
    pub started_at: Instant,
    pub max_memory_mb: u64,
    pub state_rx: watch::Receiver<LifecycleState>,
    pub stats: Arc<SharedPoolStats>,
    pub campaigns: Vec<CampaignType>,
    pub shutdown_tx: mpsc::Sender<()>,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub worker_id: String,
    pub uptime_seconds: u64,
    pub memory: MemoryReport,
    pub active_jobs: usize,
    pub consumers: Vec<ConsumerReport>,
}

#[derive(Debug, Serialize)]
pub struct MemoryReport {
    pub used_mb: u64,
    pub max_mb: u64,
}

#[derive(Debug, Serialize)]
pub struct ConsumerReport {
    #[serde(rename = "type")]
    pub campaign_type: &'static str,
    pub queue_name: &'static str,
    pub status: &'static str,
}

/// Builds the status router.
pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

/// Binds the status server on the given port and serves it in the
/// background.
pub async fn serve(state: StatusState, port: u16) -> std::io::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Status endpoint bound");

    let app = router(state);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Status server terminated");
        }
    }))
}

async fn health(State(state): State<StatusState>) -> Json<HealthReport> {
    let lifecycle = *state.state_rx.borrow();
    let status = match lifecycle {
        LifecycleState::Ready => "healthy",
        LifecycleState::Starting => "starting",
        LifecycleState::Draining | LifecycleState::Stopped => "shutting_down",
    };
    let consumer_status = match lifecycle {
        LifecycleState::Ready => "running",
        LifecycleState::Starting => "starting",
        LifecycleState::Draining => "draining",
        LifecycleState::Stopped => "stopped",
    };

    Json(HealthReport {
        status,
        worker_id: state.worker_id.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        memory: MemoryReport {
            used_mb: process_memory_mb().unwrap_or(0),
            max_mb: state.max_memory_mb,
        },
        active_jobs: state.stats.active_jobs(),
        consumers: state
            .campaigns
            .iter()
            .map(|campaign| ConsumerReport {
                campaign_type: campaign.as_str(),
                queue_name: campaign.queue_name(),
                status: consumer_status,
            })
            .collect(),
    })
}

async fn metrics_text() -> String {
    metrics::export_metrics()
}

async fn shutdown(State(state): State<StatusState>) -> Json<serde_json::Value> {
    info!("Shutdown requested via status endpoint");
    let _ = state.shutdown_tx.send(()).await;
    Json(serde_json::json!({ "status": "draining" }))
}
