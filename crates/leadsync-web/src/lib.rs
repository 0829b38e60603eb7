//! Axum JSON API over the lead store and the sync orchestrator.

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leadsync_storage::LeadQuery;
use leadsync_sync::{CycleOutcome, SyncOrchestrator};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "leadsync-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthData {
    status: &'static str,
    sync_running: bool,
    policy: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/leads", get(leads_handler))
        .route("/api/leads/{proposal_number}", get(lead_detail_handler))
        .route("/api/dashboard/stats", get(stats_handler))
        .route("/api/duplicates", get(duplicates_handler))
        .route("/api/export", get(export_handler))
        .route("/api/sync/history", get(sync_history_handler))
        .route("/api/sync/refresh", post(sync_refresh_handler))
        .route("/api/sync/test-connection", get(test_connection_handler))
        .with_state(Arc::new(state))
}

/// Serve the API until ctrl-c.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler unavailable");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn failure(status: StatusCode, message: &str, err: impl Display) -> Response {
    if status.is_server_error() {
        error!(%status, error = %err, "{message}");
    }
    (
        status,
        Json(json!({ "success": false, "message": message, "error": err.to_string() })),
    )
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    ok(HealthData {
        status: "ok",
        sync_running: state.orchestrator.is_running(),
        policy: state.orchestrator.policy().to_string(),
    })
}

async fn leads_handler(State(state): State<Arc<AppState>>, Query(query): Query<LeadQuery>) -> Response {
    match state.orchestrator.store().list_leads(&query).await {
        Ok(page) => ok(page),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to list leads", err),
    }
}

async fn lead_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(proposal_number): Path<String>,
) -> Response {
    match state.orchestrator.store().lead_versions(&proposal_number).await {
        Ok(versions) if versions.is_empty() => failure(
            StatusCode::NOT_FOUND,
            "lead not found",
            format!("no record with proposal number {proposal_number}"),
        ),
        Ok(versions) => ok(versions),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to load lead", err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.store().stats().await {
        Ok(stats) => ok(stats),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to load stats", err),
    }
}

async fn duplicates_handler(State(state): State<Arc<AppState>>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match state.orchestrator.store().duplicate_summary(limit).await {
        Ok(groups) => ok(groups),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to load duplicates", err),
    }
}

async fn export_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.store().export_leads().await {
        Ok(records) => ok(records),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to export leads", err),
    }
}

async fn sync_history_handler(State(state): State<Arc<AppState>>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    match state.orchestrator.store().recent_run_logs(limit).await {
        Ok(runs) => ok(runs),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to load sync history", err),
    }
}

async fn sync_refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.run_cycle().await {
        CycleOutcome::Completed(log) => ok(log),
        CycleOutcome::AlreadyRunning => failure(
            StatusCode::CONFLICT,
            "sync already in progress",
            "a sync cycle is currently running; try again later",
        ),
    }
}

async fn test_connection_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.retriever().test_connection().await {
        Ok(()) => ok(json!({ "connected": true })),
        Err(err) => failure(StatusCode::BAD_GATEWAY, "mail server connection failed", err),
    }
}
