//! Liveness and metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use echotap_core::{MetricsStore, PortPool};

use crate::channel_lifecycle::ChannelLifecycleManager;

/// Handles backing the status routes.
pub struct StatusState {
    pub metrics: Arc<MetricsStore>,
    pub ports: Arc<PortPool>,
    pub lifecycle: Arc<ChannelLifecycleManager>,
}

pub fn build_status_router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Process liveness only; always healthy while the process serves.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

async fn handle_metrics(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot(state.lifecycle.active_count());
    let mut body = serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({}));
    body["allocated_ports"] = json!(state.ports.in_use_count());
    (StatusCode::OK, Json(body))
}

pub async fn run_status_server(
    bind_addr: SocketAddr,
    state: Arc<StatusState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind status endpoint on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve status endpoint address")?;
    info!(addr = %local_addr, "status endpoint listening");

    axum::serve(listener, build_status_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
        .context("status endpoint exited unexpectedly")
}
