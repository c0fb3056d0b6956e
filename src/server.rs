use crate::cache::Refresher;
use crate::models::{Capabilities, UsageSnapshot};
use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub refresher: Refresher,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    pub provider: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub display_name: String,
    pub capabilities: Capabilities,
}

/// Same routes at the root and under `/api/v1`
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/usage", get(usage))
        .route("/providers", get(providers));

    Router::new()
        .merge(api.clone())
        .nest("/api/v1", api)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn usage(State(state): State<AppState>, Query(query): Query<UsageQuery>) -> impl IntoResponse {
    let (snapshots, cache_status) = match state.refresher.cache.get() {
        Some(cached) => (cached, "HIT"),
        None => (state.refresher.refresh().await, "MISS"),
    };

    let filtered = filter_snapshots(
        &snapshots,
        non_empty(query.provider.as_deref()),
        non_empty(query.name.as_deref()),
    );
    let updated = state
        .refresher
        .cache
        .updated_at()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();
    (
        [("x-cache", cache_status.to_string()), ("x-cache-updated", updated)],
        Json(filtered),
    )
}

async fn providers(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    let infos = state
        .refresher
        .registry
        .all()
        .iter()
        .map(|p| ProviderInfo {
            id: p.id().to_string(),
            display_name: p.display_name().to_string(),
            capabilities: p.capabilities(),
        })
        .collect();
    Json(infos)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Keeps snapshots matching the provider id and subscription name, when given
pub fn filter_snapshots(
    snapshots: &[UsageSnapshot],
    provider: Option<&str>,
    name: Option<&str>,
) -> Vec<UsageSnapshot> {
    snapshots
        .iter()
        .filter(|s| provider.is_none_or(|p| s.provider_id == p))
        .filter(|s| name.is_none_or(|n| s.subscription_name == n))
        .cloned()
        .collect()
}

/// Fills the cache, starts the background refresher and serves until `stop`
/// fires. The refresher is stopped before returning.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    refresh_interval: Duration,
    stop: CancellationToken,
) -> Result<()> {
    let initial = state.refresher.refresh().await;
    info!(
        snapshots = initial.len(),
        ttl_secs = state.refresher.cache.ttl().as_secs(),
        "initial cache fill done"
    );

    let refresh_task = state.refresher.clone().spawn(refresh_interval, stop.child_token());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .await
        .context("HTTP server failed");

    stop.cancel();
    refresh_task.await.context("refresh task panicked")?;
    info!("server stopped");
    result
}
