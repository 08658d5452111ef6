//! Read-only JSON API over stored forecast runs.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{TimeDelta, Utc};
use lfc_core::RunSeries;
use lfc_storage::{RunStore, StoreError};
use lfc_sync::{connect_store, StoreConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "lfc-web";

pub const DEFAULT_FEED: &str = "7day";
const DEFAULT_SINCE_HOURS: i64 = 12;
const MAX_SINCE_HOURS: i64 = 168;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub default_area: String,
}

impl AppState {
    pub fn new(store: Arc<dyn RunStore>, default_area: impl Into<String>) -> Self {
        Self {
            store,
            default_area: default_area.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LatestQuery {
    feed: Option<String>,
    area: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    feed: Option<String>,
    area: Option<String>,
    since_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RunsResponse {
    pub feed: String,
    pub area: String,
    pub runs: Vec<RunSeries>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/latest", get(latest_handler))
        .route("/api/runs", get(runs_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = StoreConfig::from_env()?;
    let store = Arc::new(connect_store(&config).await?);
    serve(AppState::new(store.clone(), config.area.clone()), config.web_port).await?;
    store.close().await;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn latest_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LatestQuery>,
) -> Response {
    let feed = query.feed.unwrap_or_else(|| DEFAULT_FEED.to_string());
    let area = query.area.unwrap_or_else(|| state.default_area.clone());
    match state.store.latest_run(&feed, &area).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => Json(json!({})).into_response(),
        Err(err) => server_error(err),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let since_hours = query.since_hours.unwrap_or(DEFAULT_SINCE_HOURS);
    if !(1..=MAX_SINCE_HOURS).contains(&since_hours) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("since_hours must be between 1 and {MAX_SINCE_HOURS}")
            })),
        )
            .into_response();
    }

    let feed = query.feed.unwrap_or_else(|| DEFAULT_FEED.to_string());
    let area = query.area.unwrap_or_else(|| state.default_area.clone());
    let since = Utc::now() - TimeDelta::hours(since_hours);
    match state.store.runs_since(&feed, &area, since).await {
        Ok(runs) => Json(RunsResponse { feed, area, runs }).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "read query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
