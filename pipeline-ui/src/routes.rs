//! HTTP route handlers for the monitor API.
//!
//! Every handler goes through the read-mode store snapshot, so the monitor
//! inherits backup recovery and never observes a partially written
//! manifest. The writer is never blocked: readers take no lock.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, Json};
use axum::routing::get;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use pipeline::core::stats::aggregate;
use pipeline::io::store::{OpenMode, Store};
use pipeline::manifest::RunManifest;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/manifest", get(get_manifest))
        .route("/stats", get(get_stats))
        .route("/items", get(list_items))
        .route("/items/{id}", get(get_item))
        .route("/config", get(get_config))
        .route("/report", get(get_report))
}

async fn health() -> &'static str {
    "ok"
}

fn snapshot(state: &AppState) -> Result<RunManifest, StatusCode> {
    if !state.manifest_path().exists() {
        return Err(StatusCode::NOT_FOUND);
    }
    let store =
        Store::open(&state.run_dir, OpenMode::Read).map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    store
        .snapshot()
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

/// GET /api/manifest - the full run snapshot.
async fn get_manifest(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let manifest = snapshot(&state)?;
    serde_json::to_value(&manifest)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// GET /api/stats - derived statistics over the snapshot.
async fn get_stats(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let manifest = snapshot(&state)?;
    let stats = aggregate(&manifest, Utc::now());
    serde_json::to_value(&stats)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Serialize)]
struct ItemSummary {
    id: String,
    source_path: String,
    kind: String,
    settled: bool,
    failed: bool,
    results: usize,
}

#[derive(Serialize)]
struct ItemsResponse {
    run_id: String,
    items: Vec<ItemSummary>,
}

/// GET /api/items - item summaries in processing order.
async fn list_items(State(state): State<AppState>) -> Result<Json<ItemsResponse>, StatusCode> {
    let manifest = snapshot(&state)?;
    let items = manifest
        .ordered_item_ids()
        .iter()
        .filter_map(|id| manifest.items.get(id))
        .map(|item| ItemSummary {
            id: item.id.clone(),
            source_path: item.source_path.to_string_lossy().into_owned(),
            kind: match serde_json::to_value(item.kind) {
                Ok(Value::String(kind)) => kind,
                _ => "unknown".to_string(),
            },
            settled: item.is_settled(),
            failed: item.has_failed_step(),
            results: item.results.len(),
        })
        .collect();
    Ok(Json(ItemsResponse {
        run_id: manifest.run_id,
        items,
    }))
}

/// GET /api/items/:id - one full item record.
async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let manifest = snapshot(&state)?;
    let item = manifest.items.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    serde_json::to_value(item)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// GET /api/config - run configuration as JSON.
async fn get_config(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let path = state.config_path();
    if !path.exists() {
        return Err(StatusCode::NOT_FOUND);
    }
    let contents = std::fs::read_to_string(&path).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let value: toml::Value =
        toml::from_str(&contents).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    serde_json::to_value(value)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// GET /api/report - the rendered HTML report.
async fn get_report(State(state): State<AppState>) -> Result<Html<String>, StatusCode> {
    let path = state.report_path();
    if !path.exists() {
        return Err(StatusCode::NOT_FOUND);
    }
    std::fs::read_to_string(&path)
        .map(Html)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
