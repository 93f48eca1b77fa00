use std::path::Path;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    state::{SyncController, Trigger},
    types::{DeviceRecord, Progress, RunOutcome, Summary},
};

#[derive(Clone)]
pub struct AppState {
    sync: SyncController,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    /// Cancel an in-flight run and start over instead of ignoring the trigger.
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    started: bool,
    progress: Progress,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
    progress: Progress,
}

#[derive(Debug, Serialize)]
struct SpeakersResponse {
    run: u64,
    completed_at: String,
    outcome: RunOutcome,
    truncated: bool,
    summary: Summary,
    devices: Vec<DeviceRecord>,
}

/// Build the router (for testing without binding to a port).
pub fn router(sync: SyncController, ui_dir: impl AsRef<Path>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/progress", get(get_progress))
        .route("/sync", post(post_sync))
        .route("/sync/cancel", post(post_cancel))
        .route("/speakers", get(get_speakers))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(AppState { sync });

    let static_svc = ServeDir::new(ui_dir.as_ref()).append_index_html_on_directories(true);

    Router::new()
        .nest("/api", api)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, sync: SyncController, ui_dir: impl AsRef<Path>) -> Result<()> {
    let app = router(sync, ui_dir);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving dashboard on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

async fn get_progress(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.sync.progress().await))
}

async fn post_sync(State(app): State<AppState>, Query(q): Query<SyncQuery>) -> impl IntoResponse {
    let trigger = if q.restart {
        app.sync.restart().await
    } else {
        app.sync.trigger().await
    };
    let status = match &trigger {
        Trigger::Started(_) => StatusCode::ACCEPTED,
        Trigger::AlreadyRunning(_) => StatusCode::OK,
    };
    let body = TriggerResponse {
        started: trigger.started(),
        progress: trigger.progress().clone(),
    };
    (status, Json(body))
}

async fn post_cancel(State(app): State<AppState>) -> impl IntoResponse {
    let cancelled = app.sync.cancel().await;
    let status = if cancelled { StatusCode::ACCEPTED } else { StatusCode::OK };
    let progress = app.sync.progress().await;
    (status, Json(CancelResponse { cancelled, progress }))
}

async fn get_speakers(State(app): State<AppState>) -> impl IntoResponse {
    let Some(snapshot) = app.sync.latest().await else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let body = SpeakersResponse {
        run: snapshot.run,
        completed_at: snapshot.completed_at.clone(),
        outcome: snapshot.result.outcome,
        truncated: snapshot.result.truncated(),
        summary: snapshot.result.summary,
        devices: snapshot.devices(),
    };
    (StatusCode::OK, Json(body)).into_response()
}
