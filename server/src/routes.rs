/// HTTP route handlers for the you-get-web GUI and its JSON API.
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::warn;

use you_get_web_shared::db;
use you_get_web_shared::errors::WebGuiError;
use you_get_web_shared::models::TaskStatus;

use crate::config::SETTINGS_PREFIX;
use crate::manager::{SubmitOptions, SubmitOutcome};
use crate::AppState;

/// GUI front page, compiled into the binary so the server ships as one file.
const INDEX_HTML: &str = include_str!("../assets/index.html");

// ====== REQUEST / RESPONSE TYPES ======

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<MessageResponse>) {
    (
        status,
        Json(MessageResponse {
            message: message.into(),
        }),
    )
}

#[derive(Deserialize)]
pub struct TasksQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct SubmitBody {
    /// Pasted text; every URL found in it becomes a task.
    pub urls: String,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub playlist: Option<bool>,
    #[serde(default)]
    pub stream_id: Option<String>,
    #[serde(default)]
    pub extractor_proxy: Option<String>,
    #[serde(default)]
    pub use_extractor_proxy: bool,
    #[serde(default = "default_merge")]
    pub merge: bool,
    #[serde(default)]
    pub priority: Option<i64>,
}

fn default_merge() -> bool {
    true
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<SubmitOutcome>,
}

#[derive(Deserialize)]
pub struct InfoBody {
    pub url: String,
    #[serde(default)]
    pub extractor_proxy: Option<String>,
}

#[derive(Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    100
}

// ====== GUI ======

/// GET /
pub async fn root() -> Redirect {
    Redirect::to("/html/")
}

/// GET /html/
pub async fn gui_page() -> Html<&'static str> {
    Html(INDEX_HTML)
}

// ====== META ======

/// GET /api/version
pub async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.manager.queue_stats().await;
    let counts = db::count_tasks(&state.pool).await.ok();
    Json(serde_json::json!({
        "queue": stats,
        "tasks": counts,
    }))
}

// ====== TASKS ======

/// POST /api/tasks
pub async fn submit_tasks(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, Json<MessageResponse>)> {
    if body.urls.trim().is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "No URLs supplied"));
    }

    let opts = SubmitOptions {
        output_dir: body.output_dir,
        playlist: body.playlist,
        stream_id: body.stream_id,
        extractor_proxy: body.extractor_proxy,
        use_extractor_proxy: body.use_extractor_proxy,
        merge: body.merge,
        priority: body.priority,
    };
    let results = state.manager.submit(&body.urls, &opts).await;
    if results.is_empty() {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "No URLs found in the submitted text",
        ));
    }

    let accepted = results.iter().filter(|r| r.accepted).count();
    let response = SubmitResponse {
        accepted,
        rejected: results.len() - accepted,
        results,
    };
    let code = if accepted > 0 {
        StatusCode::CREATED
    } else {
        StatusCode::CONFLICT
    };
    Ok((code, Json(response)))
}

/// GET /api/tasks
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<MessageResponse>)> {
    if let Some(s) = query.status.as_deref() {
        if TaskStatus::parse(s).is_none() {
            return Err(error_body(
                StatusCode::BAD_REQUEST,
                format!("Unknown status: {}", s),
            ));
        }
    }

    match state.manager.list_views(query.status.as_deref()).await {
        Ok(tasks) => Ok(Json(serde_json::json!({ "tasks": tasks }))),
        Err(e) => {
            warn!("Task listing failed: {}", e);
            Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// GET /api/tasks/:id
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<MessageResponse>)> {
    match state.manager.view(task_id).await {
        Ok(Some(detail)) => Ok(Json(serde_json::json!({ "task": detail }))),
        Ok(None) => Err(error_body(StatusCode::NOT_FOUND, "Task not found")),
        Err(e) => Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// POST /api/tasks/:id/stop
pub async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<Json<MessageResponse>, (StatusCode, Json<MessageResponse>)> {
    match state.manager.stop(task_id).await {
        Ok(true) => Ok(Json(MessageResponse {
            message: "Task stopped".to_string(),
        })),
        Ok(false) => Err(error_body(
            StatusCode::CONFLICT,
            "Task is not queued or running",
        )),
        Err(e) => Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// POST /api/tasks/:id/restart
pub async fn restart_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<Json<MessageResponse>, (StatusCode, Json<MessageResponse>)> {
    match state.manager.restart(task_id).await {
        Ok(true) => Ok(Json(MessageResponse {
            message: "Task requeued".to_string(),
        })),
        Ok(false) => Err(error_body(StatusCode::NOT_FOUND, "Task not found")),
        Err(e) => Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// DELETE /api/tasks/:id
pub async fn remove_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<Json<MessageResponse>, (StatusCode, Json<MessageResponse>)> {
    match state.manager.remove(task_id).await {
        Ok(true) => Ok(Json(MessageResponse {
            message: "Task removed".to_string(),
        })),
        Ok(false) => Err(error_body(StatusCode::NOT_FOUND, "Task not found")),
        Err(e) => Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// DELETE /api/tasks?status=done|error|stopped
pub async fn clear_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<MessageResponse>)> {
    let status = match query.status.as_deref().and_then(TaskStatus::parse) {
        Some(s @ (TaskStatus::Done | TaskStatus::Error | TaskStatus::Stopped)) => s,
        Some(_) => {
            return Err(error_body(
                StatusCode::BAD_REQUEST,
                "Only done, error, or stopped tasks can be cleared in bulk",
            ))
        }
        None => {
            return Err(error_body(
                StatusCode::BAD_REQUEST,
                "A status query parameter is required",
            ))
        }
    };

    match state.manager.clear_status(status).await {
        Ok(cleared) => Ok(Json(serde_json::json!({ "cleared": cleared }))),
        Err(e) => Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// GET /api/tasks/:id/file - stream the downloaded artifact to the browser.
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, Json<MessageResponse>)> {
    let detail = match state.manager.view(task_id).await {
        Ok(Some(detail)) => detail,
        Ok(None) => return Err(error_body(StatusCode::NOT_FOUND, "Task not found")),
        Err(e) => return Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };

    let Some(filepath) = detail.task.filepath else {
        return Err(error_body(StatusCode::NOT_FOUND, "Task has no file yet"));
    };
    let filename = std::path::Path::new(&filepath)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());

    let file = tokio::fs::File::open(&filepath).await.map_err(|e| {
        warn!("File for task {} not readable: {}", task_id, e);
        error_body(StatusCode::NOT_FOUND, "File not found on disk")
    })?;

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let content_type = content_type_for(&filename);
    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', "_"));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}

fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".mp4") || filename.ends_with(".m4v") {
        "video/mp4"
    } else if filename.ends_with(".webm") || filename.ends_with(".mkv") {
        "video/webm"
    } else if filename.ends_with(".flv") {
        "video/x-flv"
    } else if filename.ends_with(".mp3") {
        "audio/mpeg"
    } else if filename.ends_with(".m4a") || filename.ends_with(".aac") {
        "audio/mp4"
    } else {
        "application/octet-stream"
    }
}

// ====== MEDIA INFO ======

/// POST /api/info - probe a URL for its title and available formats.
pub async fn media_info(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InfoBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<MessageResponse>)> {
    let url = body.url.trim().to_string();
    if url.is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "URL is required"));
    }

    match state.manager.probe(&url, body.extractor_proxy).await {
        Ok(info) => Ok(Json(serde_json::json!({ "info": info }))),
        Err(e) => {
            warn!("Probe of {} failed: {}", url, e);
            // engine trouble is the upstream's fault, anything else is ours
            let code = match &e {
                WebGuiError::Engine(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err(error_body(code, e.to_string()))
        }
    }
}

// ====== ACTIVITY LOG ======

/// GET /api/log
pub async fn activity_log(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Json<serde_json::Value> {
    let entries = state.events.tail(query.limit).await;
    Json(serde_json::json!({ "entries": entries }))
}

// ====== SETTINGS ======

/// GET /api/settings
pub async fn get_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<MessageResponse>)> {
    match db::settings_with_prefix(&state.pool, SETTINGS_PREFIX).await {
        Ok(pairs) => {
            let map: serde_json::Map<String, serde_json::Value> = pairs
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            Ok(Json(serde_json::json!({ "settings": map })))
        }
        Err(e) => Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// PUT /api/settings - upsert the supplied keys, other keys stay untouched.
pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Json<MessageResponse>, (StatusCode, Json<MessageResponse>)> {
    if body.is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "No settings supplied"));
    }

    for (key, value) in &body {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let db_key = format!("{}{}", SETTINGS_PREFIX, key);
        if let Err(e) = db::set_setting(&state.pool, &db_key, &value).await {
            return Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    }

    Ok(Json(MessageResponse {
        message: format!("Saved {} setting(s)", body.len()),
    }))
}
