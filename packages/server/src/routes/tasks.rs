//! Task resources: creation, lifecycle verbs, logs, and cleanup.

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use crawl_engine::book_id_from_url;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use super::{configs, ApiError};
use crate::app::AppState;
use crate::supervisor::{CreateTask, LogEntry, SupervisorError, TaskSnapshot};

impl From<SupervisorError> for ApiError {
    fn from(error: SupervisorError) -> Self {
        match error {
            SupervisorError::NotFound => ApiError::not_found("task not found"),
            SupervisorError::AlreadyRunning => ApiError::conflict("task is already running"),
        }
    }
}

pub async fn list_tasks(
    Extension(state): Extension<AppState>,
) -> Json<Vec<TaskSnapshot>> {
    Json(state.supervisor.list_tasks().await)
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub config_filename: String,
    #[serde(default)]
    pub book_id: Option<String>,
    #[serde(default)]
    pub start_url: Option<String>,
    #[serde(default = "default_max_workers")]
    pub max_workers: i32,
    #[serde(default)]
    pub use_proxy: bool,
}

fn default_max_workers() -> i32 {
    5
}

pub async fn create_task(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let config_path = state.config_dir.join(&body.config_filename);
    if body.config_filename == configs::TEMPLATE_FILENAME
        || !tokio::fs::try_exists(&config_path).await.unwrap_or(false)
    {
        return Err(ApiError::bad_request("unknown config_filename"));
    }

    // Either an explicit book id or one derived from the start URL's path.
    let book_id = match (&body.book_id, &body.start_url) {
        (Some(book_id), _) if !book_id.trim().is_empty() => book_id.trim().to_string(),
        (_, Some(start_url)) => book_id_from_url(start_url).ok_or_else(|| {
            ApiError::bad_request("start_url contains no book id in its path")
        })?,
        _ => return Err(ApiError::bad_request("book_id or start_url is required")),
    };

    let task_id = state
        .supervisor
        .create_task(CreateTask {
            config_filename: body.config_filename,
            book_id,
            max_workers: body.max_workers,
            use_proxy: body.use_proxy,
        })
        .await;

    Ok((StatusCode::CREATED, Json(json!({ "task_id": task_id }))))
}

pub async fn get_task(
    Extension(state): Extension<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    state
        .supervisor
        .get_snapshot(task_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("task not found"))
}

pub async fn delete_task(
    Extension(state): Extension<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<JsonValue>, ApiError> {
    state.supervisor.delete_task(task_id).await?;
    Ok(Json(json!({ "deleted": true })))
}

pub async fn start_task(
    Extension(state): Extension<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<JsonValue>, ApiError> {
    state.supervisor.start_task(task_id).await?;
    Ok(Json(json!({ "started": true })))
}

pub async fn stop_task(
    Extension(state): Extension<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<JsonValue>, ApiError> {
    state.supervisor.stop_task(task_id).await?;
    Ok(Json(json!({ "stopping": true })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    100
}

pub async fn task_logs(
    Extension(state): Extension<AppState>,
    Path(task_id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    match state.supervisor.task_logs(task_id, query.limit) {
        Some(logs) => Ok(Json(logs)),
        // Durable tasks have no log ring; an empty list, not a 404.
        None => match state.supervisor.get_snapshot(task_id).await {
            Some(_) => Ok(Json(Vec::new())),
            None => Err(ApiError::not_found("task not found")),
        },
    }
}

pub async fn cleanup_completed(
    Extension(state): Extension<AppState>,
) -> Json<JsonValue> {
    let removed = state.supervisor.clear_completed().await;
    Json(json!({ "removed": removed }))
}
