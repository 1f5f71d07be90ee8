//! Application state and router assembly.

use std::path::PathBuf;

use axum::extract::Extension;
use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::routes::{configs, health, stream, tasks};
use crate::stream_hub::StreamHub;
use crate::supervisor::TaskSupervisor;

/// Root context owning every process-scoped handle; passed down through
/// `Extension` instead of living in globals.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub hub: StreamHub,
    pub supervisor: TaskSupervisor,
    pub config_dir: PathBuf,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route(
            "/api/configs",
            get(configs::list_configs).post(configs::create_config),
        )
        .route("/api/configs/template", get(configs::get_template))
        .route(
            "/api/configs/:filename",
            get(configs::read_config)
                .put(configs::update_config)
                .delete(configs::delete_config),
        )
        .route("/api/configs/:filename/validate", post(configs::validate_config))
        .route("/api/configs/:filename/probe", post(configs::probe_config))
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/api/tasks/cleanup-completed", post(tasks::cleanup_completed))
        .route(
            "/api/tasks/:task_id",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route("/api/tasks/:task_id/start", post(tasks::start_task))
        .route("/api/tasks/:task_id/stop", post(tasks::stop_task))
        .route("/api/tasks/:task_id/logs", get(tasks::task_logs))
        .route("/api/streams/:topic", get(stream::stream_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
