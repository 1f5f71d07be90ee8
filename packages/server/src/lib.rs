//! Control plane for the extraction engine: task supervision, durable task
//! records, a resource-oriented HTTP API, and real-time task streaming.

pub mod app;
pub mod config;
pub mod routes;
pub mod stream_hub;
pub mod supervisor;

pub use app::{build_app, AppState};
pub use config::ServerConfig;
pub use stream_hub::{task_topic, StreamHub, TaskEvent};
pub use supervisor::{CreateTask, TaskSupervisor};
