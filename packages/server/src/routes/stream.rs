//! SSE shell over the stream hub.
//!
//! `GET /api/streams/task:{task_id}` subscribes to one task's event topic
//! and forwards hub events as SSE. The richer push transport fronting this
//! service consumes the same hub.

use std::convert::Infallible;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::app::AppState;

pub async fn stream_handler(
    Extension(state): Extension<AppState>,
    Path(topic): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    // Only task topics exist; the id must be a well-formed UUID.
    let task_id = topic
        .strip_prefix("task:")
        .ok_or(StatusCode::BAD_REQUEST)?;
    Uuid::parse_str(task_id).map_err(|_| StatusCode::BAD_REQUEST)?;

    let rx = state.hub.subscribe(&topic).await;

    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("ok")) });

    let events = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => Event::default()
                .event(event.name())
                .json_data(&event)
                .ok()
                .map(Ok),
            Err(BroadcastStreamRecvError::Lagged(missed)) => Event::default()
                .event("lagged")
                .json_data(&serde_json::json!({ "missed": missed }))
                .ok()
                .map(Ok),
        }
    });

    Ok(Sse::new(connected.chain(events)).keep_alive(KeepAlive::default()))
}
