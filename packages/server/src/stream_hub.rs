//! In-process pub/sub hub for real-time task streaming.
//!
//! Topic-keyed broadcast channels carry typed task events to SSE
//! subscribers (and to whatever push transport fronts this service).
//! Topics are `task:{task_id}` strings; producers publish fire-and-forget.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::supervisor::{LogEntry, TaskSnapshot};

/// Events pushed to clients subscribed to a task.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStarted { task: TaskSnapshot },
    TaskProgress { task: TaskSnapshot },
    TaskLog { task_id: Uuid, entry: LogEntry },
    TaskStopped { task_id: Uuid },
}

impl TaskEvent {
    /// Wire-level event name, also used as the SSE event type.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::TaskStarted { .. } => "task_started",
            TaskEvent::TaskProgress { .. } => "task_progress",
            TaskEvent::TaskLog { .. } => "task_log",
            TaskEvent::TaskStopped { .. } => "task_stopped",
        }
    }
}

/// Canonical topic string for a task's event stream.
pub fn task_topic(task_id: Uuid) -> String {
    format!("task:{task_id}")
}

/// Thread-safe, cloneable hub. Publishing to a topic without subscribers
/// is a no-op.
#[derive(Clone)]
pub struct StreamHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<TaskEvent>>>>,
    capacity: usize,
}

impl StreamHub {
    /// Default capacity keeps a short backlog per channel (256 events).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn publish(&self, topic: &str, event: TaskEvent) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(topic) {
            // Send errors mean no active receivers; that is fine.
            let _ = tx.send(event);
        }
    }

    /// Subscribe to a topic, creating its channel on first use.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<TaskEvent> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Drop channels that lost all their subscribers.
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn log_event(task_id: Uuid) -> TaskEvent {
        TaskEvent::TaskLog {
            task_id,
            entry: LogEntry {
                timestamp: Utc::now(),
                level: "INFO".to_string(),
                message: "hello".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let hub = StreamHub::new();
        let task_id = Uuid::new_v4();
        let topic = task_topic(task_id);

        let mut rx = hub.subscribe(&topic).await;
        hub.publish(&topic, log_event(task_id)).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "task_log");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let hub = StreamHub::new();
        hub.publish("task:nobody", log_event(Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn cleanup_removes_abandoned_channels() {
        let hub = StreamHub::new();
        let rx = hub.subscribe("task:ephemeral").await;
        assert_eq!(hub.channels.read().await.len(), 1);

        drop(rx);
        hub.cleanup().await;
        assert_eq!(hub.channels.read().await.len(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives_the_event() {
        let hub = StreamHub::new();
        let task_id = Uuid::new_v4();
        let topic = task_topic(task_id);
        let mut rx1 = hub.subscribe(&topic).await;
        let mut rx2 = hub.subscribe(&topic).await;

        hub.publish(&topic, TaskEvent::TaskStopped { task_id }).await;

        assert_eq!(rx1.recv().await.unwrap().name(), "task_stopped");
        assert_eq!(rx2.recv().await.unwrap().name(), "task_stopped");
    }
}
