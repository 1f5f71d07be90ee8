//! In-memory task state: status, stage, counters, the stop latch, and the
//! bounded log ring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use crawl_engine::ProgressUpdate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The in-memory log ring keeps at most this many recent lines per task.
pub const MAX_TASK_LOGS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "stopped" => TaskStatus::Stopped,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Full serialized view of a task, served by the API and pushed over the
/// stream hub.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub config_filename: String,
    pub book_id: String,
    pub max_workers: i32,
    pub use_proxy: bool,
    pub status: TaskStatus,
    pub stage: String,
    pub detail: String,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_chapters: i32,
    pub completed_chapters: i32,
    pub failed_chapters: i32,
    pub current_chapter: String,
    pub document_title: Option<String>,
    pub document_author: Option<String>,
    pub error_message: Option<String>,
    pub progress_percent: f64,
    pub log_count: usize,
}

#[derive(Debug)]
struct TaskInner {
    status: TaskStatus,
    stage: String,
    detail: String,
    create_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    total_chapters: i32,
    completed_chapters: i32,
    failed_chapters: i32,
    current_chapter: String,
    document_title: Option<String>,
    document_author: Option<String>,
    error_message: Option<String>,
    logs: VecDeque<LogEntry>,
}

#[derive(Debug, Error)]
#[error("task is already running")]
pub struct AlreadyRunning;

pub struct TaskState {
    pub task_id: Uuid,
    pub config_filename: String,
    pub book_id: String,
    pub max_workers: i32,
    pub use_proxy: bool,
    stop: AtomicBool,
    inner: Mutex<TaskInner>,
}

impl TaskState {
    pub fn new(
        config_filename: String,
        book_id: String,
        max_workers: i32,
        use_proxy: bool,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            config_filename,
            book_id,
            max_workers,
            use_proxy,
            stop: AtomicBool::new(false),
            inner: Mutex::new(TaskInner {
                status: TaskStatus::Pending,
                stage: "pending".to_string(),
                detail: String::new(),
                create_time: Utc::now(),
                start_time: None,
                end_time: None,
                total_chapters: 0,
                completed_chapters: 0,
                failed_chapters: 0,
                current_chapter: String::new(),
                document_title: None,
                document_author: None,
                error_message: None,
                logs: VecDeque::new(),
            }),
        }
    }

    /// Rehydrate a task from its durable row (used to start a pending task
    /// that outlived a restart).
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        task_id: Uuid,
        config_filename: String,
        book_id: String,
        max_workers: i32,
        use_proxy: bool,
        status: TaskStatus,
        stage: String,
        create_time: DateTime<Utc>,
    ) -> Self {
        let state = Self::new(config_filename, book_id, max_workers, use_proxy);
        {
            let mut inner = state.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.status = status;
            inner.stage = stage;
            inner.create_time = create_time;
        }
        Self { task_id, ..state }
    }

    // Stop is a monotonic latch for the crawl's lifetime; it resets only
    // when a new run starts.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    /// Atomically transition pending/terminal -> running, clearing the stop
    /// latch and stamping the start time.
    pub fn begin_run(&self) -> Result<(), AlreadyRunning> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.status == TaskStatus::Running {
            return Err(AlreadyRunning);
        }
        self.stop.store(false, Ordering::SeqCst);
        inner.status = TaskStatus::Running;
        inner.start_time = Some(Utc::now());
        inner.end_time = None;
        inner.error_message = None;
        Ok(())
    }

    pub fn finish(&self, status: TaskStatus, error_message: Option<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.status = status;
        inner.end_time = Some(Utc::now());
        if error_message.is_some() {
            inner.error_message = error_message;
        }
    }

    pub fn add_log(&self, level: &str, message: &str) -> LogEntry {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.to_string(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.logs.push_back(entry.clone());
        while inner.logs.len() > MAX_TASK_LOGS {
            inner.logs.pop_front();
        }
        entry
    }

    /// Most recent `limit` log lines, oldest first.
    pub fn logs_tail(&self, limit: usize) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = inner.logs.len().saturating_sub(limit);
        inner.logs.iter().skip(skip).cloned().collect()
    }

    /// Fold a crawl progress callback into the task. Returns whether the
    /// durable row should be synced now: on stage changes, on total
    /// changes, and on every tenth completed chapter.
    pub fn apply_progress(&self, update: &ProgressUpdate) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let stage = update.stage.as_str();
        let stage_changed = inner.stage != stage;
        let total_changed = inner.total_chapters != update.total as i32;
        let completed_changed = inner.completed_chapters != update.completed as i32;

        inner.stage = stage.to_string();
        inner.detail = update.detail.clone();
        inner.total_chapters = update.total as i32;
        inner.completed_chapters = update.completed as i32;
        inner.failed_chapters = update.failed as i32;
        if !update.current_chapter.is_empty() {
            inner.current_chapter = update.current_chapter.clone();
        }
        if let Some(title) = &update.document_title {
            inner.document_title = Some(title.clone());
        }
        if let Some(author) = &update.document_author {
            inner.document_author = Some(author.clone());
        }

        stage_changed
            || total_changed
            || (completed_changed && update.completed % 10 == 0)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let progress_percent = if inner.total_chapters > 0 {
            let ratio = inner.completed_chapters as f64 / inner.total_chapters as f64;
            (ratio * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        TaskSnapshot {
            task_id: self.task_id,
            config_filename: self.config_filename.clone(),
            book_id: self.book_id.clone(),
            max_workers: self.max_workers,
            use_proxy: self.use_proxy,
            status: inner.status,
            stage: inner.stage.clone(),
            detail: inner.detail.clone(),
            create_time: inner.create_time,
            start_time: inner.start_time,
            end_time: inner.end_time,
            total_chapters: inner.total_chapters,
            completed_chapters: inner.completed_chapters,
            failed_chapters: inner.failed_chapters,
            current_chapter: inner.current_chapter.clone(),
            document_title: inner.document_title.clone(),
            document_author: inner.document_author.clone(),
            error_message: inner.error_message.clone(),
            progress_percent,
            log_count: inner.logs.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawl_engine::Stage;

    fn progress(stage: Stage, total: usize, completed: usize) -> ProgressUpdate {
        ProgressUpdate {
            stage,
            detail: String::new(),
            total,
            completed,
            failed: 0,
            current_chapter: String::new(),
            document_title: None,
            document_author: None,
        }
    }

    #[test]
    fn begin_run_rejects_a_running_task() {
        let task = TaskState::new("config_x.json".into(), "1".into(), 5, false);
        task.begin_run().unwrap();
        assert!(task.begin_run().is_err());

        task.finish(TaskStatus::Completed, None);
        assert!(task.begin_run().is_ok());
    }

    #[test]
    fn begin_run_clears_the_stop_latch() {
        let task = TaskState::new("config_x.json".into(), "1".into(), 5, false);
        task.request_stop();
        assert!(task.stop_requested());
        task.begin_run().unwrap();
        assert!(!task.stop_requested());
    }

    #[test]
    fn log_ring_is_bounded() {
        let task = TaskState::new("config_x.json".into(), "1".into(), 5, false);
        for i in 0..(MAX_TASK_LOGS + 10) {
            task.add_log("INFO", &format!("line {i}"));
        }
        let snapshot = task.snapshot();
        assert_eq!(snapshot.log_count, MAX_TASK_LOGS);

        let tail = task.logs_tail(5);
        assert_eq!(tail.len(), 5);
        assert_eq!(tail[4].message, format!("line {}", MAX_TASK_LOGS + 9));
    }

    #[test]
    fn sync_policy_fires_on_stage_change_and_every_tenth_chapter() {
        let task = TaskState::new("config_x.json".into(), "1".into(), 5, false);
        assert!(task.apply_progress(&progress(Stage::ParsingList, 0, 0)));
        // Same stage, no counter movement: no sync.
        assert!(!task.apply_progress(&progress(Stage::ParsingList, 0, 0)));
        // Total appears: sync.
        assert!(task.apply_progress(&progress(Stage::Downloading, 100, 0)));
        assert!(!task.apply_progress(&progress(Stage::Downloading, 100, 3)));
        assert!(task.apply_progress(&progress(Stage::Downloading, 100, 10)));
        assert!(!task.apply_progress(&progress(Stage::Downloading, 100, 11)));
    }

    #[test]
    fn snapshot_reports_percentage() {
        let task = TaskState::new("config_x.json".into(), "1".into(), 5, false);
        task.apply_progress(&progress(Stage::Downloading, 3, 2));
        let snapshot = task.snapshot();
        assert!((snapshot.progress_percent - 66.67).abs() < 0.01);
    }
}
