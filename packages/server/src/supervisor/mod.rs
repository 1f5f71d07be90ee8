//! Task supervision: lifecycle, the in-memory registry, durable sync, and
//! event forwarding onto the stream hub.
//!
//! The supervisor owns the receiving side of the crawl callbacks. Crawl
//! workers send progress/log events over a channel; a forwarder task folds
//! them into the in-memory state, publishes them to subscribers, and syncs
//! the durable row per the bounded-write policy.

mod store;
mod task;

pub use store::{TaskRow, TaskStore};
pub use task::{LogEntry, TaskSnapshot, TaskState, TaskStatus, MAX_TASK_LOGS};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use crawl_engine::{
    ChapterLedger, CrawlObserver, CrawlOutcome, Crawler, DocumentStore, Fetcher, LogLevel,
    ProgressUpdate, ProxyProvider, SiteConfig,
};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::stream_hub::{task_topic, StreamHub, TaskEvent};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("task not found")]
    NotFound,
    #[error("task is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct CreateTask {
    pub config_filename: String,
    pub book_id: String,
    pub max_workers: i32,
    pub use_proxy: bool,
}

struct TaskEntry {
    state: Arc<TaskState>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
    task_store: TaskStore,
    hub: StreamHub,
    ledger: Arc<dyn ChapterLedger>,
    documents: Arc<dyn DocumentStore>,
    config_dir: PathBuf,
    proxy: Option<Arc<dyn ProxyProvider>>,
}

#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

impl TaskSupervisor {
    pub fn new(
        pool: PgPool,
        hub: StreamHub,
        ledger: Arc<dyn ChapterLedger>,
        documents: Arc<dyn DocumentStore>,
        config_dir: PathBuf,
        proxy: Option<Arc<dyn ProxyProvider>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                task_store: TaskStore::new(pool),
                hub,
                ledger,
                documents,
                config_dir,
                proxy,
            }),
        }
    }

    /// Startup reclaim: durable rows still marked `running` belong to a
    /// previous process and are forced to `stopped`.
    pub async fn reclaim_zombies(&self) {
        match self.inner.task_store.reclaim_running().await {
            Ok(0) => {}
            Ok(reclaimed) => info!(reclaimed, "reclaimed zombie tasks at startup"),
            Err(e) => warn!(error = %e, "zombie reclaim failed"),
        }
    }

    pub async fn create_task(&self, params: CreateTask) -> Uuid {
        let state = Arc::new(TaskState::new(
            params.config_filename,
            params.book_id,
            params.max_workers.max(1),
            params.use_proxy,
        ));
        let task_id = state.task_id;

        if let Err(e) = self.inner.task_store.insert(&state.snapshot()).await {
            // The in-memory task still works; history just loses this row.
            warn!(%task_id, error = %e, "failed to persist new task");
        }
        let mut tasks = self.lock_tasks();
        tasks.insert(task_id, TaskEntry { state, handle: None });
        info!(%task_id, "task created");
        task_id
    }

    pub async fn get_snapshot(&self, task_id: Uuid) -> Option<TaskSnapshot> {
        if let Some(state) = self.memory_state(task_id) {
            return Some(state.snapshot());
        }
        match self.inner.task_store.get(task_id).await {
            Ok(row) => row.map(TaskRow::into_snapshot),
            Err(e) => {
                warn!(%task_id, error = %e, "durable task lookup failed");
                None
            }
        }
    }

    /// Union of durable history and live in-memory tasks; memory wins for
    /// anything currently loaded.
    pub async fn list_tasks(&self) -> Vec<TaskSnapshot> {
        let mut by_id: HashMap<Uuid, TaskSnapshot> = HashMap::new();
        match self.inner.task_store.list(100).await {
            Ok(rows) => {
                for row in rows {
                    by_id.insert(row.task_id, row.into_snapshot());
                }
            }
            Err(e) => warn!(error = %e, "listing durable tasks failed"),
        }
        {
            let tasks = self.lock_tasks();
            for entry in tasks.values() {
                by_id.insert(entry.state.task_id, entry.state.snapshot());
            }
        }
        let mut snapshots: Vec<_> = by_id.into_values().collect();
        snapshots.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        snapshots
    }

    pub async fn start_task(&self, task_id: Uuid) -> Result<(), SupervisorError> {
        let state = match self.memory_state(task_id) {
            Some(state) => state,
            None => self.load_into_memory(task_id).await?,
        };

        state.begin_run().map_err(|_| SupervisorError::AlreadyRunning)?;
        let entry = state.add_log("INFO", &format!("task started: {}", state.config_filename));
        self.sync_to_store(&state).await;
        self.inner
            .hub
            .publish(&task_topic(task_id), TaskEvent::TaskStarted { task: state.snapshot() })
            .await;
        self.inner
            .hub
            .publish(&task_topic(task_id), TaskEvent::TaskLog { task_id, entry })
            .await;

        let supervisor = self.clone();
        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            supervisor.run_task(task_state).await;
        });

        let mut tasks = self.lock_tasks();
        if let Some(entry) = tasks.get_mut(&task_id) {
            entry.handle = Some(handle);
        }
        Ok(())
    }

    /// Set the stop latch. Idempotent; a task unknown to memory but marked
    /// `running` in the durable store (a zombie) is forced to `stopped`.
    pub async fn stop_task(&self, task_id: Uuid) -> Result<(), SupervisorError> {
        if let Some(state) = self.memory_state(task_id) {
            if state.status() == TaskStatus::Running {
                state.request_stop();
                let entry = state.add_log("WARNING", "stop requested");
                self.inner
                    .hub
                    .publish(&task_topic(task_id), TaskEvent::TaskLog { task_id, entry })
                    .await;
                info!(%task_id, "stop requested");
            }
            return Ok(());
        }

        match self.inner.task_store.mark_stopped(task_id, "forced stop").await {
            Ok(true) => {
                warn!(%task_id, "forced durable stop of unclaimed task");
                Ok(())
            }
            Ok(false) => match self.inner.task_store.get(task_id).await {
                Ok(Some(_)) => Ok(()),
                _ => Err(SupervisorError::NotFound),
            },
            Err(e) => {
                warn!(%task_id, error = %e, "durable stop failed");
                Err(SupervisorError::NotFound)
            }
        }
    }

    /// Forceful delete: best-effort stop, a short join, then removal from
    /// both layers. Chapters that never received content are cleaned from
    /// the associated document.
    pub async fn delete_task(&self, task_id: Uuid) -> Result<(), SupervisorError> {
        let entry = {
            let mut tasks = self.lock_tasks();
            tasks.remove(&task_id)
        };

        let mut known = entry.is_some();
        if let Some(entry) = entry {
            if entry.state.status() == TaskStatus::Running {
                entry.state.request_stop();
                if let Some(handle) = entry.handle {
                    if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                        warn!(%task_id, "crawl did not drain within 2s, deleting anyway");
                    }
                }
            }
            self.cleanup_partial_chapters(&entry.state).await;
        }

        match self.inner.task_store.delete(task_id).await {
            Ok(deleted) => known = known || deleted,
            Err(e) => warn!(%task_id, error = %e, "durable task delete failed"),
        }

        if known {
            info!(%task_id, "task deleted");
            Ok(())
        } else {
            Err(SupervisorError::NotFound)
        }
    }

    pub fn task_logs(&self, task_id: Uuid, limit: usize) -> Option<Vec<LogEntry>> {
        self.memory_state(task_id).map(|state| state.logs_tail(limit))
    }

    /// Purge terminal tasks from both layers; returns how many went away.
    pub async fn clear_completed(&self) -> u64 {
        let from_memory = {
            let mut tasks = self.lock_tasks();
            let terminal: Vec<Uuid> = tasks
                .iter()
                .filter(|(_, entry)| entry.state.status().is_terminal())
                .map(|(id, _)| *id)
                .collect();
            for id in &terminal {
                tasks.remove(id);
            }
            terminal.len() as u64
        };
        let from_store = match self.inner.task_store.clear_completed().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "durable cleanup failed");
                0
            }
        };
        from_memory.max(from_store)
    }

    async fn run_task(&self, state: Arc<TaskState>) {
        let task_id = state.task_id;
        let outcome = self.execute_crawl(state.clone()).await;

        let (status, error) = match outcome {
            Ok(CrawlOutcome::Completed) => (TaskStatus::Completed, None),
            Ok(CrawlOutcome::Stopped) => (TaskStatus::Stopped, None),
            Err(e) => {
                warn!(%task_id, error = %e, "crawl failed");
                (TaskStatus::Failed, Some(format!("{e:#}")))
            }
        };

        let closing = match status {
            TaskStatus::Completed => ("SUCCESS", "task completed"),
            TaskStatus::Stopped => ("WARNING", "task stopped"),
            _ => ("ERROR", "task failed"),
        };
        let entry = state.add_log(closing.0, closing.1);
        state.finish(status, error);
        self.sync_to_store(&state).await;

        let topic = task_topic(task_id);
        self.inner
            .hub
            .publish(&topic, TaskEvent::TaskLog { task_id, entry })
            .await;
        self.inner
            .hub
            .publish(&topic, TaskEvent::TaskProgress { task: state.snapshot() })
            .await;
        if status == TaskStatus::Stopped {
            self.inner
                .hub
                .publish(&topic, TaskEvent::TaskStopped { task_id })
                .await;
        }
        info!(%task_id, status = status.as_str(), "task finished");
    }

    async fn execute_crawl(&self, state: Arc<TaskState>) -> anyhow::Result<CrawlOutcome> {
        let path = self.inner.config_dir.join(&state.config_filename);
        let config =
            Arc::new(SiteConfig::load(&path).with_context(|| {
                format!("loading site config {}", state.config_filename)
            })?);

        let proxy = state.use_proxy.then(|| self.inner.proxy.clone()).flatten();
        let fetcher = Arc::new(Fetcher::new(&config, proxy).context("building http client")?);

        let (events, rx) = mpsc::unbounded_channel();
        let observer = Arc::new(ChannelObserver { events, state: state.clone() });
        let forwarder = tokio::spawn(self.clone().forward_events(rx, state.clone()));

        let crawler = Crawler::new(
            config,
            fetcher,
            self.inner.ledger.clone(),
            self.inner.documents.clone(),
            observer,
            state.book_id.clone(),
            state.max_workers.max(1) as usize,
        );
        let outcome = crawler.run().await;
        drop(crawler);
        let _ = forwarder.await;
        outcome.map_err(Into::into)
    }

    async fn forward_events(self, mut rx: mpsc::UnboundedReceiver<CrawlEvent>, state: Arc<TaskState>) {
        let topic = task_topic(state.task_id);
        while let Some(event) = rx.recv().await {
            match event {
                CrawlEvent::Progress(update) => {
                    let needs_sync = state.apply_progress(&update);
                    self.inner
                        .hub
                        .publish(&topic, TaskEvent::TaskProgress { task: state.snapshot() })
                        .await;
                    if needs_sync {
                        self.sync_to_store(&state).await;
                    }
                }
                CrawlEvent::Log { level, message } => {
                    let entry = state.add_log(level, &message);
                    self.inner
                        .hub
                        .publish(
                            &topic,
                            TaskEvent::TaskLog { task_id: state.task_id, entry },
                        )
                        .await;
                }
            }
        }
    }

    async fn sync_to_store(&self, state: &TaskState) {
        if let Err(e) = self.inner.task_store.update(&state.snapshot()).await {
            warn!(task_id = %state.task_id, error = %e, "task sync to durable store failed");
        }
    }

    /// Deleting a task also drops its document's never-downloaded chapters,
    /// so a re-created task starts from a clean slate.
    async fn cleanup_partial_chapters(&self, state: &TaskState) {
        let path = self.inner.config_dir.join(&state.config_filename);
        let Ok(config) = SiteConfig::load(&path) else {
            return;
        };
        let Some(source_url) = config.build_url("book_detail", &[("book_id", &state.book_id)])
        else {
            return;
        };
        match self.inner.documents.find_document_by_source_url(&source_url).await {
            Ok(Some(doc)) => match self.inner.documents.delete_empty_chapters(doc.id).await {
                Ok(0) => {}
                Ok(removed) => info!(document_id = doc.id, removed, "cleaned empty chapters"),
                Err(e) => warn!(error = %e, "empty-chapter cleanup failed"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "document lookup during delete failed"),
        }
    }

    async fn load_into_memory(&self, task_id: Uuid) -> Result<Arc<TaskState>, SupervisorError> {
        let row = self
            .inner
            .task_store
            .get(task_id)
            .await
            .map_err(|e| {
                warn!(%task_id, error = %e, "durable task lookup failed");
                SupervisorError::NotFound
            })?
            .ok_or(SupervisorError::NotFound)?;

        let state = Arc::new(TaskState::from_parts(
            row.task_id,
            row.config_filename,
            row.book_id,
            row.max_workers,
            row.use_proxy,
            row.status,
            row.stage,
            row.create_time,
        ));
        let mut tasks = self.lock_tasks();
        let entry = tasks
            .entry(task_id)
            .or_insert(TaskEntry { state, handle: None });
        Ok(entry.state.clone())
    }

    fn memory_state(&self, task_id: Uuid) -> Option<Arc<TaskState>> {
        self.lock_tasks().get(&task_id).map(|entry| entry.state.clone())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, TaskEntry>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum CrawlEvent {
    Progress(ProgressUpdate),
    Log { level: &'static str, message: String },
}

/// Crawl-side callback handle: forwards everything over the channel and
/// answers `should_stop` from the task's latch.
struct ChannelObserver {
    events: mpsc::UnboundedSender<CrawlEvent>,
    state: Arc<TaskState>,
}

impl CrawlObserver for ChannelObserver {
    fn on_progress(&self, update: &ProgressUpdate) {
        let _ = self.events.send(CrawlEvent::Progress(update.clone()));
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        let _ = self.events.send(CrawlEvent::Log {
            level: level.as_str(),
            message: message.to_string(),
        });
    }

    fn should_stop(&self) -> bool {
        self.state.stop_requested()
    }
}
