//! Durable task records in the `crawler_tasks` table.
//!
//! The durable layer is authoritative for history; running tasks live in
//! memory and sync here on status/stage transitions and every tenth
//! completed chapter.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::task::{TaskSnapshot, TaskStatus};

#[derive(Debug, Clone)]
pub struct TaskRow {
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
}

impl TaskRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Self {
        Self {
            task_id: row.get("task_id"),
            config_filename: row.get("config_filename"),
            book_id: row.get("book_id"),
            max_workers: row.get("max_workers"),
            use_proxy: row.get("use_proxy"),
            status: TaskStatus::parse(row.get::<String, _>("status").as_str()),
            stage: row.get("stage"),
            detail: row.get("detail"),
            create_time: row.get("create_time"),
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            total_chapters: row.get("total_chapters"),
            completed_chapters: row.get("completed_chapters"),
            failed_chapters: row.get("failed_chapters"),
            current_chapter: row.get("current_chapter"),
            document_title: row.get("document_title"),
            document_author: row.get("document_author"),
            error_message: row.get("error_message"),
        }
    }

    /// History view of a durable row; logs only exist in memory.
    pub fn into_snapshot(self) -> TaskSnapshot {
        let progress_percent = if self.total_chapters > 0 {
            let ratio = self.completed_chapters as f64 / self.total_chapters as f64;
            (ratio * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        TaskSnapshot {
            task_id: self.task_id,
            config_filename: self.config_filename,
            book_id: self.book_id,
            max_workers: self.max_workers,
            use_proxy: self.use_proxy,
            status: self.status,
            stage: self.stage,
            detail: self.detail,
            create_time: self.create_time,
            start_time: self.start_time,
            end_time: self.end_time,
            total_chapters: self.total_chapters,
            completed_chapters: self.completed_chapters,
            failed_chapters: self.failed_chapters,
            current_chapter: self.current_chapter,
            document_title: self.document_title,
            document_author: self.document_author,
            error_message: self.error_message,
            progress_percent,
            log_count: 0,
        }
    }
}

const COLUMNS: &str = "task_id, config_filename, book_id, max_workers, use_proxy, status, stage, \
                       detail, create_time, start_time, end_time, total_chapters, \
                       completed_chapters, failed_chapters, current_chapter, document_title, \
                       document_author, error_message";

#[derive(Clone)]
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, snapshot: &TaskSnapshot) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawler_tasks
                (task_id, config_filename, book_id, max_workers, use_proxy,
                 status, stage, detail, create_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(snapshot.task_id)
        .bind(&snapshot.config_filename)
        .bind(&snapshot.book_id)
        .bind(snapshot.max_workers)
        .bind(snapshot.use_proxy)
        .bind(snapshot.status.as_str())
        .bind(&snapshot.stage)
        .bind(&snapshot.detail)
        .bind(snapshot.create_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update(&self, snapshot: &TaskSnapshot) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crawler_tasks SET
                status = $2, stage = $3, detail = $4,
                start_time = $5, end_time = $6,
                total_chapters = $7, completed_chapters = $8, failed_chapters = $9,
                current_chapter = $10, document_title = $11, document_author = $12,
                error_message = $13
            WHERE task_id = $1
            "#,
        )
        .bind(snapshot.task_id)
        .bind(snapshot.status.as_str())
        .bind(&snapshot.stage)
        .bind(&snapshot.detail)
        .bind(snapshot.start_time)
        .bind(snapshot.end_time)
        .bind(snapshot.total_chapters)
        .bind(snapshot.completed_chapters)
        .bind(snapshot.failed_chapters)
        .bind(&snapshot.current_chapter)
        .bind(&snapshot.document_title)
        .bind(&snapshot.document_author)
        .bind(&snapshot.error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, task_id: Uuid) -> sqlx::Result<Option<TaskRow>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM crawler_tasks WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(TaskRow::from_row))
    }

    pub async fn list(&self, limit: i64) -> sqlx::Result<Vec<TaskRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM crawler_tasks ORDER BY create_time DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(TaskRow::from_row).collect())
    }

    pub async fn delete(&self, task_id: Uuid) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM crawler_tasks WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_completed(&self) -> sqlx::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM crawler_tasks WHERE status IN ('completed', 'failed', 'stopped')",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Force a row to `stopped` without touching memory; used for zombie
    /// tasks whose process is gone.
    pub async fn mark_stopped(&self, task_id: Uuid, detail: &str) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crawler_tasks
            SET status = 'stopped', end_time = now(), detail = $2
            WHERE task_id = $1 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// On startup, no durable row can legitimately be `running`: this
    /// process owns every live task. Reclaim leftovers from a crash.
    pub async fn reclaim_running(&self) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crawler_tasks
            SET status = 'stopped', end_time = now(), detail = 'reclaimed at startup'
            WHERE status = 'running'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
