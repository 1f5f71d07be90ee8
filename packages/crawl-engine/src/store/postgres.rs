//! Postgres-backed document store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::warn;

use super::{word_count, DocumentRecord, DocumentStore, NewDocument, StoreError};

const MAX_ATTEMPTS: u32 = 3;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

/// Retry a short transaction on transient connection loss, with doubling
/// backoff, bounded at [`MAX_ATTEMPTS`]. The closure must hand back an
/// owned future (clone the pool and inputs in).
async fn with_backoff<T, F, Fut>(operation: &str, mut run: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut delay = Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < MAX_ATTEMPTS && is_transient(&e) => {
                warn!(operation, attempt, error = %e, "transient database error, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn document_from_row(row: &sqlx::postgres::PgRow) -> DocumentRecord {
    DocumentRecord {
        id: row.get("id"),
        title: row.get("title"),
        author: row.get("author"),
        cover_url: row.get("cover_url"),
        source_url: row.get("source_url"),
        site_name: row.get("site_name"),
        total_chapters: row.get("total_chapters"),
        total_words: row.get("total_words"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn upsert_document(&self, doc: &NewDocument) -> Result<i64, StoreError> {
        let pool = self.pool.clone();
        let doc = doc.clone();
        with_backoff("upsert_document", move || {
            let pool = pool.clone();
            let doc = doc.clone();
            async move {
                let row = sqlx::query(
                    r#"
                    INSERT INTO documents (title, author, cover_url, source_url, site_name)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (source_url) DO UPDATE SET updated_at = now()
                    RETURNING id
                    "#,
                )
                .bind(&doc.title)
                .bind(&doc.author)
                .bind(&doc.cover_url)
                .bind(&doc.source_url)
                .bind(&doc.site_name)
                .fetch_one(&pool)
                .await?;
                Ok(row.get("id"))
            }
        })
        .await
    }

    async fn upsert_chapter(
        &self,
        document_id: i64,
        chapter_num: i32,
        title: &str,
        content: &str,
        source_url: &str,
    ) -> Result<i64, StoreError> {
        let pool = self.pool.clone();
        let words = word_count(content);
        let title = title.to_string();
        let content = content.to_string();
        let source_url = source_url.to_string();
        with_backoff("upsert_chapter", move || {
            let pool = pool.clone();
            let title = title.clone();
            let content = content.clone();
            let source_url = source_url.clone();
            async move {
                let row = sqlx::query(
                    r#"
                    INSERT INTO chapters
                        (document_id, chapter_num, title, content, source_url, word_count)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (document_id, chapter_num) DO UPDATE SET
                        title = EXCLUDED.title,
                        content = EXCLUDED.content,
                        source_url = EXCLUDED.source_url,
                        word_count = EXCLUDED.word_count
                    RETURNING id
                    "#,
                )
                .bind(document_id)
                .bind(chapter_num)
                .bind(&title)
                .bind(&content)
                .bind(&source_url)
                .bind(words)
                .fetch_one(&pool)
                .await?;
                Ok(row.get("id"))
            }
        })
        .await
    }

    async fn recompute_document_stats(&self, document_id: i64) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        with_backoff("recompute_document_stats", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE documents SET
                        total_chapters = stats.chapter_count,
                        total_words = stats.word_total,
                        updated_at = now()
                    FROM (
                        SELECT count(*)::int AS chapter_count,
                               coalesce(sum(word_count), 0)::bigint AS word_total
                        FROM chapters
                        WHERE document_id = $1
                    ) AS stats
                    WHERE documents.id = $1
                    "#,
                )
                .bind(document_id)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    async fn find_document_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        let pool = self.pool.clone();
        let source_url = source_url.to_string();
        with_backoff("find_document_by_source_url", move || {
            let pool = pool.clone();
            let source_url = source_url.clone();
            async move {
                let row = sqlx::query(
                    r#"
                    SELECT id, title, author, cover_url, source_url, site_name,
                           total_chapters, total_words, created_at, updated_at
                    FROM documents
                    WHERE source_url = $1
                    "#,
                )
                .bind(&source_url)
                .fetch_optional(&pool)
                .await?;
                Ok(row.as_ref().map(document_from_row))
            }
        })
        .await
    }

    async fn delete_document(&self, document_id: i64) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        with_backoff("delete_document", move || {
            let pool = pool.clone();
            async move {
                sqlx::query("DELETE FROM documents WHERE id = $1")
                    .bind(document_id)
                    .execute(&pool)
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn delete_empty_chapters(&self, document_id: i64) -> Result<u64, StoreError> {
        let pool = self.pool.clone();
        with_backoff("delete_empty_chapters", move || {
            let pool = pool.clone();
            async move {
                let result =
                    sqlx::query("DELETE FROM chapters WHERE document_id = $1 AND word_count = 0")
                        .bind(document_id)
                        .execute(&pool)
                        .await?;
                Ok(result.rows_affected())
            }
        })
        .await
    }
}
