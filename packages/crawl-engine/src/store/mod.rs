//! Relational persistence for documents and chapters.
//!
//! Uniqueness is enforced at the row level: `documents.source_url` is the
//! natural key and `(chapters.document_id, chapters.chapter_num)` keeps
//! concurrent workers from committing the same position twice.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Fields needed to create (or find) a document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub author: Option<String>,
    pub cover_url: Option<String>,
    pub source_url: String,
    pub site_name: String,
}

#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub cover_url: Option<String>,
    pub source_url: String,
    pub site_name: String,
    pub total_chapters: i32,
    pub total_words: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChapterRecord {
    pub id: i64,
    pub document_id: i64,
    pub chapter_num: i32,
    pub title: String,
    pub content: String,
    pub source_url: String,
    pub word_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Count content length in code points; this is what `word_count` stores.
pub fn word_count(content: &str) -> i32 {
    content.chars().count().try_into().unwrap_or(i32::MAX)
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a document or return the existing id for its `source_url`.
    async fn upsert_document(&self, doc: &NewDocument) -> Result<i64, StoreError>;

    /// Insert or update the chapter at `(document_id, chapter_num)`.
    /// Re-extraction overwrites title, content, source URL, and word count.
    async fn upsert_chapter(
        &self,
        document_id: i64,
        chapter_num: i32,
        title: &str,
        content: &str,
        source_url: &str,
    ) -> Result<i64, StoreError>;

    /// Recompute `total_chapters` and `total_words` from the chapter rows.
    async fn recompute_document_stats(&self, document_id: i64) -> Result<(), StoreError>;

    async fn find_document_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<DocumentRecord>, StoreError>;

    /// Delete a document; chapters go with it via the cascade.
    async fn delete_document(&self, document_id: i64) -> Result<(), StoreError>;

    /// Drop chapters that never received content (used by forced task
    /// deletion). Returns the number of rows removed.
    async fn delete_empty_chapters(&self, document_id: i64) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_count_is_code_points_not_bytes() {
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("abc"), 3);
        assert_eq!(word_count("第一章"), 3);
        assert_eq!(word_count("a第b二c"), 5);
    }
}
