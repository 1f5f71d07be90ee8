//! In-memory document store for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{word_count, ChapterRecord, DocumentRecord, DocumentStore, NewDocument, StoreError};

#[derive(Default)]
struct Inner {
    next_id: i64,
    documents: HashMap<i64, DocumentRecord>,
    chapters: HashMap<(i64, i32), ChapterRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, id: i64) -> Option<DocumentRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.documents.get(&id).cloned()
    }

    /// Chapters of a document ordered by `chapter_num`.
    pub fn chapters_of(&self, document_id: i64) -> Vec<ChapterRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut chapters: Vec<_> = inner
            .chapters
            .values()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chapters.sort_by_key(|c| c.chapter_num);
        chapters
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert_document(&self, doc: &NewDocument) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inner
            .documents
            .values()
            .find(|d| d.source_url == doc.source_url)
        {
            return Ok(existing.id);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let now = Utc::now();
        inner.documents.insert(
            id,
            DocumentRecord {
                id,
                title: doc.title.clone(),
                author: doc.author.clone(),
                cover_url: doc.cover_url.clone(),
                source_url: doc.source_url.clone(),
                site_name: doc.site_name.clone(),
                total_chapters: 0,
                total_words: 0,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn upsert_chapter(
        &self,
        document_id: i64,
        chapter_num: i32,
        title: &str,
        content: &str,
        source_url: &str,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let fresh_id = inner.next_id;
        let entry = inner
            .chapters
            .entry((document_id, chapter_num))
            .or_insert_with(|| ChapterRecord {
                id: fresh_id,
                document_id,
                chapter_num,
                title: String::new(),
                content: String::new(),
                source_url: String::new(),
                word_count: 0,
                created_at: Utc::now(),
            });
        entry.title = title.to_string();
        entry.content = content.to_string();
        entry.source_url = source_url.to_string();
        entry.word_count = word_count(content);
        Ok(entry.id)
    }

    async fn recompute_document_stats(&self, document_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (count, words) = inner
            .chapters
            .values()
            .filter(|c| c.document_id == document_id)
            .fold((0i32, 0i64), |(n, w), c| (n + 1, w + c.word_count as i64));
        if let Some(doc) = inner.documents.get_mut(&document_id) {
            doc.total_chapters = count;
            doc.total_words = words;
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_document_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .documents
            .values()
            .find(|d| d.source_url == source_url)
            .cloned())
    }

    async fn delete_document(&self, document_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.documents.remove(&document_id);
        inner.chapters.retain(|(doc, _), _| *doc != document_id);
        Ok(())
    }

    async fn delete_empty_chapters(&self, document_id: i64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.chapters.len();
        inner
            .chapters
            .retain(|(doc, _), c| *doc != document_id || c.word_count > 0);
        Ok((before - inner.chapters.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_document_never_duplicates_on_source_url() {
        let store = MemoryStore::new();
        let doc = NewDocument {
            title: "t".into(),
            author: None,
            cover_url: None,
            source_url: "https://x/book/1".into(),
            site_name: "x".into(),
        };
        let a = store.upsert_document(&doc).await.unwrap();
        let b = store.upsert_document(&doc).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn upsert_chapter_is_last_writer_wins_per_position() {
        let store = MemoryStore::new();
        let doc = store
            .upsert_document(&NewDocument {
                title: "t".into(),
                author: None,
                cover_url: None,
                source_url: "u".into(),
                site_name: "s".into(),
            })
            .await
            .unwrap();

        let first = store.upsert_chapter(doc, 1, "old", "aaa", "u1").await.unwrap();
        let second = store.upsert_chapter(doc, 1, "new", "bbbb", "u1b").await.unwrap();
        assert_eq!(first, second);

        let chapters = store.chapters_of(doc);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "new");
        assert_eq!(chapters[0].word_count, 4);
    }

    #[tokio::test]
    async fn deleting_a_document_cascades_to_its_chapters() {
        let store = MemoryStore::new();
        let doc = store
            .upsert_document(&NewDocument {
                title: "t".into(),
                author: None,
                cover_url: None,
                source_url: "u".into(),
                site_name: "s".into(),
            })
            .await
            .unwrap();
        store.upsert_chapter(doc, 1, "a", "body", "u1").await.unwrap();

        store.delete_document(doc).await.unwrap();
        assert!(store.document(doc).is_none());
        assert!(store.chapters_of(doc).is_empty());
    }

    #[tokio::test]
    async fn stats_recomputation_matches_chapter_rows() {
        let store = MemoryStore::new();
        let doc = store
            .upsert_document(&NewDocument {
                title: "t".into(),
                author: None,
                cover_url: None,
                source_url: "u".into(),
                site_name: "s".into(),
            })
            .await
            .unwrap();
        store.upsert_chapter(doc, 1, "a", "烽火连城", "u1").await.unwrap();
        store.upsert_chapter(doc, 2, "b", "ab", "u2").await.unwrap();
        store.recompute_document_stats(doc).await.unwrap();

        let record = store.document(doc).unwrap();
        assert_eq!(record.total_chapters, 2);
        assert_eq!(record.total_words, 6);
    }
}
