//! Cross-process idempotency ledger: per-(site, book) success and failure
//! URL sets in Redis.
//!
//! Every operation is non-throwing. A ledger outage degrades to the
//! pessimistic answer ("not downloaded", "nothing recorded") so crawls keep
//! making progress without the skip optimization.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

pub const SUCCESS_TTL_SECS: i64 = 30 * 24 * 3600;
pub const FAILED_TTL_SECS: i64 = 7 * 24 * 3600;

/// Identity of one ledger scope. `site_name` is the config's `site.name`
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerKey {
    pub site_name: String,
    pub book_id: String,
}

impl LedgerKey {
    pub fn new(site_name: impl Into<String>, book_id: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            book_id: book_id.into(),
        }
    }

    pub fn success_key(&self) -> String {
        format!("success:{}:{}", self.site_name, self.book_id)
    }

    pub fn failed_key(&self) -> String {
        format!("failed:{}:{}", self.site_name, self.book_id)
    }
}

#[async_trait]
pub trait ChapterLedger: Send + Sync {
    /// Whether this chapter URL has already been persisted successfully.
    async fn is_success(&self, key: &LedgerKey, url: &str) -> bool;

    /// Record success: add to the success set, drop any failure record,
    /// refresh the success TTL.
    async fn mark_success(&self, key: &LedgerKey, url: &str);

    /// Record failure and refresh the failure TTL.
    async fn mark_failure(&self, key: &LedgerKey, url: &str);

    /// `(success_count, failure_count)` for the scope.
    async fn stats(&self, key: &LedgerKey) -> (u64, u64);

    /// Drop the failure set so failed chapters are retried on the next run.
    async fn clear_failures(&self, key: &LedgerKey);
}

/// Redis-backed ledger shared across processes.
pub struct RedisLedger {
    conn: ConnectionManager,
}

impl RedisLedger {
    pub async fn connect(redis_url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ChapterLedger for RedisLedger {
    async fn is_success(&self, key: &LedgerKey, url: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.sismember::<_, _, bool>(key.success_key(), url).await {
            Ok(member) => member,
            Err(e) => {
                warn!(error = %e, "ledger check failed, assuming not downloaded");
                false
            }
        }
    }

    async fn mark_success(&self, key: &LedgerKey, url: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .sadd(key.success_key(), url)
            .srem(key.failed_key(), url)
            .expire(key.success_key(), SUCCESS_TTL_SECS)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, url = %url, "failed to record chapter success in ledger");
        }
    }

    async fn mark_failure(&self, key: &LedgerKey, url: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .sadd(key.failed_key(), url)
            .expire(key.failed_key(), FAILED_TTL_SECS)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, url = %url, "failed to record chapter failure in ledger");
        }
    }

    async fn stats(&self, key: &LedgerKey) -> (u64, u64) {
        let mut conn = self.conn.clone();
        let success = conn
            .scard::<_, u64>(key.success_key())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "ledger stats unavailable");
                0
            });
        let failed = conn.scard::<_, u64>(key.failed_key()).await.unwrap_or(0);
        (success, failed)
    }

    async fn clear_failures(&self, key: &LedgerKey) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(key.failed_key()).await {
            warn!(error = %e, "failed to clear ledger failure set");
        }
    }
}

/// In-memory ledger used by tests and single-process runs without Redis.
#[derive(Default)]
pub struct MemoryLedger {
    sets: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the success set, e.g. to model an earlier completed run.
    pub fn seed_success(&self, key: &LedgerKey, urls: impl IntoIterator<Item = String>) {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.entry(key.success_key()).or_default().extend(urls);
    }

    pub fn failed_urls(&self, key: &LedgerKey) -> Vec<String> {
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.get(&key.failed_key())
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChapterLedger for MemoryLedger {
    async fn is_success(&self, key: &LedgerKey, url: &str) -> bool {
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.get(&key.success_key()).is_some_and(|s| s.contains(url))
    }

    async fn mark_success(&self, key: &LedgerKey, url: &str) {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.entry(key.success_key()).or_default().insert(url.to_string());
        if let Some(failed) = sets.get_mut(&key.failed_key()) {
            failed.remove(url);
        }
    }

    async fn mark_failure(&self, key: &LedgerKey, url: &str) {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.entry(key.failed_key()).or_default().insert(url.to_string());
    }

    async fn stats(&self, key: &LedgerKey) -> (u64, u64) {
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        let count = |k: &str| sets.get(k).map_or(0, |s| s.len() as u64);
        (count(&key.success_key()), count(&key.failed_key()))
    }

    async fn clear_failures(&self, key: &LedgerKey) {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.remove(&key.failed_key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format_matches_the_shared_convention() {
        let key = LedgerKey::new("biquge", "41934");
        assert_eq!(key.success_key(), "success:biquge:41934");
        assert_eq!(key.failed_key(), "failed:biquge:41934");
    }

    #[tokio::test]
    async fn success_removes_a_prior_failure() {
        let ledger = MemoryLedger::new();
        let key = LedgerKey::new("site", "1");

        ledger.mark_failure(&key, "http://x/1").await;
        assert_eq!(ledger.stats(&key).await, (0, 1));

        ledger.mark_success(&key, "http://x/1").await;
        assert!(ledger.is_success(&key, "http://x/1").await);
        assert_eq!(ledger.stats(&key).await, (1, 0));
    }

    #[tokio::test]
    async fn clear_failures_empties_only_the_failure_set() {
        let ledger = MemoryLedger::new();
        let key = LedgerKey::new("site", "1");

        ledger.mark_success(&key, "http://x/1").await;
        ledger.mark_failure(&key, "http://x/2").await;
        ledger.clear_failures(&key).await;

        assert_eq!(ledger.stats(&key).await, (1, 0));
        assert!(ledger.is_success(&key, "http://x/1").await);
    }
}
